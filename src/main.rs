use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use svf::{enhance_layers, map_to_gray8, sub_window_smooth, to_rgb8, Smoother};

#[derive(Parser, Debug)]
#[command(name = "svf")]
#[command(about = "Edge-preserving local-contrast enhancement", long_about = None)]
struct Cli {
    #[arg(help = "Input image file path")]
    input: PathBuf,

    #[arg(help = "Output image file path (enhanced result)")]
    output: PathBuf,

    #[arg(short, long, value_enum, default_value = "single")]
    filter: Filter,

    /// Window radius for the fine scale (the medium scale uses 4x this)
    #[arg(short, long, default_value_t = 3)]
    radius: u32,

    /// Variance regularization for the fine scale (the medium scale uses 2x this)
    #[arg(short, long, default_value_t = 0.025)]
    epsilon: f32,

    /// Amplification factor for the medium detail layer
    #[arg(long, default_value_t = 2.0)]
    medium_amp: f32,

    /// Amplification factor for the fine detail layer
    #[arg(long, default_value_t = 3.0)]
    fine_amp: f32,

    /// Save the coarse base layer to a separate file
    #[arg(long)]
    base: Option<PathBuf>,

    /// Save the edge-preservation coefficient map to a separate file
    #[arg(long)]
    coefficient: Option<PathBuf>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Filter {
    Single,
    SubWindow,
}

impl From<Filter> for Smoother {
    fn from(filter: Filter) -> Self {
        match filter {
            Filter::Single => Smoother::SingleWindow,
            Filter::SubWindow => Smoother::SubWindow,
        }
    }
}

fn main() {
    let cli = Cli::parse();

    if cli.radius < 1 {
        eprintln!("Radius must be at least 1, got {}", cli.radius);
        std::process::exit(1);
    }

    if cli.epsilon <= 0.0 {
        eprintln!("Epsilon must be positive, got {}", cli.epsilon);
        std::process::exit(1);
    }

    let image = match image::open(&cli.input) {
        Ok(img) => img,
        Err(err) => {
            eprintln!("Failed to open {}: {err}", cli.input.display());
            std::process::exit(1);
        }
    };

    // Save the coefficient map if requested
    if let Some(coeff_path) = &cli.coefficient {
        let rgb = image.to_rgb32f();
        match sub_window_smooth(&rgb, cli.radius, cli.epsilon) {
            Ok((a_mean, _)) => {
                if let Err(err) = map_to_gray8(&a_mean).save(coeff_path) {
                    eprintln!(
                        "Failed to save coefficient map {}: {err}",
                        coeff_path.display()
                    );
                    std::process::exit(1);
                }
                println!("Saved coefficient map to {}", coeff_path.display());
            }
            Err(err) => {
                eprintln!("Failed to compute coefficient map: {err}");
                std::process::exit(1);
            }
        }
    }

    let layers = match enhance_layers(
        &image,
        cli.filter.into(),
        cli.radius,
        cli.epsilon,
        cli.medium_amp,
        cli.fine_amp,
    ) {
        Ok(layers) => layers,
        Err(err) => {
            eprintln!("Processing failed: {err}");
            std::process::exit(1);
        }
    };

    // Save the base layer if requested
    if let Some(base_path) = &cli.base {
        if let Err(err) = to_rgb8(&layers.base).save(base_path) {
            eprintln!("Failed to save base layer {}: {err}", base_path.display());
            std::process::exit(1);
        }
        println!("Saved base layer to {}", base_path.display());
    }

    if let Err(err) = to_rgb8(&layers.enhanced).save(&cli.output) {
        eprintln!("Failed to save {}: {err}", cli.output.display());
        std::process::exit(1);
    }
    println!("Saved result to {}", cli.output.display());
}
