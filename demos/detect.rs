//! Command-line demo for stampscan
//!
//! Detects stamps on an album page and prints the detection records as JSON

use stampscan::crop::{load_image, mat_to_rgb};
use stampscan::detection::visualize::annotate;
use stampscan::{DetectionPipeline, PipelineConfig};
use std::{env, path::{Path, PathBuf}, process};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let args: Vec<String> = env::args().collect();

    let mut config_path = None;
    let mut annotate_path = None;
    let mut image_path_arg = None;

    // Parse arguments
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "--annotate" if i + 1 >= args.len() => {
                eprintln!("Error: {} needs a path", args[i]);
                process::exit(1);
            }
            "--config" => {
                config_path = Some(PathBuf::from(&args[i + 1]));
                i += 1;
            }
            "--annotate" => {
                annotate_path = Some(PathBuf::from(&args[i + 1]));
                i += 1;
            }
            "--help" | "-h" => {
                print_help(&args[0]);
                process::exit(0);
            }
            arg if !arg.starts_with("--") => {
                if image_path_arg.is_none() {
                    image_path_arg = Some(PathBuf::from(arg));
                } else {
                    eprintln!("Error: Multiple image paths provided");
                    process::exit(1);
                }
            }
            _ => {
                eprintln!("Unknown option: {}", args[i]);
                eprintln!("Use --help for usage information");
                process::exit(1);
            }
        }
        i += 1;
    }

    let Some(image_path) = image_path_arg else {
        print_help(&args[0]);
        process::exit(1);
    };

    let config = match &config_path {
        Some(path) => PipelineConfig::from_json_file(path).unwrap_or_else(|e| fail(e)),
        None => PipelineConfig::default(),
    };

    let image = load_image(&image_path).unwrap_or_else(|e| fail(e));
    let pipeline = DetectionPipeline::new(config);
    let outcome = pipeline.detect_stamps(&image).unwrap_or_else(|e| fail(e));

    let (accepted, rejected) = outcome.records();
    let summary = serde_json::json!({
        "image": image_path.display().to_string(),
        "used_fallback": outcome.used_fallback(),
        "accepted": accepted,
        "rejected": rejected,
    });
    match serde_json::to_string_pretty(&summary) {
        Ok(json) => println!("{}", json),
        Err(e) => fail(e),
    }

    if let Some(path) = annotate_path {
        write_annotated(&image, &outcome, &path).unwrap_or_else(|e| fail(e));
        eprintln!("Annotated image written to {}", path.display());
    }
}

fn write_annotated(
    image: &opencv::core::Mat,
    outcome: &stampscan::DetectionOutcome,
    path: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let annotated = annotate(image, outcome)?;
    mat_to_rgb(&annotated)?.save(path)?;
    Ok(())
}

fn fail(error: impl std::fmt::Display) -> ! {
    eprintln!("Error: {}", error);
    process::exit(1);
}

fn print_help(program: &str) {
    println!("Usage: {} <image> [--config <pipeline.json>] [--annotate <output.png>]", program);
    println!();
    println!("Detects postage stamps on an album page image and prints JSON records.");
    println!("Set RUST_LOG=debug for per-candidate logging.");
}
