use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use image::{ImageFormat, ImageReader};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use scanprep::cli::{Cli, Command, DeskewArgs};
use scanprep::pipeline::{augment_stage, pre_annotate, rectify_stage, PipelineConfig};
use scanprep::storage::{encode_image, EncodeOptions, LocalStore};
use scanprep::{rectify, resolve_corners, CornerSet};

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read event file: {:?}", path))?;
    serde_json::from_str(&text).with_context(|| format!("Failed to parse event file: {:?}", path))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("Failed to serialize result")?;
    println!("{}", text);
    Ok(())
}

fn deskew(args: &DeskewArgs) -> Result<()> {
    let img = ImageReader::open(&args.input)
        .with_context(|| format!("Failed to open input file: {:?}", args.input))?
        .decode()
        .with_context(|| format!("Failed to decode image: {:?}", args.input))?;

    tracing::info!(
        input = ?args.input,
        width = img.width(),
        height = img.height(),
        "Loaded image"
    );

    let corners = resolve_corners(&CornerSet::from_slice(&args.corners)?)
        .context("Failed to order corners")?;
    tracing::debug!(?corners, "Resolved corner roles");

    let rectified = rectify(&img, &corners, args.threshold).context("Failed to rectify image")?;

    let output_path = args.output_path();
    let format = ImageFormat::from_path(&output_path)
        .with_context(|| format!("Unsupported output format: {:?}", output_path))?;
    let bytes = encode_image(&rectified, format, &EncodeOptions::default())
        .context("Failed to encode output")?;
    fs::write(&output_path, bytes)
        .with_context(|| format!("Failed to save output: {:?}", output_path))?;

    tracing::info!(
        output = ?output_path,
        "Dimensions: {}x{} -> {}x{}",
        img.width(),
        img.height(),
        rectified.width(),
        rectified.height()
    );
    print_json(&serde_json::json!({
        "output": output_path.display().to_string(),
        "width": rectified.width(),
        "height": rectified.height(),
    }))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match &cli.command {
        Command::PreAnnotate {
            stage,
            event,
            suffix,
        } => {
            let event = read_json(event)?;
            let config = PipelineConfig {
                rectangled_suffix: suffix.clone(),
                ..PipelineConfig::default()
            };
            let response =
                pre_annotate(&event, *stage, &config).context("Failed to prepare labeling task")?;
            print_json(&response)
        }
        Command::Rectify(args) => {
            let event = read_json(&args.event)?;
            let store = LocalStore::new(&args.store);
            let records = rectify_stage(&store, &event, &args.config())
                .context("Failed to rectify annotated images")?;
            print_json(&records)
        }
        Command::Augment(args) => {
            let event = read_json(&args.event)?;
            let store = LocalStore::new(&args.store);
            let records = augment_stage(&store, &event, &args.config())
                .context("Failed to generate training variants")?;
            print_json(&records)
        }
        Command::Deskew(args) => deskew(args),
    }
}
