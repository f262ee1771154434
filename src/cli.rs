use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::geometry::Point;
use crate::locator::{rectangled_name, DEFAULT_RECTANGLED_SUFFIX};
use crate::pipeline::{PipelineConfig, Stage};
use crate::transform::DEFAULT_RANSAC_THRESHOLD;

#[derive(Parser, Debug)]
#[command(name = "scanprep")]
#[command(version, about = "Deskew annotated document photos and build augmented training crops")]
pub struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Choose the object a worker annotates (pre-annotation hook)
    PreAnnotate {
        /// Annotation round: 1 = corners, 2 = bounding boxes
        #[arg(long, value_parser = parse_stage)]
        stage: Stage,

        /// Pre-annotation event JSON
        event: PathBuf,

        /// Suffix of rectangled image names
        #[arg(long, default_value = DEFAULT_RECTANGLED_SUFFIX)]
        suffix: String,
    },

    /// Deskew every image of a finished corner-annotation round
    Rectify(StageArgs),

    /// Crop and augment every box of a finished box-annotation round
    Augment(StageArgs),

    /// Deskew a single local image from four corners
    Deskew(DeskewArgs),
}

#[derive(Args, Debug)]
pub struct StageArgs {
    /// Post-annotation event JSON (manifest locator and label attribute)
    pub event: PathBuf,

    /// Directory holding one subdirectory per bucket
    #[arg(long)]
    pub store: PathBuf,

    /// Reprojection tolerance for homography fitting, in pixels
    #[arg(long, default_value_t = DEFAULT_RANSAC_THRESHOLD)]
    pub threshold: f64,

    /// Suffix of rectangled image names
    #[arg(long, default_value = DEFAULT_RECTANGLED_SUFFIX)]
    pub suffix: String,

    /// Key prefix for generated training crops
    #[arg(long, default_value = crate::augment::DEFAULT_TRAINING_PREFIX)]
    pub prefix: String,
}

impl StageArgs {
    pub fn config(&self) -> PipelineConfig {
        PipelineConfig {
            ransac_threshold: self.threshold,
            rectangled_suffix: self.suffix.clone(),
            training_prefix: self.prefix.clone(),
            ..PipelineConfig::default()
        }
    }
}

#[derive(Args, Debug)]
pub struct DeskewArgs {
    /// Input image path
    #[arg(required = true)]
    pub input: PathBuf,

    /// Four corners as x,y pairs, in any order
    #[arg(long, num_args = 4, required = true, value_parser = parse_point)]
    pub corners: Vec<Point>,

    /// Output path [default: input name with the rectangled suffix]
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Reprojection tolerance for homography fitting, in pixels
    #[arg(long, default_value_t = DEFAULT_RANSAC_THRESHOLD)]
    pub threshold: f64,

    /// Suffix of rectangled image names
    #[arg(long, default_value = DEFAULT_RECTANGLED_SUFFIX)]
    pub suffix: String,
}

impl DeskewArgs {
    pub fn output_path(&self) -> PathBuf {
        self.output.clone().unwrap_or_else(|| {
            let name = self.input.file_name().unwrap_or_default().to_string_lossy();
            let parent = self.input.parent().unwrap_or(std::path::Path::new("."));
            parent.join(rectangled_name(&name, &self.suffix))
        })
    }
}

fn parse_stage(s: &str) -> Result<Stage, String> {
    match s {
        "1" | "corners" => Ok(Stage::Corners),
        "2" | "boxes" => Ok(Stage::Boxes),
        _ => Err(format!("Invalid stage '{}', expected 1 or 2", s)),
    }
}

fn parse_point(s: &str) -> Result<Point, String> {
    let parts: Vec<&str> = s.split(',').collect();
    if parts.len() != 2 {
        return Err(format!("Invalid corner '{}', expected X,Y", s));
    }

    let x: f64 = parts[0]
        .trim()
        .parse()
        .map_err(|_| format!("Invalid x coordinate: {}", parts[0]))?;
    let y: f64 = parts[1]
        .trim()
        .parse()
        .map_err(|_| format!("Invalid y coordinate: {}", parts[1]))?;

    Ok(Point::new(x, y))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_point() {
        assert_eq!(parse_point("12.5, 40").unwrap(), Point::new(12.5, 40.0));
        assert!(parse_point("12").is_err());
        assert!(parse_point("a,b").is_err());
    }

    #[test]
    fn test_parse_stage() {
        assert_eq!(parse_stage("1").unwrap(), Stage::Corners);
        assert_eq!(parse_stage("boxes").unwrap(), Stage::Boxes);
        assert!(parse_stage("3").is_err());
    }

    #[test]
    fn test_deskew_default_output_path() {
        let cli = Cli::parse_from([
            "scanprep", "deskew", "scans/page.jpg", "--corners", "0,0", "100,0", "0,50", "100,50",
        ]);
        let Command::Deskew(args) = cli.command else {
            panic!("expected deskew command");
        };
        assert_eq!(args.corners.len(), 4);
        assert_eq!(args.output_path(), PathBuf::from("scans/page-deskewed.jpg"));
    }

    #[test]
    fn test_stage_args_config() {
        let cli = Cli::parse_from([
            "scanprep", "--verbose", "augment", "event.json", "--store", "/data", "--prefix", "crops",
        ]);
        assert!(cli.verbose);
        let Command::Augment(args) = cli.command else {
            panic!("expected augment command");
        };
        let config = args.config();
        assert_eq!(config.training_prefix, "crops");
        assert_eq!(config.ransac_threshold, 3.0);
    }
}
