pub mod annotation;
pub mod augment;
pub mod cli;
pub mod error;
pub mod geometry;
pub mod locator;
pub mod pipeline;
pub mod storage;
pub mod transform;

pub use augment::{adjust, AugmentationCounter, Enhancement, Variant, VariantGenerator, Variants};
pub use cli::Cli;
pub use error::{PrepError, Result};
pub use geometry::{
    estimate_homography, resolve_corners, BoundingBox, CornerSet, Corners, Homography, Point,
};
pub use locator::{rectangled_name, Locator};
pub use transform::{extract_region, flatten_alpha, rectify};
