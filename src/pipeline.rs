//! Stage drivers: everything between the labeling job's documents and the
//! core transforms.

use image::{DynamicImage, ImageFormat, Rgb};
use tracing::{info, instrument, warn};

use crate::annotation::{
    parse_bounding_boxes, parse_polygon, ConsolidatedRecord, ManifestItem, PostAnnotationEvent,
    PreAnnotationEvent, PreAnnotationResponse,
};
use crate::augment::{AugmentationCounter, VariantGenerator, DEFAULT_FACTORS, DEFAULT_TRAINING_PREFIX};
use crate::error::{PrepError, Result};
use crate::geometry::{resolve_corners, BoundingBox, CornerSet, Point};
use crate::locator::{Locator, DEFAULT_RECTANGLED_SUFFIX};
use crate::storage::{encode_image, load_image, EncodeOptions, ObjectStore};
use crate::transform::{extract_region, rectify, DEFAULT_RANSAC_THRESHOLD};

/// Which annotation round a task belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Workers mark the four document corners on the source photo
    Corners,
    /// Workers draw labeled boxes on the rectangled image
    Boxes,
}

/// Tunables shared by both stages
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub ransac_threshold: f64,
    pub rectangled_suffix: String,
    pub training_prefix: String,
    pub enhancement_factors: [f32; 2],
    /// Format of generated training crops
    pub variant_format: ImageFormat,
    pub encode: EncodeOptions,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ransac_threshold: DEFAULT_RANSAC_THRESHOLD,
            rectangled_suffix: DEFAULT_RECTANGLED_SUFFIX.to_string(),
            training_prefix: DEFAULT_TRAINING_PREFIX.to_string(),
            enhancement_factors: DEFAULT_FACTORS,
            variant_format: ImageFormat::Jpeg,
            encode: EncodeOptions::default(),
        }
    }
}

impl PipelineConfig {
    fn background(&self) -> Rgb<u8> {
        self.encode.background
    }
}

/// Pick the object a worker should annotate.
///
/// The second round annotates the rectangled copy written by the first, so
/// its task object is rewritten to that name. Inline text that is not a
/// locator has no rectangled copy and is passed through as is.
pub fn pre_annotate(event: &PreAnnotationEvent, stage: Stage, config: &PipelineConfig) -> Result<PreAnnotationResponse> {
    let Some(task_object) = event.data_object.task_object() else {
        warn!(
            job = event.labeling_job_arn.as_deref().unwrap_or("<unknown>"),
            "Data object has neither source nor source-ref; skipping human annotation"
        );
        return Ok(PreAnnotationResponse::new(None));
    };

    let task_object = match stage {
        Stage::Corners => task_object.to_string(),
        Stage::Boxes => match Locator::parse(task_object) {
            Ok(locator) => locator.rectangled(&config.rectangled_suffix).to_string(),
            Err(_) => {
                warn!(%task_object, "Task object is not a locator; passing it through unchanged");
                task_object.to_string()
            }
        },
    };
    info!(?stage, %task_object, "Prepared labeling task");
    Ok(PreAnnotationResponse::new(Some(task_object)))
}

fn load_manifest<S: ObjectStore + ?Sized>(store: &S, event: &PostAnnotationEvent) -> Result<Vec<ManifestItem>> {
    let locator = Locator::parse(&event.payload.s3_uri)?;
    let bytes = store.get(&locator)?;
    let items: Vec<ManifestItem> = serde_json::from_slice(&bytes)?;
    info!(%locator, items = items.len(), "Loaded annotation manifest");
    Ok(items)
}

/// The corner polygon of an item. When several annotations carry one, the
/// last wins.
fn item_vertices(item: &ManifestItem) -> Result<Vec<Point>> {
    let mut vertices = None;
    for annotation in &item.annotations {
        if let Some(found) = parse_polygon(&annotation.annotation_data.content)? {
            vertices = Some(found);
        }
    }
    vertices.ok_or_else(|| {
        PrepError::Annotation(format!(
            "no corner polygon for {}",
            item.data_object.s3_uri
        ))
    })
}

/// Every box of an item, in annotation order
fn item_boxes(item: &ManifestItem) -> Result<Vec<BoundingBox>> {
    let mut boxes = Vec::new();
    for annotation in &item.annotations {
        boxes.extend(parse_bounding_boxes(&annotation.annotation_data.content)?);
    }
    Ok(boxes)
}

/// First round: deskew every annotated photo and store the rectangled copy
/// next to it under the bucket root.
#[instrument(skip_all, fields(manifest = %event.payload.s3_uri))]
pub fn rectify_stage<S: ObjectStore + ?Sized>(
    store: &S,
    event: &PostAnnotationEvent,
    config: &PipelineConfig,
) -> Result<Vec<ConsolidatedRecord>> {
    let items = load_manifest(store, event)?;
    let mut records = Vec::with_capacity(items.len());

    for item in &items {
        let corner_set = CornerSet::from_slice(&item_vertices(item)?)?;
        let corners = resolve_corners(&corner_set)?;

        let source = Locator::parse(&item.data_object.s3_uri)?;
        let encoded = store.get(&source)?;
        let photo = image::load_from_memory(&encoded)?;
        let rectified = rectify(&photo, &corners, config.ransac_threshold)?;

        // Keep the source's format when the name has no usable extension.
        let target = source.rectangled(&config.rectangled_suffix);
        let format = match ImageFormat::from_path(&target.key) {
            Ok(format) => format,
            Err(_) => image::guess_format(&encoded)?,
        };
        let bytes = encode_image(&rectified, format, &config.encode)?;
        store.put(&target, &bytes)?;

        info!(
            %source,
            %target,
            width = rectified.width(),
            height = rectified.height(),
            "Rectified image"
        );
        records.push(ConsolidatedRecord::new(
            item.dataset_object_id.clone(),
            &target,
            &event.label_attribute_name,
        ));
    }

    Ok(records)
}

/// Second round: crop every labeled box out of its rectangled image and
/// write the augmented training variants.
///
/// One counter spans the whole invocation, and boxes are visited in manifest
/// order so names are reproducible. An item's variants are only written once
/// all of its boxes have been processed.
#[instrument(skip_all, fields(manifest = %event.payload.s3_uri))]
pub fn augment_stage<S: ObjectStore + ?Sized>(
    store: &S,
    event: &PostAnnotationEvent,
    config: &PipelineConfig,
) -> Result<Vec<ConsolidatedRecord>> {
    let items = load_manifest(store, event)?;
    let generator = VariantGenerator::new(config.training_prefix.clone(), config.enhancement_factors);
    let extension = config
        .variant_format
        .extensions_str()
        .first()
        .copied()
        .unwrap_or("img");
    let mut counter = AugmentationCounter::new();
    let mut records = Vec::with_capacity(items.len());

    for item in &items {
        let source = Locator::parse(&item.data_object.s3_uri)?;
        let rectangled = load_image(store, &source)?;
        let boxes = item_boxes(item)?;

        let mut pending = Vec::new();
        for bbox in &boxes {
            let region = extract_region(&rectangled, bbox, config.background())?;
            for variant in generator.generate(&mut counter, &bbox.label, region) {
                let target = source.with_key(format!("{}.{}", variant.name, extension));
                let bytes = encode_image(
                    &DynamicImage::ImageRgb8(variant.image),
                    config.variant_format,
                    &config.encode,
                )?;
                pending.push((target, bytes));
            }
        }

        for (target, bytes) in &pending {
            store.put(target, bytes)?;
        }
        info!(%source, boxes = boxes.len(), variants = pending.len(), "Wrote training variants");

        records.push(ConsolidatedRecord::new(
            item.dataset_object_id.clone(),
            &source,
            &event.label_attribute_name,
        ));
    }

    Ok(records)
}
