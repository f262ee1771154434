use std::collections::HashMap;
use std::iter::FusedIterator;

use image::{imageops, Rgb, RgbImage};

/// Default output prefix for generated training crops
pub const DEFAULT_TRAINING_PREFIX: &str = "training_data";

/// Enhancement factors applied to every kind: +20% then -20% around the
/// 1.0 identity.
pub const DEFAULT_FACTORS: [f32; 2] = [1.2, 0.8];

/// Variants per orientation: the base crop plus each kind at each factor
pub const VARIANTS_PER_ORIENTATION: usize = 1 + Enhancement::ALL.len() * DEFAULT_FACTORS.len();

/// Original and horizontally mirrored
pub const VARIANTS_PER_REGION: usize = 2 * VARIANTS_PER_ORIENTATION;

/// Photometric adjustment kinds.
///
/// Every kind interpolates between the image and a degenerate version of it:
/// a factor of 1.0 is the identity, 0.0 yields the degenerate image, and
/// factors above 1.0 extrapolate away from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Enhancement {
    /// Degenerate image is black
    Brightness,
    /// Degenerate image is flat grey at the mean luminance
    Contrast,
    /// Degenerate image is a 3x3 smoothed copy
    Sharpness,
}

impl Enhancement {
    pub const ALL: [Enhancement; 3] = [
        Enhancement::Brightness,
        Enhancement::Contrast,
        Enhancement::Sharpness,
    ];

    fn degenerate(self, img: &RgbImage) -> RgbImage {
        match self {
            Enhancement::Brightness => RgbImage::new(img.width(), img.height()),
            Enhancement::Contrast => {
                let mean = mean_luminance(img);
                RgbImage::from_pixel(img.width(), img.height(), Rgb([mean, mean, mean]))
            }
            Enhancement::Sharpness => smooth(img),
        }
    }
}

fn mean_luminance(img: &RgbImage) -> u8 {
    let gray = imageops::grayscale(img);
    let count = gray.as_raw().len().max(1) as f64;
    let sum: f64 = gray.as_raw().iter().map(|&v| v as f64).sum();
    (sum / count).round().clamp(0.0, 255.0) as u8
}

/// Weighted 3x3 smoothing (centre 5, neighbours 1). Border pixels are copied
/// unchanged.
fn smooth(img: &RgbImage) -> RgbImage {
    let (width, height) = img.dimensions();
    let mut result = img.clone();
    if width < 3 || height < 3 {
        return result;
    }

    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let mut acc = [0u32; 3];
            for dy in 0..3 {
                for dx in 0..3 {
                    let weight = if dx == 1 && dy == 1 { 5 } else { 1 };
                    let pixel = img.get_pixel(x + dx - 1, y + dy - 1);
                    for c in 0..3 {
                        acc[c] += pixel[c] as u32 * weight;
                    }
                }
            }
            // Round to nearest over the kernel weight of 13.
            let px = acc.map(|v| ((v + 6) / 13) as u8);
            result.put_pixel(x, y, Rgb(px));
        }
    }

    result
}

/// Apply one photometric adjustment to an image.
pub fn adjust(img: &RgbImage, kind: Enhancement, factor: f32) -> RgbImage {
    let degenerate = kind.degenerate(img);
    RgbImage::from_fn(img.width(), img.height(), |x, y| {
        let d = degenerate.get_pixel(x, y);
        let s = img.get_pixel(x, y);
        let blend = |c: usize| -> u8 {
            let (d, s) = (d[c] as f32, s[c] as f32);
            (d + factor * (s - d)).round().clamp(0.0, 255.0) as u8
        };
        Rgb([blend(0), blend(1), blend(2)])
    })
}

/// Per-label sequence numbers for one invocation.
///
/// Labels are case-folded, so "Full" and "full" share a sequence.
#[derive(Debug, Default, Clone)]
pub struct AugmentationCounter {
    next: HashMap<String, u32>,
}

impl AugmentationCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// The sequence number the next variant of `label` will receive
    pub fn peek(&self, label: &str) -> u32 {
        self.next.get(&label.to_lowercase()).copied().unwrap_or(0)
    }

    /// Claim the next sequence number for `label`
    pub fn advance(&mut self, label: &str) -> u32 {
        let slot = self.next.entry(label.to_lowercase()).or_insert(0);
        let sequence = *slot;
        *slot += 1;
        sequence
    }
}

/// Output name for a variant: `{prefix}/{label}/{label}-{sequence:05}`
pub fn variant_name(prefix: &str, label: &str, sequence: u32) -> String {
    let label = label.to_lowercase();
    if prefix.is_empty() {
        format!("{}/{}-{:05}", label, label, sequence)
    } else {
        format!("{}/{}/{}-{:05}", prefix.trim_end_matches('/'), label, label, sequence)
    }
}

/// One generated training image
#[derive(Debug, Clone)]
pub struct Variant {
    pub name: String,
    pub label: String,
    pub sequence: u32,
    pub mirrored: bool,
    /// `None` for the unadjusted base
    pub adjustment: Option<(Enhancement, f32)>,
    pub image: RgbImage,
}

/// Produces the fixed set of variants for each extracted region
#[derive(Debug, Clone)]
pub struct VariantGenerator {
    prefix: String,
    factors: [f32; 2],
}

impl Default for VariantGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_TRAINING_PREFIX, DEFAULT_FACTORS)
    }
}

impl VariantGenerator {
    pub fn new(prefix: impl Into<String>, factors: [f32; 2]) -> Self {
        Self {
            prefix: prefix.into(),
            factors,
        }
    }

    /// Lazily yield the variants of `image`: the base crop and each
    /// adjustment, then the same for its mirror image.
    ///
    /// Sequence numbers are drawn from `counter` as each variant is pulled,
    /// so calls sharing a counter must run in a fixed order to reproduce names.
    pub fn generate<'a>(
        &'a self,
        counter: &'a mut AugmentationCounter,
        label: &str,
        image: RgbImage,
    ) -> Variants<'a> {
        Variants {
            generator: self,
            counter,
            label: label.to_string(),
            base: image,
            mirrored: None,
            step: 0,
        }
    }

    /// Which adjustment the `index`-th variant within an orientation carries
    fn adjustment_at(&self, index: usize) -> Option<(Enhancement, f32)> {
        if index == 0 {
            return None;
        }
        let slot = index - 1;
        let kind = Enhancement::ALL[slot / self.factors.len()];
        Some((kind, self.factors[slot % self.factors.len()]))
    }
}

/// Iterator returned by [`VariantGenerator::generate`]
pub struct Variants<'a> {
    generator: &'a VariantGenerator,
    counter: &'a mut AugmentationCounter,
    label: String,
    base: RgbImage,
    mirrored: Option<RgbImage>,
    step: usize,
}

impl Iterator for Variants<'_> {
    type Item = Variant;

    fn next(&mut self) -> Option<Variant> {
        if self.step >= VARIANTS_PER_REGION {
            return None;
        }
        let mirrored = self.step >= VARIANTS_PER_ORIENTATION;
        let adjustment = self
            .generator
            .adjustment_at(self.step % VARIANTS_PER_ORIENTATION);
        self.step += 1;

        let source = if mirrored {
            let base = &self.base;
            &*self
                .mirrored
                .get_or_insert_with(|| imageops::flip_horizontal(base))
        } else {
            &self.base
        };
        let image = match adjustment {
            Some((kind, factor)) => adjust(source, kind, factor),
            None => source.clone(),
        };

        let sequence = self.counter.advance(&self.label);
        Some(Variant {
            name: variant_name(&self.generator.prefix, &self.label, sequence),
            label: self.label.clone(),
            sequence,
            mirrored,
            adjustment,
            image,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = VARIANTS_PER_REGION - self.step;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Variants<'_> {}

impl FusedIterator for Variants<'_> {}
