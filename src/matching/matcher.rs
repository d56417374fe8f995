//! Normalized cross-correlation matching of one template against one frame.
use super::region::SearchRegion;
use super::template::{TemplateKey, TemplateStore};
use super::{MatchError, MatchResult};
use crate::capture::Frame;
use image::GrayImage;
use image::imageops::{FilterType, crop_imm, resize};
use imageproc::template_matching::{MatchTemplateMethod, find_extremes, match_template};
use std::fmt;

/// Minimum score for "on screen". There is no default: every check states its own.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Threshold(f32);

impl Threshold {
    /// Clamped to [0, 1].
    pub fn new(value: f32) -> Self {
        Self(if value.is_nan() { 1.0 } else { value.clamp(0.0, 1.0) })
    }

    pub fn value(self) -> f32 {
        self.0
    }

    pub fn accepts(self, confidence: f32) -> bool {
        confidence >= self.0
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Match {
    NotFound {
        /// Best score seen, for diagnostics only
        best: f32,
    },
    Found {
        /// Top-left corner of the best match, frame pixels
        location: (u32, u32),
        size: (u32, u32),
        confidence: f32,
    },
}

impl Match {
    /// A below-threshold location is dropped, not returned.
    pub fn from_score(
        location: (u32, u32),
        size: (u32, u32),
        confidence: f32,
        threshold: Threshold,
    ) -> Self {
        if threshold.accepts(confidence) {
            Match::Found {
                location,
                size,
                confidence,
            }
        } else {
            Match::NotFound { best: confidence }
        }
    }

    /// Shift a location found in a cropped view back into frame coordinates.
    pub fn offset(self, dx: u32, dy: u32) -> Self {
        match self {
            Match::Found {
                location: (x, y),
                size,
                confidence,
            } => Match::Found {
                location: (x + dx, y + dy),
                size,
                confidence,
            },
            not_found => not_found,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Match::Found { .. })
    }

    /// Centre of the matched area, the point to tap.
    pub fn center(&self) -> Option<(u32, u32)> {
        match *self {
            Match::Found {
                location: (x, y),
                size: (w, h),
                ..
            } => Some((x + w / 2, y + h / 2)),
            Match::NotFound { .. } => None,
        }
    }

    pub fn confidence(&self) -> f32 {
        match *self {
            Match::Found { confidence, .. } => confidence,
            Match::NotFound { best } => best,
        }
    }
}

/// Seam between the state machine and image recognition. `region` limits the
/// search to part of the frame; reported locations stay in frame pixels.
pub trait Matcher {
    fn find(
        &self,
        frame: &Frame,
        key: &TemplateKey,
        threshold: Threshold,
        region: Option<SearchRegion>,
    ) -> MatchResult<Match>;
}

pub struct TemplateMatcher {
    store: TemplateStore,
}

impl TemplateMatcher {
    pub fn new(store: TemplateStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &TemplateStore {
        &self.store
    }
}

impl Matcher for TemplateMatcher {
    fn find(
        &self,
        frame: &Frame,
        key: &TemplateKey,
        threshold: Threshold,
        region: Option<SearchRegion>,
    ) -> MatchResult<Match> {
        let template = self.store.get(key)?;
        let gray = frame.luma();
        let result = match region {
            None => match_gray(gray, &template, threshold)?,
            Some(region) => {
                let area = region
                    .clip_to(gray.width(), gray.height())
                    .ok_or(MatchError::RegionOutsideFrame {
                        region,
                        frame: gray.dimensions(),
                    })?;
                let view = crop_imm(gray, area.x, area.y, area.width, area.height).to_image();
                match_gray(&view, &template, threshold)?.offset(area.x, area.y)
            }
        };
        log::debug!("{key}: {:.3} (threshold {threshold})", result.confidence());
        Ok(result)
    }
}

/// Searches smaller than this many correlation terms are done exhaustively.
const EXHAUSTIVE_LIMIT: u64 = 20_000_000;
/// A reduced template keeps at least this many pixels on its short side.
const MIN_COARSE_SIDE: u32 = 8;

/// Best normalized cross-correlation position of `template` within `frame`.
///
/// Large searches run coarse-to-fine: both images are shrunk by the same
/// factor, the best reduced position is found, and the full-resolution score
/// is computed in a small window around it. The reported confidence is always
/// a full-resolution score.
pub fn match_gray(
    frame: &GrayImage,
    template: &GrayImage,
    threshold: Threshold,
) -> MatchResult<Match> {
    let (tw, th) = template.dimensions();
    if tw == 0 || th == 0 {
        return Err(MatchError::EmptyTemplate);
    }
    // imageproc requires the template to fit inside the image
    if tw > frame.width() || th > frame.height() {
        return Err(MatchError::TemplateLargerThanFrame {
            template: (tw, th),
            frame: frame.dimensions(),
        });
    }

    let (location, confidence) = match coarse_factor(frame.dimensions(), (tw, th)) {
        1 => best_position(frame, template),
        factor => refine(frame, template, factor),
    };
    Ok(Match::from_score(location, (tw, th), confidence, threshold))
}

/// 1 when the exhaustive search is cheap enough, otherwise the largest of
/// 8, 4 or 2 that leaves the template recognisable.
fn coarse_factor((fw, fh): (u32, u32), (tw, th): (u32, u32)) -> u32 {
    let positions = u64::from(fw - tw + 1) * u64::from(fh - th + 1);
    if positions * u64::from(tw) * u64::from(th) <= EXHAUSTIVE_LIMIT {
        return 1;
    }
    [8, 4, 2]
        .into_iter()
        .find(|f| tw.min(th) / f >= MIN_COARSE_SIDE)
        .unwrap_or(1)
}

fn refine(frame: &GrayImage, template: &GrayImage, factor: u32) -> ((u32, u32), f32) {
    let (fw, fh) = frame.dimensions();
    let (tw, th) = template.dimensions();
    let small_frame = resize(frame, fw / factor, fh / factor, FilterType::Triangle);
    let small_template = resize(template, tw / factor, th / factor, FilterType::Triangle);
    let ((cx, cy), _) = best_position(&small_frame, &small_template);

    // Rounding while shrinking moves the true position by up to one factor
    let margin = factor * 2;
    let x0 = (cx * factor).saturating_sub(margin).min(fw - tw);
    let y0 = (cy * factor).saturating_sub(margin).min(fh - th);
    let x1 = (cx * factor + tw + margin).min(fw);
    let y1 = (cy * factor + th + margin).min(fh);
    let window = crop_imm(frame, x0, y0, x1 - x0, y1 - y0).to_image();
    let ((x, y), confidence) = best_position(&window, template);
    ((x0 + x, y0 + y), confidence)
}

fn best_position(frame: &GrayImage, template: &GrayImage) -> ((u32, u32), f32) {
    let scores = match_template(frame, template, MatchTemplateMethod::CrossCorrelationNormalized);
    let extremes = find_extremes(&scores);
    // Flat regions divide by zero and come back NaN
    let confidence = if extremes.max_value.is_nan() {
        0.0
    } else {
        extremes.max_value.clamp(0.0, 1.0)
    };
    (extremes.max_value_location, confidence)
}
