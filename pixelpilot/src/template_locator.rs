//! Template matching by zero-mean normalized cross-correlation.
//!
//! Small searches are exhaustive. When the number of multiply-adds would get
//! large, both images are downscaled and scored coarsely first. Every coarse
//! peak close to the best one is then refined at full resolution in a small
//! neighbourhood, so near-duplicates cannot hide the true maximum.

use crate::descriptor::{ActionDescriptor, BoundingBox};
use crate::detection::{DetectionResult, LocatorMethod};
use crate::errors::LocateError;
use crate::locator::{AttemptOptions, Locator};
use crate::screenshot::Screenshot;
use crate::template_store::TemplateStore;
use image::imageops::{self, FilterType};
use image::{GrayImage, Luma};
use imageproc::definitions::Image;
use imageproc::integral_image::{integral_image, integral_squared_image, sum_image_pixels};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument};

/// Above this many multiply-adds the coarse-to-fine search is used.
const DIRECT_SEARCH_LIMIT: u64 = 40_000_000;
/// Coarse peaks scoring at least this fraction of the best coarse score are refined.
const COARSE_KEEP: f32 = 0.8;
/// More separate coarse peaks than this and the search goes exhaustive.
const MAX_REFINED: usize = 64;
/// Smallest template side allowed at the coarse level.
const MIN_COARSE_SIDE: u32 = 6;
const FLAT_EPSILON: f64 = 1e-6;

/// Best location of a template inside a haystack.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchScore {
    pub x: u32,
    pub y: u32,
    pub score: f32,
}

impl MatchScore {
    /// Strictly higher score wins; equal scores keep the earlier row-major position.
    fn beats(&self, other: &MatchScore) -> bool {
        self.score > other.score
            || (self.score == other.score && (self.y, self.x) < (other.y, other.x))
    }
}

/// Finds an element by comparing stored reference images against the screen.
pub struct TemplateLocator {
    store: Arc<TemplateStore>,
}

impl TemplateLocator {
    pub fn new(store: Arc<TemplateStore>) -> Self {
        Self { store }
    }
}

impl Locator for TemplateLocator {
    fn method(&self) -> LocatorMethod {
        LocatorMethod::Template
    }

    fn applies_to(&self, descriptor: &ActionDescriptor) -> bool {
        descriptor.template_id().is_some()
    }

    #[instrument(level = "debug", skip(self, screen, descriptor), fields(template = descriptor.template_id()))]
    fn attempt(
        &self,
        screen: &Screenshot,
        descriptor: &ActionDescriptor,
        options: &AttemptOptions,
    ) -> Result<DetectionResult, LocateError> {
        let ids: Vec<&str> = if options.template_ids.is_empty() {
            descriptor.template_id().into_iter().collect()
        } else {
            options.template_ids.iter().map(String::as_str).collect()
        };
        if ids.is_empty() {
            return Err(LocateError::InvalidDescriptor(
                "template locator needs template_id".to_string(),
            ));
        }
        let (gray, area) = screen
            .gray_region(descriptor.search_region())
            .ok_or_else(|| {
                LocateError::DetectionNotFound("search region lies outside the screen".to_string())
            })?;

        let started = Instant::now();
        let mut haystack = Haystack::new(gray);
        let mut best: Option<(MatchScore, u32, u32)> = None;
        let mut known_template = false;
        let mut timed_out = false;

        'templates: for id in &ids {
            let Some(template) = self.store.get(id) else {
                continue;
            };
            known_template = true;
            for variant in template.variants() {
                let needle = variant.image();
                if let Some(found) = haystack.best_match(needle) {
                    debug!(id, variant = %variant.file_name, score = found.score, "Variant scored");
                    // Earlier variants win ties, so only a strictly higher score replaces.
                    if best.map_or(true, |(b, _, _)| found.score > b.score) {
                        best = Some((found, needle.width(), needle.height()));
                    }
                }
                if started.elapsed() > options.budget {
                    timed_out = true;
                    break 'templates;
                }
            }
        }

        if !known_template {
            return Err(LocateError::TemplateMissing(ids.join(", ")));
        }
        match best {
            Some((m, w, h)) if m.score >= options.threshold => Ok(DetectionResult::matched(
                LocatorMethod::Template,
                BoundingBox::new(area.x + m.x as i32, area.y + m.y as i32, w, h),
                m.score,
            )),
            _ if timed_out => Err(LocateError::Timeout {
                elapsed: started.elapsed(),
                budget: options.budget,
            }),
            Some((m, _, _)) => Err(LocateError::LowConfidence {
                observed: m.score,
                threshold: options.threshold,
            }),
            None => Err(LocateError::DetectionNotFound(format!(
                "no variant of {} fits inside the search area",
                ids.join(", ")
            ))),
        }
    }
}

/// Best zero-mean NCC match of `needle` in `haystack`, scores clamped to `[0, 1]`.
pub fn best_match(haystack: &GrayImage, needle: &GrayImage) -> Option<MatchScore> {
    Haystack::new(haystack.clone()).best_match(needle)
}

/// A search image with its integral images, plus lazily built coarse levels.
struct Haystack {
    plane: Plane,
    coarse: HashMap<u32, Vec<CoarseLevel>>,
}

/// The haystack downscaled by the pyramid factor, starting `dx`/`dy` pixels in.
///
/// One level exists per offset in `0..factor` on each axis, so a match at any
/// full-resolution position lines up with the cell grid of exactly one level.
struct CoarseLevel {
    dx: u32,
    dy: u32,
    plane: Plane,
}

impl Haystack {
    fn new(image: GrayImage) -> Self {
        Self {
            plane: Plane::new(image),
            coarse: HashMap::new(),
        }
    }

    fn best_match(&mut self, needle: &GrayImage) -> Option<MatchScore> {
        let (hw, hh) = (self.plane.width, self.plane.height);
        let (nw, nh) = needle.dimensions();
        if nw == 0 || nh == 0 || nw > hw || nh > hh {
            return None;
        }
        let template = CenteredTemplate::new(needle);
        let positions = (hw - nw + 1) as u64 * (hh - nh + 1) as u64;
        let cost = positions * (nw as u64 * nh as u64);
        let factor = coarse_factor(nw, nh);
        if cost <= DIRECT_SEARCH_LIMIT || factor == 1 {
            return self.exhaustive(&template);
        }
        self.coarse_to_fine(needle, &template, factor)
    }

    fn exhaustive(&self, template: &CenteredTemplate) -> Option<MatchScore> {
        self.plane.search(
            template,
            0..=self.plane.width - template.width,
            0..=self.plane.height - template.height,
        )
    }

    /// Coarse scoring prunes only positions clearly worse than the best coarse
    /// score. Every surviving peak is rescored at full resolution; when too many
    /// survive to refine, the search falls back to exhaustive.
    fn coarse_to_fine(
        &mut self,
        needle: &GrayImage,
        template: &CenteredTemplate,
        factor: u32,
    ) -> Option<MatchScore> {
        let (nw, nh) = needle.dimensions();
        let (sw, sh) = (nw / factor, nh / factor);
        let aligned = imageops::crop_imm(needle, 0, 0, sw * factor, sh * factor).to_image();
        let small_template =
            CenteredTemplate::new(&imageops::resize(&aligned, sw, sh, FilterType::Triangle));

        let source = &self.plane.image;
        let levels = self
            .coarse
            .entry(factor)
            .or_insert_with(|| coarse_levels(source, factor));

        let mut scored = Vec::new();
        for level in levels.iter() {
            if sw > level.plane.width || sh > level.plane.height {
                continue;
            }
            scored.extend(level.plane.scores(&small_template).into_iter().map(|s| MatchScore {
                x: level.dx + s.x * factor,
                y: level.dy + s.y * factor,
                score: s.score,
            }));
        }
        let Some(top) = scored.iter().map(|s| s.score).reduce(f32::max) else {
            return self.exhaustive(template);
        };
        let floor = top * COARSE_KEEP;
        scored.retain(|s| s.score >= floor);
        scored.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then((a.y, a.x).cmp(&(b.y, b.x)))
        });
        let Some(candidates) = isolated_peaks(scored, nw / 2, nh / 2, MAX_REFINED) else {
            debug!(top, "Coarse level is ambiguous, searching exhaustively");
            return self.exhaustive(template);
        };

        let (max_x, max_y) = (self.plane.width - nw, self.plane.height - nh);
        let mut best: Option<MatchScore> = None;
        for peak in candidates {
            let xs = peak.x.saturating_sub(factor).min(max_x)..=(peak.x + factor).min(max_x);
            let ys = peak.y.saturating_sub(factor).min(max_y)..=(peak.y + factor).min(max_y);
            if let Some(refined) = self.plane.search(template, xs, ys) {
                if best.map_or(true, |b| refined.beats(&b)) {
                    best = Some(refined);
                }
            }
        }
        best
    }
}

fn coarse_factor(nw: u32, nh: u32) -> u32 {
    [4, 2]
        .into_iter()
        .find(|f| nw.min(nh) / f >= MIN_COARSE_SIDE)
        .unwrap_or(1)
}

fn coarse_levels(image: &GrayImage, factor: u32) -> Vec<CoarseLevel> {
    let (width, height) = image.dimensions();
    let mut levels = Vec::with_capacity((factor * factor) as usize);
    for dy in 0..factor {
        for dx in 0..factor {
            // Whole cells only, so each coarse pixel covers exactly factor x factor.
            let (cols, rows) = ((width - dx) / factor, (height - dy) / factor);
            if cols == 0 || rows == 0 {
                continue;
            }
            let cropped = imageops::crop_imm(image, dx, dy, cols * factor, rows * factor).to_image();
            let small = imageops::resize(&cropped, cols, rows, FilterType::Triangle);
            levels.push(CoarseLevel {
                dx,
                dy,
                plane: Plane::new(small),
            });
        }
    }
    levels
}

/// Greedy non-maximum suppression over `sorted` (best first).
///
/// Returns `None` when more than `limit` separate peaks survive.
fn isolated_peaks(
    sorted: Vec<MatchScore>,
    min_dx: u32,
    min_dy: u32,
    limit: usize,
) -> Option<Vec<MatchScore>> {
    let (min_dx, min_dy) = (min_dx.max(1), min_dy.max(1));
    let mut peaks: Vec<MatchScore> = Vec::new();
    for candidate in sorted {
        let isolated = peaks
            .iter()
            .all(|p| p.x.abs_diff(candidate.x) >= min_dx || p.y.abs_diff(candidate.y) >= min_dy);
        if isolated {
            if peaks.len() == limit {
                return None;
            }
            peaks.push(candidate);
        }
    }
    Some(peaks)
}

/// Template pixels minus their mean, with the resulting energy.
struct CenteredTemplate {
    width: u32,
    height: u32,
    centered: Vec<f64>,
    energy: f64,
    mean: f64,
}

impl CenteredTemplate {
    fn new(image: &GrayImage) -> Self {
        let n = (image.width() as u64 * image.height() as u64).max(1) as f64;
        let mean = image.pixels().map(|p| p[0] as f64).sum::<f64>() / n;
        let centered: Vec<f64> = image.pixels().map(|p| p[0] as f64 - mean).collect();
        let energy = centered.iter().map(|v| v * v).sum();
        Self {
            width: image.width(),
            height: image.height(),
            centered,
            energy,
            mean,
        }
    }

    fn area(&self) -> f64 {
        self.width as f64 * self.height as f64
    }
}

/// Pixel plane with integral images of values and squared values.
struct Plane {
    width: u32,
    height: u32,
    image: GrayImage,
    pixels: Vec<f64>,
    sums: Image<Luma<u64>>,
    squares: Image<Luma<u64>>,
}

impl Plane {
    fn new(image: GrayImage) -> Self {
        let (width, height) = image.dimensions();
        let pixels = image.pixels().map(|p| p[0] as f64).collect();
        let sums = integral_image::<_, u64>(&image);
        let squares = integral_squared_image::<_, u64>(&image);
        Self {
            width,
            height,
            image,
            pixels,
            sums,
            squares,
        }
    }

    fn window(table: &Image<Luma<u64>>, x: u32, y: u32, w: u32, h: u32) -> f64 {
        sum_image_pixels(table, x, y, x + w - 1, y + h - 1)[0] as f64
    }

    fn score_at(&self, template: &CenteredTemplate, x: u32, y: u32) -> f32 {
        let (w, h) = (template.width, template.height);
        let n = template.area();
        let sum = Self::window(&self.sums, x, y, w, h);
        let window_energy = Self::window(&self.squares, x, y, w, h) - sum * sum / n;

        if template.energy <= FLAT_EPSILON {
            // A flat template only matches a flat window of similar brightness.
            if window_energy > FLAT_EPSILON * n {
                return 0.0;
            }
            return (1.0 - (sum / n - template.mean).abs() / 255.0) as f32;
        }
        if window_energy <= FLAT_EPSILON {
            return 0.0;
        }

        let mut cross = 0.0;
        let stride = self.width as usize;
        for j in 0..h as usize {
            let row = (y as usize + j) * stride + x as usize;
            let haystack_row = &self.pixels[row..row + w as usize];
            let template_row = &template.centered[j * w as usize..(j + 1) * w as usize];
            cross += haystack_row
                .iter()
                .zip(template_row)
                .map(|(a, b)| a * b)
                .sum::<f64>();
        }
        let score = cross / (template.energy * window_energy).sqrt();
        score.clamp(0.0, 1.0) as f32
    }

    fn search(
        &self,
        template: &CenteredTemplate,
        xs: std::ops::RangeInclusive<u32>,
        ys: std::ops::RangeInclusive<u32>,
    ) -> Option<MatchScore> {
        let mut best: Option<MatchScore> = None;
        for y in ys {
            for x in xs.clone() {
                let score = self.score_at(template, x, y);
                if best.map_or(true, |b| score > b.score) {
                    best = Some(MatchScore { x, y, score });
                }
            }
        }
        best
    }

    /// Score at every position the template fits.
    fn scores(&self, template: &CenteredTemplate) -> Vec<MatchScore> {
        let mut all = Vec::new();
        for y in 0..=self.height - template.height {
            for x in 0..=self.width - template.width {
                all.push(MatchScore {
                    x,
                    y,
                    score: self.score_at(template, x, y),
                });
            }
        }
        all
    }
}
