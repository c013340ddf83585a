//! Motion analysis primitives.
//!
//! The detection loop feeds consecutive frame pairs through this pipeline:
//! absolute difference reduced to one channel, blur, binary threshold,
//! dilation to merge nearby regions, then connected-component contours.
//! A zone triggers when some contour is large enough for the zone's
//! sensitivity-scaled threshold and its bounding box overlaps the zone.

use crate::capture::Frame;
use crate::config::ZoneConfig;
use thiserror::Error;

/// Binary threshold applied to the blurred difference image.
pub const DIFF_THRESHOLD: u8 = 20;

/// Dilation passes applied before contour extraction.
pub const DILATE_ITERATIONS: u32 = 3;

/// Errors from the analysis pipeline.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AnalysisError {
    #[error("frame dimensions differ: {0}x{1} vs {2}x{3}")]
    DimensionMismatch(u32, u32, u32, u32),

    #[error("frame data shorter than its dimensions imply")]
    TruncatedFrame,
}

/// An axis-aligned pixel rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    /// True unless the rectangles are disjoint on either axis.
    /// Touching edges count as overlap.
    pub fn intersects(&self, other: &Rect) -> bool {
        !(self.right() < other.x
            || self.x > other.right()
            || self.bottom() < other.y
            || self.y > other.bottom())
    }
}

/// A motion zone with coordinates normalized to the frame dimensions.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionZone {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub sensitivity: f64,
}

impl MotionZone {
    /// Scale against the current frame, never a fixed pixel basis.
    pub fn to_pixels(&self, frame_width: u32, frame_height: u32) -> Rect {
        Rect {
            x: (self.x * frame_width as f64) as u32,
            y: (self.y * frame_height as f64) as u32,
            width: (self.width * frame_width as f64) as u32,
            height: (self.height * frame_height as f64) as u32,
        }
    }
}

impl From<&ZoneConfig> for MotionZone {
    fn from(config: &ZoneConfig) -> Self {
        Self {
            x: config.x,
            y: config.y,
            width: config.width,
            height: config.height,
            sensitivity: config.sensitivity,
        }
    }
}

/// A single-channel image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrayImage {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// A connected region of the binary difference image.
#[derive(Debug, Clone, PartialEq)]
pub struct Contour {
    /// Area in pixels
    pub area: f64,
    /// Axis-aligned bounding box
    pub bbox: Rect,
}

/// Per-pixel absolute difference of two RGB frames, reduced to luma.
pub fn absdiff_gray(a: &Frame, b: &Frame) -> Result<GrayImage, AnalysisError> {
    if a.width != b.width || a.height != b.height {
        return Err(AnalysisError::DimensionMismatch(
            a.width, a.height, b.width, b.height,
        ));
    }
    let pixels = (a.width * a.height) as usize;
    if a.data.len() < pixels * 3 || b.data.len() < pixels * 3 {
        return Err(AnalysisError::TruncatedFrame);
    }

    let mut data = Vec::with_capacity(pixels);
    for i in 0..pixels {
        let offset = i * 3;
        let dr = a.data[offset].abs_diff(b.data[offset]) as u32;
        let dg = a.data[offset + 1].abs_diff(b.data[offset + 1]) as u32;
        let db = a.data[offset + 2].abs_diff(b.data[offset + 2]) as u32;
        data.push(((dr * 299 + dg * 587 + db * 114) / 1000) as u8);
    }

    Ok(GrayImage {
        data,
        width: a.width,
        height: a.height,
    })
}

/// 3x3 mean blur with edge clamping, suppressing single-pixel noise.
pub fn box_blur(img: &GrayImage) -> GrayImage {
    let (w, h) = (img.width as i64, img.height as i64);
    let mut data = vec![0u8; img.data.len()];

    for y in 0..h {
        for x in 0..w {
            let mut sum = 0u32;
            let mut count = 0u32;
            for dy in -1..=1 {
                for dx in -1..=1 {
                    let (nx, ny) = (x + dx, y + dy);
                    if (0..w).contains(&nx) && (0..h).contains(&ny) {
                        sum += img.data[(ny * w + nx) as usize] as u32;
                        count += 1;
                    }
                }
            }
            data[(y * w + x) as usize] = (sum / count) as u8;
        }
    }

    GrayImage {
        data,
        width: img.width,
        height: img.height,
    }
}

/// Binary threshold: pixels above `value` become 255, the rest 0.
pub fn threshold(img: &GrayImage, value: u8) -> GrayImage {
    GrayImage {
        data: img
            .data
            .iter()
            .map(|&p| if p > value { 255 } else { 0 })
            .collect(),
        width: img.width,
        height: img.height,
    }
}

/// 3x3 max-filter dilation, repeated `iterations` times, merging nearby
/// regions into contiguous blobs.
pub fn dilate(img: &GrayImage, iterations: u32) -> GrayImage {
    let (w, h) = (img.width as i64, img.height as i64);
    let mut current = img.data.clone();

    for _ in 0..iterations {
        let mut next = vec![0u8; current.len()];
        for y in 0..h {
            for x in 0..w {
                let mut max = 0u8;
                for dy in -1..=1 {
                    for dx in -1..=1 {
                        let (nx, ny) = (x + dx, y + dy);
                        if (0..w).contains(&nx) && (0..h).contains(&ny) {
                            max = max.max(current[(ny * w + nx) as usize]);
                        }
                    }
                }
                next[(y * w + x) as usize] = max;
            }
        }
        current = next;
    }

    GrayImage {
        data: current,
        width: img.width,
        height: img.height,
    }
}

/// Extract 4-connected components of the binary image as contours.
pub fn find_contours(img: &GrayImage) -> Vec<Contour> {
    let (w, h) = (img.width as usize, img.height as usize);
    let mut visited = vec![false; img.data.len()];
    let mut contours = Vec::new();

    for start in 0..img.data.len() {
        if visited[start] || img.data[start] == 0 {
            continue;
        }

        let mut area = 0u64;
        let (mut min_x, mut min_y) = (w, h);
        let (mut max_x, mut max_y) = (0usize, 0usize);
        let mut stack = vec![start];
        visited[start] = true;

        while let Some(index) = stack.pop() {
            let (x, y) = (index % w, index / w);
            area += 1;
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);

            let mut push = |nx: usize, ny: usize| {
                let neighbor = ny * w + nx;
                if !visited[neighbor] && img.data[neighbor] != 0 {
                    visited[neighbor] = true;
                    stack.push(neighbor);
                }
            };
            if x > 0 {
                push(x - 1, y);
            }
            if x + 1 < w {
                push(x + 1, y);
            }
            if y > 0 {
                push(x, y - 1);
            }
            if y + 1 < h {
                push(x, y + 1);
            }
        }

        contours.push(Contour {
            area: area as f64,
            bbox: Rect {
                x: min_x as u32,
                y: min_y as u32,
                width: (max_x - min_x + 1) as u32,
                height: (max_y - min_y + 1) as u32,
            },
        });
    }

    contours
}

/// Indices of zones triggered by the given contours, ascending and unique.
///
/// A zone triggers iff some contour has area at least `base_threshold`
/// scaled by the zone's sensitivity and a bounding box overlapping the
/// zone's rectangle.
pub fn triggered_zones(
    contours: &[Contour],
    zones: &[MotionZone],
    frame_width: u32,
    frame_height: u32,
    base_threshold: f64,
) -> Vec<usize> {
    let mut triggered = Vec::new();

    for (index, zone) in zones.iter().enumerate() {
        let zone_threshold = base_threshold * zone.sensitivity;
        let zone_rect = zone.to_pixels(frame_width, frame_height);
        if contours
            .iter()
            .any(|contour| contour.area >= zone_threshold && contour.bbox.intersects(&zone_rect))
        {
            triggered.push(index);
        }
    }

    triggered
}

/// Run the full pipeline on a consecutive frame pair.
pub fn detect(
    prev: &Frame,
    next: &Frame,
    zones: &[MotionZone],
    base_threshold: f64,
) -> Result<Vec<usize>, AnalysisError> {
    let diff = absdiff_gray(prev, next)?;
    let blurred = box_blur(&diff);
    let binary = threshold(&blurred, DIFF_THRESHOLD);
    let dilated = dilate(&binary, DILATE_ITERATIONS);
    let contours = find_contours(&dilated);
    Ok(triggered_zones(
        &contours,
        zones,
        prev.width,
        prev.height,
        base_threshold,
    ))
}
