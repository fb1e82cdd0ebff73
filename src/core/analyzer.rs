//! Pupil extraction from a single encoded camera frame.
//!
//! The pipeline is coarse:
//!
//! ```text
//! bytes ─▶ decode ─▶ luma ─▶ median blur ─▶ inverse threshold ─▶ outer contours
//!                                                                     │
//!        gaze label ◀── diameter pair ◀── enclosing circles ◀── area band
//! ```
//!
//! Pupil-like regions are dark blobs against a brighter face. Contours are
//! taken in the order the contour tracer discovers them; the first is
//! reported as "left" and the second as "right" regardless of where they sit
//! in the frame.

use crate::core::types::{FrameAnalysis, FrameSample, GazeClass};
use image::{DynamicImage, GrayImage, Luma};
use imageproc::contours::{find_contours, BorderType, Contour};
use imageproc::filter::median_filter;
use serde::{Deserialize, Serialize};

/// Tunable parameters for frame analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzerParams {
    /// Median filter radius (2 = 5x5 neighborhood)
    pub median_radius: u32,
    /// Pixels at or below this intensity are treated as pupil candidates
    pub intensity_cutoff: u8,
    /// Contours must enclose strictly more than this area
    pub min_area: f64,
    /// Contours must enclose strictly less than this area
    pub max_area: f64,
    /// Diameter difference below which gaze is labelled center
    pub gaze_tolerance: f64,
}

impl Default for AnalyzerParams {
    fn default() -> Self {
        Self {
            median_radius: 2,
            intensity_cutoff: 30,
            min_area: 30.0,
            max_area: 300.0,
            gaze_tolerance: 2.0,
        }
    }
}

/// Stateless frame analyzer.
#[derive(Debug, Clone, Default)]
pub struct FrameAnalyzer {
    params: AnalyzerParams,
}

impl FrameAnalyzer {
    pub fn new(params: AnalyzerParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &AnalyzerParams {
        &self.params
    }

    /// Analyze encoded image bytes (any format the `image` crate can sniff).
    ///
    /// Never fails: bytes that do not decode yield
    /// [`FrameAnalysis::Undecodable`].
    pub fn analyze(&self, image_bytes: &[u8]) -> FrameAnalysis {
        let decoded = match image::load_from_memory(image_bytes) {
            Ok(img) => img,
            Err(_) => return FrameAnalysis::Undecodable,
        };

        let gray = bt601_luma(&decoded);
        let diameters = self.pupil_diameters(&gray);

        let (left, right) = match diameters.as_slice() {
            [first, second, ..] => (*first, *second),
            [only] => (*only, *only),
            [] => (0.0, 0.0),
        };

        FrameAnalysis::Measured(FrameSample {
            gaze: self.classify_gaze(left, right),
            left,
            right,
        })
    }

    /// Diameters of every qualifying region, in discovery order.
    pub fn pupil_diameters(&self, gray: &GrayImage) -> Vec<f64> {
        let blurred = median_filter(gray, self.params.median_radius, self.params.median_radius);
        let mask = self.inverse_threshold(&blurred);

        find_contours::<i32>(&mask)
            .iter()
            .filter(|c| is_external(c))
            .filter_map(|c| {
                let points: Vec<(f64, f64)> =
                    c.points.iter().map(|p| (p.x as f64, p.y as f64)).collect();
                let area = polygon_area(&points);
                if area > self.params.min_area && area < self.params.max_area {
                    Some(min_enclosing_circle(&points).radius * 2.0)
                } else {
                    None
                }
            })
            .collect()
    }

    fn inverse_threshold(&self, gray: &GrayImage) -> GrayImage {
        let cutoff = self.params.intensity_cutoff;
        GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
            if gray.get_pixel(x, y)[0] > cutoff {
                Luma([0u8])
            } else {
                Luma([255u8])
            }
        })
    }

    fn classify_gaze(&self, left: f64, right: f64) -> GazeClass {
        if (left - right).abs() < self.params.gaze_tolerance {
            GazeClass::Center
        } else if left > right {
            GazeClass::Left
        } else {
            GazeClass::Right
        }
    }
}

/// Analyze a frame with default parameters, returning the flattened sample.
pub fn analyze_frame(image_bytes: &[u8]) -> FrameSample {
    FrameAnalyzer::default().analyze(image_bytes).sample()
}

/// Single-channel intensity with BT.601 weights (0.299, 0.587, 0.114).
fn bt601_luma(image: &DynamicImage) -> GrayImage {
    let rgb = image.to_rgb8();
    GrayImage::from_fn(rgb.width(), rgb.height(), |x, y| {
        let [r, g, b] = rgb.get_pixel(x, y).0;
        let weighted = 299 * u32::from(r) + 587 * u32::from(g) + 114 * u32::from(b);
        Luma([((weighted + 500) / 1000) as u8])
    })
}

/// Outer borders with no enclosing region (the image frame is not a parent).
fn is_external(contour: &Contour<i32>) -> bool {
    contour.border_type == BorderType::Outer && contour.parent.is_none()
}

/// Shoelace area of a closed polygon.
fn polygon_area(points: &[(f64, f64)]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let twice: f64 = points
        .iter()
        .zip(points.iter().cycle().skip(1))
        .map(|((x0, y0), (x1, y1))| x0 * y1 - x1 * y0)
        .sum();
    twice.abs() / 2.0
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Circle {
    cx: f64,
    cy: f64,
    radius: f64,
}

const CIRCLE_EPS: f64 = 1e-7;

impl Circle {
    fn contains(&self, (x, y): (f64, f64)) -> bool {
        let dx = x - self.cx;
        let dy = y - self.cy;
        (dx * dx + dy * dy).sqrt() <= self.radius + CIRCLE_EPS
    }

    fn from_two((ax, ay): (f64, f64), (bx, by): (f64, f64)) -> Self {
        let cx = (ax + bx) / 2.0;
        let cy = (ay + by) / 2.0;
        let radius = ((ax - bx).powi(2) + (ay - by).powi(2)).sqrt() / 2.0;
        Self { cx, cy, radius }
    }

    fn from_three(a: (f64, f64), b: (f64, f64), c: (f64, f64)) -> Self {
        let (ax, ay) = a;
        let (bx, by) = b;
        let (cx, cy) = c;
        let d = 2.0 * (ax * (by - cy) + bx * (cy - ay) + cx * (ay - by));

        if d.abs() < CIRCLE_EPS {
            // Collinear: the widest pair spans the circle
            let candidates = [Self::from_two(a, b), Self::from_two(a, c), Self::from_two(b, c)];
            return candidates.into_iter().fold(candidates[0], |best, next| {
                if next.radius > best.radius {
                    next
                } else {
                    best
                }
            });
        }

        let a2 = ax * ax + ay * ay;
        let b2 = bx * bx + by * by;
        let c2 = cx * cx + cy * cy;
        let ux = (a2 * (by - cy) + b2 * (cy - ay) + c2 * (ay - by)) / d;
        let uy = (a2 * (cx - bx) + b2 * (ax - cx) + c2 * (bx - ax)) / d;
        let radius = ((ax - ux).powi(2) + (ay - uy).powi(2)).sqrt();
        Self { cx: ux, cy: uy, radius }
    }
}

/// Smallest circle enclosing every point (incremental Welzl construction).
///
/// Points are visited in the given order so the result is deterministic.
fn min_enclosing_circle(points: &[(f64, f64)]) -> Circle {
    let Some(&first) = points.first() else {
        return Circle {
            cx: 0.0,
            cy: 0.0,
            radius: 0.0,
        };
    };

    let mut circle = Circle {
        cx: first.0,
        cy: first.1,
        radius: 0.0,
    };

    for i in 1..points.len() {
        if circle.contains(points[i]) {
            continue;
        }
        circle = Circle {
            cx: points[i].0,
            cy: points[i].1,
            radius: 0.0,
        };
        for j in 0..i {
            if circle.contains(points[j]) {
                continue;
            }
            circle = Circle::from_two(points[i], points[j]);
            for k in 0..j {
                if !circle.contains(points[k]) {
                    circle = Circle::from_three(points[i], points[j], points[k]);
                }
            }
        }
    }

    circle
}
