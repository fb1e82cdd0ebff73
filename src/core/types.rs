//! Signal and record types shared by the screening pipeline.
//!
//! These types carry only derived measurements (pupil diameters and a coarse
//! gaze label). Raw frames never leave the analyzer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of an authenticated user, as resolved by the authenticator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn anonymous() -> Self {
        Self(String::new())
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Coarse, asymmetry-derived gaze label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GazeClass {
    Center,
    Left,
    Right,
    /// Only produced when the frame could not be decoded.
    Unknown,
}

impl GazeClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            GazeClass::Center => "center",
            GazeClass::Left => "left",
            GazeClass::Right => "right",
            GazeClass::Unknown => "unknown",
        }
    }

    /// Parse the stored lowercase label.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "center" => Some(GazeClass::Center),
            "left" => Some(GazeClass::Left),
            "right" => Some(GazeClass::Right),
            "unknown" => Some(GazeClass::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for GazeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-stimulus heuristic label. Not a diagnosis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AsdFlag {
    High,
    Low,
}

impl AsdFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            AsdFlag::High => "high",
            AsdFlag::Low => "low",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "high" => Some(AsdFlag::High),
            "low" => Some(AsdFlag::Low),
            _ => None,
        }
    }
}

impl fmt::Display for AsdFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signal extracted from a single frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameSample {
    pub gaze: GazeClass,
    /// Diameter of the first detected pupil-like region (image units)
    pub left: f64,
    /// Diameter of the second detected pupil-like region (image units)
    pub right: f64,
}

impl FrameSample {
    /// Neutral observation emitted for frames that could not be decoded.
    pub const NEUTRAL: FrameSample = FrameSample {
        gaze: GazeClass::Unknown,
        left: 0.0,
        right: 0.0,
    };
}

/// Outcome of analyzing one frame.
///
/// An undecodable frame is kept distinct from a measured one so callers can
/// count it, but it still contributes the neutral sample to aggregation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FrameAnalysis {
    Measured(FrameSample),
    Undecodable,
}

impl FrameAnalysis {
    pub fn sample(&self) -> FrameSample {
        match self {
            FrameAnalysis::Measured(sample) => *sample,
            FrameAnalysis::Undecodable => FrameSample::NEUTRAL,
        }
    }

    pub fn is_undecodable(&self) -> bool {
        matches!(self, FrameAnalysis::Undecodable)
    }
}

/// Durable per-stimulus aggregate. Append-only once persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreeningRecord {
    #[serde(skip_serializing, default = "UserId::anonymous")]
    pub user_id: UserId,
    /// Timestamp of the frame message that triggered the flush
    pub timestamp: DateTime<Utc>,
    pub stimulus: String,
    /// Majority-vote gaze across the stimulus's frames
    pub gaze_direction: GazeClass,
    pub left_pupil_size: f64,
    pub right_pupil_size: f64,
    pub asd_flag: AsdFlag,
}
