//! Core screening pipeline.
//!
//! This module contains:
//! - Frame analysis (pupil diameters and gaze label per frame)
//! - Stimulus aggregation into per-stimulus records
//! - The rule-based decision engine over a user's history

pub mod aggregator;
pub mod analyzer;
pub mod decision;
pub mod types;

// Re-export commonly used types
pub use aggregator::{asd_flag_for, StimulusAggregator, StimulusBucket, ASD_DIAMETER_THRESHOLD};
pub use analyzer::{analyze_frame, AnalyzerParams, FrameAnalyzer};
pub use decision::{decide, HistorySignals, ScreeningVerdict, Verdict};
pub use types::{AsdFlag, FrameAnalysis, FrameSample, GazeClass, ScreeningRecord, UserId};
