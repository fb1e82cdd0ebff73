//! Rule-based screening verdict over a user's record history.

use crate::core::types::{GazeClass, ScreeningRecord};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Mean pupil diameter below which the history counts as low.
pub const PUPIL_THRESHOLD: f64 = 2.0;

/// Fraction of centered records below which gaze counts as inconsistent.
pub const GAZE_CONSISTENCY_THRESHOLD: f64 = 0.6;

/// Outcome label of the decision engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    #[serde(rename = "Signs of ASD detected")]
    SignsDetected,
    #[serde(rename = "No concerning signs detected")]
    NoConcerningSigns,
    #[serde(rename = "No data available")]
    NoData,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::SignsDetected => "Signs of ASD detected",
            Verdict::NoConcerningSigns => "No concerning signs detected",
            Verdict::NoData => "No data available",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user's records (newest first) and the verdict derived from them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScreeningVerdict {
    pub sessions: Vec<ScreeningRecord>,
    pub decision: Verdict,
}

/// Aggregate signals the verdict is computed from.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct HistorySignals {
    pub average_pupil: f64,
    pub gaze_consistency: f64,
}

impl HistorySignals {
    pub fn from_records(records: &[ScreeningRecord]) -> Self {
        if records.is_empty() {
            return Self::default();
        }

        let pupil_means: Vec<f64> = records
            .iter()
            .filter(|r| r.left_pupil_size.is_finite() && r.right_pupil_size.is_finite())
            .map(|r| (r.left_pupil_size + r.right_pupil_size) / 2.0)
            .collect();
        let average_pupil = if pupil_means.is_empty() {
            0.0
        } else {
            pupil_means.iter().sum::<f64>() / pupil_means.len() as f64
        };

        let centered = records
            .iter()
            .filter(|r| r.gaze_direction == GazeClass::Center)
            .count();
        let gaze_consistency = centered as f64 / records.len() as f64;

        Self {
            average_pupil,
            gaze_consistency,
        }
    }

    pub fn verdict(&self) -> Verdict {
        if self.average_pupil < PUPIL_THRESHOLD
            && self.gaze_consistency < GAZE_CONSISTENCY_THRESHOLD
        {
            Verdict::SignsDetected
        } else {
            Verdict::NoConcerningSigns
        }
    }
}

/// Derive a verdict from a user's records, passed newest first.
///
/// The records are returned unchanged alongside the verdict.
pub fn decide(records: Vec<ScreeningRecord>) -> ScreeningVerdict {
    if records.is_empty() {
        return ScreeningVerdict {
            sessions: records,
            decision: Verdict::NoData,
        };
    }

    let decision = HistorySignals::from_records(&records).verdict();
    ScreeningVerdict {
        sessions: records,
        decision,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{AsdFlag, UserId};
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    fn record(left: f64, right: f64, gaze: GazeClass) -> ScreeningRecord {
        ScreeningRecord {
            user_id: UserId::new("u1"),
            timestamp: Utc::now(),
            stimulus: "happy".to_string(),
            gaze_direction: gaze,
            left_pupil_size: left,
            right_pupil_size: right,
            asd_flag: AsdFlag::High,
        }
    }

    fn history(gaze: GazeClass) -> Vec<ScreeningRecord> {
        vec![
            record(1.0, 1.0, gaze),
            record(1.5, 1.5, gaze),
            record(1.8, 1.9, gaze),
        ]
    }

    #[test]
    fn test_empty_history_has_no_data() {
        let verdict = decide(Vec::new());
        assert_eq!(verdict.decision, Verdict::NoData);
        assert!(verdict.sessions.is_empty());
    }

    #[test]
    fn test_low_pupil_and_averted_gaze_flags_signs() {
        let records = history(GazeClass::Left);
        let signals = HistorySignals::from_records(&records);

        assert!((signals.average_pupil - 1.4667).abs() < 1e-3);
        assert_eq!(signals.gaze_consistency, 0.0);

        let verdict = decide(records.clone());
        assert_eq!(verdict.decision, Verdict::SignsDetected);
        assert_eq!(verdict.sessions, records);
    }

    #[test]
    fn test_centered_gaze_outweighs_low_pupil() {
        let records = history(GazeClass::Center);
        assert_eq!(HistorySignals::from_records(&records).gaze_consistency, 1.0);
        assert_eq!(decide(records).decision, Verdict::NoConcerningSigns);
    }

    #[test]
    fn test_large_pupils_are_not_concerning() {
        let records = vec![record(4.0, 4.0, GazeClass::Left), record(5.0, 3.0, GazeClass::Right)];
        assert_eq!(decide(records).decision, Verdict::NoConcerningSigns);
    }

    #[test]
    fn test_non_finite_diameters_are_skipped_in_pupil_mean() {
        let records = vec![
            record(f64::NAN, 1.0, GazeClass::Left),
            record(3.0, 3.0, GazeClass::Left),
        ];
        let signals = HistorySignals::from_records(&records);
        assert_eq!(signals.average_pupil, 3.0);
        assert_eq!(signals.gaze_consistency, 0.0);
    }

    #[test]
    fn test_verdict_labels_serialize_verbatim() {
        let json = serde_json::to_string(&Verdict::SignsDetected).unwrap();
        assert_eq!(json, "\"Signs of ASD detected\"");
        assert_eq!(Verdict::NoData.to_string(), "No data available");
    }
}
