//! Per-connection buffering of frame samples by stimulus.
//!
//! Samples are collected under the stimulus that was active when the frame
//! was captured. When a frame arrives for a different stimulus, the previous
//! bucket is finalized into a [`ScreeningRecord`] and removed. The bucket
//! that is still open when the stream ends is never finalized.

use crate::core::types::{AsdFlag, FrameSample, GazeClass, ScreeningRecord, UserId};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Both averaged diameters must fall strictly below this for a `high` flag.
pub const ASD_DIAMETER_THRESHOLD: f64 = 2.0;

/// Samples gathered for one stimulus since its bucket was opened.
#[derive(Debug, Clone, PartialEq)]
pub struct StimulusBucket {
    pub stimulus: String,
    pub samples: Vec<FrameSample>,
}

impl StimulusBucket {
    pub fn new(stimulus: impl Into<String>) -> Self {
        Self {
            stimulus: stimulus.into(),
            samples: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Mean (left, right) diameter. An empty bucket averages to zero.
    pub fn mean_diameters(&self) -> (f64, f64) {
        if self.samples.is_empty() {
            return (0.0, 0.0);
        }
        let n = self.samples.len() as f64;
        let left: f64 = self.samples.iter().map(|s| s.left).sum();
        let right: f64 = self.samples.iter().map(|s| s.right).sum();
        (left / n, right / n)
    }

    /// Most frequent gaze class; ties go to the class seen first.
    pub fn majority_gaze(&self) -> GazeClass {
        let mut counts: Vec<(GazeClass, usize)> = Vec::with_capacity(4);
        for sample in &self.samples {
            match counts.iter_mut().find(|(gaze, _)| *gaze == sample.gaze) {
                Some((_, count)) => *count += 1,
                None => counts.push((sample.gaze, 1)),
            }
        }

        let mut best: Option<(GazeClass, usize)> = None;
        for (gaze, count) in counts {
            if best.map_or(true, |(_, top)| count > top) {
                best = Some((gaze, count));
            }
        }
        best.map(|(gaze, _)| gaze).unwrap_or(GazeClass::Unknown)
    }

    /// Finalize into a record stamped with the triggering message's time.
    pub fn finalize(&self, user_id: &UserId, timestamp: DateTime<Utc>) -> ScreeningRecord {
        let (left, right) = self.mean_diameters();
        ScreeningRecord {
            user_id: user_id.clone(),
            timestamp,
            stimulus: self.stimulus.clone(),
            gaze_direction: self.majority_gaze(),
            left_pupil_size: left,
            right_pupil_size: right,
            asd_flag: asd_flag_for(left, right),
        }
    }
}

/// `high` iff both diameters are strictly below the threshold.
pub fn asd_flag_for(left: f64, right: f64) -> AsdFlag {
    if left < ASD_DIAMETER_THRESHOLD && right < ASD_DIAMETER_THRESHOLD {
        AsdFlag::High
    } else {
        AsdFlag::Low
    }
}

/// Stimulus-keyed buffer owned by a single connection.
#[derive(Debug)]
pub struct StimulusAggregator {
    user_id: UserId,
    buckets: HashMap<String, StimulusBucket>,
    active: Option<String>,
}

impl StimulusAggregator {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            buckets: HashMap::new(),
            active: None,
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn active_stimulus(&self) -> Option<&str> {
        self.active.as_deref()
    }

    /// Number of samples buffered under the active stimulus.
    pub fn pending_samples(&self) -> usize {
        self.active
            .as_ref()
            .and_then(|id| self.buckets.get(id))
            .map_or(0, StimulusBucket::len)
    }

    /// Buffer a sample under `stimulus`.
    ///
    /// Returns the finalized record of the previous stimulus when this call
    /// is a transition. `timestamp` belongs to the incoming frame and is the
    /// one stamped onto that record.
    pub fn observe(
        &mut self,
        stimulus: &str,
        timestamp: DateTime<Utc>,
        sample: FrameSample,
    ) -> Option<ScreeningRecord> {
        let mut flushed = None;

        // An empty stimulus id never counts as active, so its bucket is
        // never finalized.
        if let Some(active) = self.active.take() {
            if !active.is_empty() && active != stimulus {
                if let Some(bucket) = self.buckets.remove(&active) {
                    flushed = Some(bucket.finalize(&self.user_id, timestamp));
                }
            }
        }

        self.active = Some(stimulus.to_string());
        self.buckets
            .entry(stimulus.to_string())
            .or_insert_with(|| StimulusBucket::new(stimulus))
            .samples
            .push(sample);

        flushed
    }

    /// Drop all buffered state, returning the bucket that was still open.
    pub fn discard(&mut self) -> Option<StimulusBucket> {
        let active = self.active.take()?;
        let bucket = self.buckets.remove(&active);
        self.buckets.clear();
        bucket
    }
}
