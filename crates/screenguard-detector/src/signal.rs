use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::gaze::{clamp_unit, FaceObservation, GazeAngles, GazeClassifier};

/// Per-frame detection output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionSignal {
    pub face_count: usize,
    #[serde(default)]
    pub gaze_angles: Vec<GazeAngles>,
    pub is_peeking: bool,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}

impl DetectionSignal {
    /// Build a signal, clamping the confidence into `[0, 1]`
    #[must_use]
    pub fn new(
        face_count: usize,
        gaze_angles: Vec<GazeAngles>,
        is_peeking: bool,
        confidence: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            face_count,
            gaze_angles,
            is_peeking,
            confidence: clamp_unit(confidence),
            timestamp,
        }
    }

    /// A frame in which nothing was detected
    #[must_use]
    pub fn empty(timestamp: DateTime<Utc>) -> Self {
        Self::new(0, Vec::new(), false, 0.0, timestamp)
    }
}

/// What a signal source hands to the sampling loop
///
/// Sources either classify frames themselves or pass the raw faces along so the
/// session's classifier settings apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceFrame {
    Signal(DetectionSignal),
    Faces {
        faces: Vec<FaceObservation>,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
    },
}

impl SourceFrame {
    /// Resolve the frame into a signal, running raw faces through `classifier`
    #[must_use]
    pub fn into_signal(self, classifier: &GazeClassifier) -> DetectionSignal {
        match self {
            Self::Signal(signal) => DetectionSignal {
                confidence: clamp_unit(signal.confidence),
                ..signal
            },
            Self::Faces { faces, timestamp } => {
                classifier.classify_frame(&faces, timestamp.unwrap_or_else(Utc::now))
            }
        }
    }

    /// Replace the frame's timestamp, used when replaying recorded frames
    #[must_use]
    pub fn restamped(self, timestamp: DateTime<Utc>) -> Self {
        match self {
            Self::Signal(signal) => Self::Signal(DetectionSignal { timestamp, ..signal }),
            Self::Faces { faces, .. } => Self::Faces {
                faces,
                timestamp: Some(timestamp),
            },
        }
    }
}
