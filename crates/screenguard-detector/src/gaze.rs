use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::signal::DetectionSignal;

/// Head-pose angles in degrees, derived externally from facial landmarks
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct GazeAngles {
    pub pitch: f64,
    pub yaw: f64,
}

impl GazeAngles {
    #[must_use]
    pub const fn new(pitch: f64, yaw: f64) -> Self {
        Self { pitch, yaw }
    }

    /// Angles that cannot be compared (NaN or infinite) are malformed
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        self.pitch.is_finite() && self.yaw.is_finite()
    }
}

impl From<(f64, f64)> for GazeAngles {
    fn from((pitch, yaw): (f64, f64)) -> Self {
        Self { pitch, yaw }
    }
}

/// Angular limits inside which a face counts as looking at the screen
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GazeThresholds {
    pub pitch_degrees: f64,
    pub yaw_degrees: f64,
}

impl Default for GazeThresholds {
    fn default() -> Self {
        Self {
            pitch_degrees: 15.0,
            yaw_degrees: 20.0,
        }
    }
}

impl GazeThresholds {
    /// Check that both limits are positive finite numbers
    ///
    /// # Errors
    ///
    /// Returns a description of the offending limit
    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [("pitch", self.pitch_degrees), ("yaw", self.yaw_degrees)] {
            if !value.is_finite() || value <= 0.0 {
                return Err(format!(
                    "{name} threshold must be a positive number of degrees, got {value}"
                ));
            }
        }
        Ok(())
    }
}

/// One face seen in a frame: its head pose and the detector's confidence in the face
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceObservation {
    pub angles: GazeAngles,
    pub detection_confidence: f64,
}

/// Verdict for a set of faces
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GazeVerdict {
    pub is_peeking: bool,
    pub confidence: f64,
}

/// Stateless gaze classifier
///
/// A face is looking at the screen when both `|pitch|` and `|yaw|` are strictly
/// below their thresholds. A frame is peeking when any face is looking; its
/// confidence is the highest detection confidence among the looking faces.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GazeClassifier {
    thresholds: GazeThresholds,
}

impl GazeClassifier {
    #[must_use]
    pub const fn new(thresholds: GazeThresholds) -> Self {
        Self { thresholds }
    }

    #[must_use]
    pub const fn thresholds(&self) -> GazeThresholds {
        self.thresholds
    }

    /// Determine whether a single head pose is directed at the screen
    ///
    /// Malformed angles never count as looking.
    #[must_use]
    pub fn is_looking_at_screen(&self, angles: GazeAngles) -> bool {
        if !angles.is_well_formed() {
            return false;
        }
        angles.pitch.abs() < self.thresholds.pitch_degrees
            && angles.yaw.abs() < self.thresholds.yaw_degrees
    }

    #[must_use]
    pub fn classify(&self, faces: &[FaceObservation]) -> GazeVerdict {
        let confidence = faces
            .iter()
            .filter(|face| self.is_looking_at_screen(face.angles))
            .map(|face| clamp_unit(face.detection_confidence))
            .fold(None, |best: Option<f64>, c| Some(best.map_or(c, |b| b.max(c))));

        match confidence {
            Some(confidence) => GazeVerdict {
                is_peeking: true,
                confidence,
            },
            None => GazeVerdict {
                is_peeking: false,
                confidence: 0.0,
            },
        }
    }

    /// Turn the raw faces of one frame into a detection signal
    #[must_use]
    pub fn classify_frame(
        &self,
        faces: &[FaceObservation],
        timestamp: DateTime<Utc>,
    ) -> DetectionSignal {
        let verdict = self.classify(faces);
        DetectionSignal::new(
            faces.len(),
            faces.iter().map(|f| f.angles).collect(),
            verdict.is_peeking,
            verdict.confidence,
            timestamp,
        )
    }
}

/// Clamp a confidence into `[0, 1]`; NaN becomes 0
#[must_use]
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(pitch: f64, yaw: f64, confidence: f64) -> FaceObservation {
        FaceObservation {
            angles: GazeAngles::new(pitch, yaw),
            detection_confidence: confidence,
        }
    }

    #[test]
    fn test_looking_within_default_thresholds() {
        let classifier = GazeClassifier::default();
        assert!(classifier.is_looking_at_screen(GazeAngles::new(10.0, 5.0)));
    }

    #[test]
    fn test_pitch_over_threshold_is_not_looking() {
        let classifier = GazeClassifier::default();
        assert!(!classifier.is_looking_at_screen(GazeAngles::new(20.0, 5.0)));
    }

    #[test]
    fn test_thresholds_compare_absolute_values() {
        let classifier = GazeClassifier::default();
        assert!(classifier.is_looking_at_screen(GazeAngles::new(-14.9, -19.9)));
        assert!(!classifier.is_looking_at_screen(GazeAngles::new(-15.0, 0.0)));
        assert!(!classifier.is_looking_at_screen(GazeAngles::new(0.0, -20.0)));
    }

    #[test]
    fn test_malformed_angles_are_not_peeking() {
        let classifier = GazeClassifier::default();
        assert!(!classifier.is_looking_at_screen(GazeAngles::new(f64::NAN, 0.0)));
        assert!(!classifier.is_looking_at_screen(GazeAngles::new(0.0, f64::INFINITY)));
    }

    #[test]
    fn test_custom_thresholds() {
        let classifier = GazeClassifier::new(GazeThresholds {
            pitch_degrees: 5.0,
            yaw_degrees: 5.0,
        });
        assert!(!classifier.is_looking_at_screen(GazeAngles::new(10.0, 1.0)));
        assert!(classifier.is_looking_at_screen(GazeAngles::new(4.0, 1.0)));
    }

    #[test]
    fn test_classify_takes_max_confidence_of_looking_faces() {
        let classifier = GazeClassifier::default();
        let verdict = classifier.classify(&[
            face(2.0, 3.0, 0.75),
            face(40.0, 3.0, 0.99),
            face(1.0, 1.0, 0.82),
        ]);
        assert!(verdict.is_peeking);
        assert!((verdict.confidence - 0.82).abs() < f64::EPSILON);
    }

    #[test]
    fn test_classify_no_looking_faces() {
        let classifier = GazeClassifier::default();
        let verdict = classifier.classify(&[face(40.0, 3.0, 0.99)]);
        assert!(!verdict.is_peeking);
        assert!(verdict.confidence.abs() < f64::EPSILON);

        let empty = classifier.classify(&[]);
        assert!(!empty.is_peeking);
    }

    #[test]
    fn test_classify_frame_builds_signal() {
        let classifier = GazeClassifier::default();
        let now = Utc::now();
        let signal = classifier.classify_frame(&[face(1.0, 2.0, 0.9), face(30.0, 2.0, 0.6)], now);
        assert_eq!(signal.face_count, 2);
        assert_eq!(signal.gaze_angles.len(), 2);
        assert!(signal.is_peeking);
        assert_eq!(signal.timestamp, now);
    }

    #[test]
    fn test_thresholds_validate() {
        assert!(GazeThresholds::default().validate().is_ok());
        let bad = GazeThresholds {
            pitch_degrees: 0.0,
            yaw_degrees: 20.0,
        };
        assert!(bad.validate().is_err());
        let nan = GazeThresholds {
            pitch_degrees: 15.0,
            yaw_degrees: f64::NAN,
        };
        assert!(nan.validate().is_err());
    }

    #[test]
    fn test_clamp_unit() {
        assert!((clamp_unit(1.5) - 1.0).abs() < f64::EPSILON);
        assert!(clamp_unit(-0.2).abs() < f64::EPSILON);
        assert!(clamp_unit(f64::NAN).abs() < f64::EPSILON);
    }
}
