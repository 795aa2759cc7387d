pub mod gaze;
pub mod signal;
pub mod source;

pub use gaze::{FaceObservation, GazeAngles, GazeClassifier, GazeThresholds, GazeVerdict};
pub use signal::{DetectionSignal, SourceFrame};
pub use source::{
    ChannelSource, ChannelSourceRegistry, IdleSource, ReplaySource, ReplaySourceFactory,
    SignalSource, SignalSourceFactory,
};
