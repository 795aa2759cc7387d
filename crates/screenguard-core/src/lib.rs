pub mod config;
pub mod daemon;
pub mod error;
pub mod ipc;
pub mod push;
pub mod session_manager;
pub mod settings;

pub use config::ScreenGuardConfig;
pub use daemon::Daemon;
pub use error::{SessionError, TransportError};
pub use ipc::PushClient;
pub use push::{ControlMessage, DetectionUpdate, PushFrame, PushSink, StatusUpdate};
pub use session_manager::{ConnectionId, DetectionSessionManager, SessionOptions};
pub use settings::{ConfigAck, ConfigUpdate, DetectionSettings, DetectionStatus, SessionState};
