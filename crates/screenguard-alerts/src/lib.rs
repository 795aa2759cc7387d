pub mod engine;
pub mod error;
pub mod handler;
pub mod stats;
pub mod types;
pub mod webhook;

pub use engine::{AlertDispatchEngine, EngineOptions, Rejection};
pub use error::{validate_user_id, AlertError};
pub use handler::{AlertHandler, FnHandler, LogHandler};
pub use stats::AlertStats;
pub use types::{
    AlertEvent, AlertLevel, AlertRequest, Channel, ChannelConfig, ChannelConfigUpdate, Metadata,
    DEFAULT_PEEK_MESSAGE, DEFAULT_WINDOW_SECONDS,
};
pub use webhook::{retry_delay, AttemptOutcome, WebhookHandler};
