pub mod config;
pub mod helpers;
pub mod serve;
pub mod status;
pub mod watch;
