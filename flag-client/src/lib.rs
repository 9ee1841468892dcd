pub mod analytics;
pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod flags;
pub mod offline;
pub mod polling;
pub mod realtime;

// Always compiled so integration tests can share the fixtures and the mock API.
pub mod test_utils;

pub use client::{ClientOptions, FlagClient, IdentitySegment};
pub use config::Config;
pub use error::FlagError;
pub use flags::{Flag, Flags};
