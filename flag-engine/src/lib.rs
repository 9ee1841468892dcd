pub mod engine;
pub mod environments;
pub mod error;
pub mod features;
pub mod hashing;
pub mod identities;
pub mod segments;

pub use error::EngineError;
