//! Core library for the Viber gateway
//!
//! This crate contains the platform-neutral domain types, including:
//! - Canonical messages produced by every channel adapter
//! - Task records and their ordered event history
//! - The gateway error taxonomy

pub mod error;
pub mod message;
pub mod task;

pub use error::{ChannelSendError, Error, VerificationError};
pub type Result<T> = std::result::Result<T, Error>;
