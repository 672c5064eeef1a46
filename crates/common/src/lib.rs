//! Shared types for the IBM Cloud authentication workspace

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
