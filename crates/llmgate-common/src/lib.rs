//! Configuration and error types shared by every `llmgate` crate.
//!
//! This crate intentionally stays free of `axum`/`tokio` so it can be pulled
//! into translation and dispatcher code without dragging in the HTTP stack.

pub mod config;
pub mod error;

pub use config::{CoolingPeriodConfig, GlobalConfig, GlobalConfigPatch, ModelMapping};
pub use error::{ErrorBody, ErrorPayload, GatewayError};
