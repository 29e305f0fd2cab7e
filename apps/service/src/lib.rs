//! URL monitoring with traffic classification and failure alerting.
//!
//! Targets are checked on their own interval. Each check captures the
//! network traffic around the probe and classifies it into subsequent
//! requests. The outcome feeds a per-target alert state machine that
//! posts webhook notifications.

pub mod alerting;
pub mod capture;
pub mod classify;
pub mod config;
pub mod database;
pub mod error;
pub mod models;
pub mod monitoring;
pub mod notify;
pub mod orchestrator;
pub mod pool;
pub mod validation;

pub use config::Config;
pub use orchestrator::Orchestrator;
