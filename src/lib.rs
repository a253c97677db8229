//! Adaptive concurrent RTT probing for continuously retuning traffic-shaping
//! latency targets.
//!
//! An [Engine] turns a list of candidate hosts into a single RTT decision
//! under a dynamically adjusted concurrency budget, while exposing a bounded,
//! lock-safe view of in-flight and recently finished work for observability.

#![deny(missing_docs)]

#[cfg(doctest)]
use doc_comment::doctest;
#[cfg(doctest)]
doctest!("../README.md");

pub mod aggregate;
pub mod config;
pub mod controller;
mod dispatcher;
mod engine;
mod history;
mod logs;
pub mod probe;
mod store;

pub use engine::{Engine, HostProvider, RttKind, ShapingAdjuster, SystemStatus};
pub use logs::{LogEntry, LogLevel};

/// Boxed error type for the external collaborator interfaces; their failure
/// modes belong to the host application, not this crate.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
