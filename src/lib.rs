//! Sibyl -- multi-provider language-model gateway over line-delimited
//! JSON-RPC 2.0.
//!
//! A single local client attaches via stdin/stdout and calls three tools:
//! `models`, `advice`, and `idiom`. Advice either runs single-shot against
//! a provider (with structured-output probing and text fallback) or as a
//! tracked conversation turn persisted in SQLite, deduplicated by a stable
//! input hash and driven by a backoff poller.

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod idiom;
pub mod models;
pub mod provider;
pub mod rpc;
pub mod store;
pub mod types;
pub mod util;

pub use context::AppContext;
pub use error::{Result, SibylError};
