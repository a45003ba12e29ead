//! precis - content-addressable request dispatcher for a multi-stage text
//! summarization pipeline
//!
//! Identical requests resolve to one job, pre-processed text is reused
//! across jobs sharing a raw source, and uploaded files are stored once per
//! distinct content. All coordination state lives in SQLite, so dispatcher
//! instances can be scaled out freely.

pub mod bus;
pub mod cache;
pub mod commands;
pub mod config;
pub mod content;
pub mod dispatcher;
pub mod error;
pub mod fingerprint;
pub mod meta;
pub mod registry;

pub use config::Config;
pub use error::{Error, Result};
