//! Gatesync - durable, validated proxy configuration synchronization
//!
//! This library turns the desired state of a reverse-proxy gateway into
//! nginx configuration files, and keeps them only if the proxy accepts them:
//! - Renders the main config, virtual servers and upstream pools from templates
//! - Normalizes rendered text through an external filter, falling back to raw output
//! - Backs up every file before writing and rolls back when validation fails
//! - Commits a virtual server and its upstream pool jointly, validated once
//! - Serializes writes per routing domain while domains proceed in parallel

pub mod buffer;
pub mod command;
pub mod config;
pub mod error;
pub mod layout;
pub mod locks;
pub mod model;
pub mod state;
pub mod sync;
pub mod template;
pub mod writer;

pub use error::SyncError;
pub use sync::{BatchReport, ConfigSynchronizer, Outcome};
