//! # graphite-bridge
//!
//! Prometheus remote storage backed by Graphite.
//!
//! graphite-bridge accepts Prometheus remote-write samples and forwards them
//! to Carbon as plaintext lines, and answers remote-read queries from
//! Graphite-web. Labels travel in the Carbon path itself, escaped so that the
//! read side can decode them again, or through user-configured path
//! templates.
//!
//! ## Key Properties
//!
//! - One persistent, periodically refreshed carbon connection (TCP or UDP)
//! - Optional LZ4 frame compression streamed onto the socket
//! - Ordered, templated path rules with short-circuiting
//! - Reads through path expansion or Graphite's tag index
//! - Configuration hot swap without dropping in-flight writes
//!
//! ## Quick Start
//!
//! ```rust
//! use std::str::FromStr;
//!
//! use graphite_bridge::{CancelToken, Config, GraphiteClient, Sample};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::from_str(
//!     r#"
//!     [graphite]
//!     default_prefix = "prometheus."
//!
//!     [graphite.write]
//!     carbon_address = "localhost:2003"
//!     "#,
//! )?;
//! let client = GraphiteClient::new(&config)?;
//!
//! let sample = Sample::new("node_load1", [("instance", "web1")], 0.42, 1_700_000_000_000);
//!
//! // A dry run renders the lines without touching the network.
//! let lines = client.write(&[sample], 0, None, true, &CancelToken::new())?;
//! assert_eq!(lines, b"prometheus.node_load1.instance.web1 0.420000 1700000000\n");
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`Gateway`] — Request bodies in, response bodies out; owns the active config
//! - [`GraphiteClient`] — One config snapshot's carbon writer, reader and paths cache
//! - [`Config`] — TOML configuration, rules compiled at load time
//!
//! ## Modules
//!
//! - [`escape`] — Reversible label escaping for Carbon paths
//! - [`template`] — Path templates and their function table
//! - [`paths`] — Metric to path rules, and paths back to labels
//! - [`write`] — Batching and streaming lines to carbon
//! - [`carbon`] — The reconnecting carbon socket
//! - [`compress`] — Plain and LZ4 stream codecs
//! - [`read`] — Query to targets, concurrent render fetches
//! - [`render`] — Graphite-web JSON types and HTTP helpers
//! - [`remote`] — Prometheus remote-write/read protobuf bodies
//! - [`error`] — Error types

pub mod cache;
pub mod cancel;
pub mod carbon;
pub mod client;
pub mod compress;
pub mod config;
pub mod error;
pub mod escape;
pub mod gateway;
pub mod matcher;
pub mod model;
pub mod paths;
pub mod read;
pub mod remote;
pub mod render;
pub mod template;
pub mod write;

// Re-export primary API types at crate root for convenience.
pub use cancel::CancelToken;
pub use client::{ClientStats, GraphiteClient};
pub use config::Config;
pub use error::{BridgeError, Result};
pub use gateway::{Gateway, PREFIX_QUERY_PARAM};
pub use matcher::{MatchType, Matcher};
pub use model::{Metric, Sample};
pub use paths::Rule;
pub use template::Template;
