//! Request-level entry points.
//!
//! [`Gateway`] owns the active configuration and the client built from it,
//! and turns request bodies into client calls. An HTTP server embeds it by
//! routing `POST /write` to [`Gateway::write_body`] and `POST /read` to
//! [`Gateway::read_body`], passing the [`PREFIX_QUERY_PARAM`] query value as
//! the prefix override.
//!
//! Configuration reloads swap the pair under a write lock. Requests clone
//! the current pair and release the lock before doing any I/O, so a reload
//! never waits for a slow Graphite-web; it only waits for the in-flight
//! carbon send when closing the old connection.

use std::sync::Arc;

use parking_lot::RwLock;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::client::GraphiteClient;
use crate::config::Config;
use crate::error::{RemoteError, Result};
use crate::model::{Metric, Sample};
use crate::remote::{self, proto};

/// Query parameter carrying a per-request storage prefix.
pub const PREFIX_QUERY_PARAM: &str = "graphite.default-prefix";

/// A sample in the JSON test-write format.
///
/// ```json
/// {"metric": {"__name__": "up", "job": "node"}, "value": 1, "timestamp": 1609459200000}
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct JsonSample {
    /// Labels, including `__name__`.
    pub metric: Metric,
    /// The sample value.
    pub value: f64,
    /// Milliseconds since epoch; zero when omitted.
    #[serde(default)]
    pub timestamp: i64,
}

impl From<JsonSample> for Sample {
    fn from(sample: JsonSample) -> Self {
        Self {
            metric: sample.metric,
            value: sample.value,
            timestamp_ms: sample.timestamp,
        }
    }
}

#[derive(Debug, Clone)]
struct State {
    config: Arc<Config>,
    client: Arc<GraphiteClient>,
}

/// The active configuration and its client.
#[derive(Debug)]
pub struct Gateway {
    state: RwLock<State>,
}

impl Gateway {
    /// Builds a gateway for `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the client cannot be built.
    pub fn new(config: Config) -> Result<Self> {
        let state = build_state(config)?;
        Ok(Self {
            state: RwLock::new(state),
        })
    }

    /// The active configuration.
    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.state.read().config)
    }

    /// The active client.
    pub fn client(&self) -> Arc<GraphiteClient> {
        Arc::clone(&self.state.read().client)
    }

    /// Replaces the configuration and rebuilds the client.
    ///
    /// The new client is built before the old one is touched; on failure the
    /// gateway keeps running on the old configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the new client cannot be built.
    pub fn apply_config(&self, config: Config) -> Result<()> {
        let next = build_state(config)?;
        let previous = std::mem::replace(&mut *self.state.write(), next);
        previous.client.shutdown();
        info!(previous = %previous.client, "applied new configuration");
        Ok(())
    }

    /// Handles a snappy-compressed remote-write body.
    ///
    /// The decompressed size is the hint for the TCP buffer capacity.
    ///
    /// # Errors
    ///
    /// Returns a decode error for a malformed body or the client's write
    /// error.
    pub fn write_body(
        &self,
        body: &[u8],
        prefix_override: Option<&str>,
        dry_run: bool,
        token: &CancelToken,
    ) -> Result<Vec<u8>> {
        let samples = remote::decode_write_request(body)?;
        let buf_len_hint = snap::raw::decompress_len(body).unwrap_or(body.len());
        self.write_samples(&samples, buf_len_hint, prefix_override, dry_run, token)
    }

    /// Handles a JSON array of [`JsonSample`]s.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Json`] for malformed JSON, or the client's
    /// write error.
    pub fn write_json(
        &self,
        body: &[u8],
        prefix_override: Option<&str>,
        dry_run: bool,
        token: &CancelToken,
    ) -> Result<Vec<u8>> {
        let samples: Vec<JsonSample> =
            serde_json::from_slice(body).map_err(|source| RemoteError::Json { source })?;
        let samples: Vec<Sample> = samples.into_iter().map(Sample::from).collect();
        self.write_samples(&samples, body.len(), prefix_override, dry_run, token)
    }

    /// Writes decoded samples through the active client.
    ///
    /// # Errors
    ///
    /// Returns the client's write error.
    pub fn write_samples(
        &self,
        samples: &[Sample],
        buf_len_hint: usize,
        prefix_override: Option<&str>,
        dry_run: bool,
        token: &CancelToken,
    ) -> Result<Vec<u8>> {
        let client = self.client();
        Ok(client.write(samples, buf_len_hint, prefix_override, dry_run, token)?)
    }

    /// Handles a snappy-compressed remote-read body and returns the encoded
    /// response body.
    ///
    /// The response always has one result per query. With reads disabled
    /// every result is empty. A failed read is answered the same way when
    /// `read.ignore_error` is set and returned as an error otherwise.
    ///
    /// # Errors
    ///
    /// Returns a decode or encode error, or the read error when errors are
    /// not ignored.
    pub fn read_body(
        &self,
        body: &[u8],
        prefix_override: Option<&str>,
        token: &CancelToken,
    ) -> Result<Vec<u8>> {
        let request = remote::decode_read_request(body)?;
        let State { config, client } = self.state.read().clone();

        let response = match client.read(&request, prefix_override, token) {
            Ok(Some(response)) => response,
            Ok(None) => {
                debug!("graphite-web url not set, answering with empty results");
                empty_response(&request)
            }
            Err(e) if config.read.ignore_error => {
                warn!(error = %e, "error reading from graphite-web, answering with empty results");
                empty_response(&request)
            }
            Err(e) => return Err(e.into()),
        };
        Ok(remote::encode_read_response(&response)?)
    }
}

/// Extracts the [`PREFIX_QUERY_PARAM`] value from a raw URL query string.
///
/// Returns `None` when the parameter is absent.
pub fn prefix_from_query(query: &str) -> Option<String> {
    let url = Url::parse(&format!("http://localhost/?{}", query.trim_start_matches('?'))).ok()?;
    url.query_pairs()
        .find(|(key, _)| key == PREFIX_QUERY_PARAM)
        .map(|(_, value)| value.into_owned())
}

fn build_state(config: Config) -> Result<State> {
    let client = GraphiteClient::new(&config)?;
    info!(client = %client, "built client");
    Ok(State {
        config: Arc::new(config),
        client: Arc::new(client),
    })
}

fn empty_response(request: &proto::ReadRequest) -> proto::ReadResponse {
    proto::ReadResponse {
        results: vec![proto::QueryResult::default(); request.queries.len()],
    }
}
