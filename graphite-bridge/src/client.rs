//! The Graphite storage client.
//!
//! [`GraphiteClient`] binds one configuration snapshot to its resources: the
//! carbon writer, the Graphite-web reader and the paths cache. A new
//! configuration means a new client; nothing in here is reconfigured in
//! place.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::cache::PathsCache;
use crate::cancel::CancelToken;
use crate::config::{Config, GraphiteConfig};
use crate::error::{PathError, ReadError, WriteError};
use crate::model::Sample;
use crate::paths::{datapoint_lines, paths_from_metric, to_datapoints};
use crate::read::Reader;
use crate::remote::proto;
use crate::write::{CarbonWriter, prepare_write};

/// Response body of a write when no carbon address is configured.
pub const SKIPPED_RESPONSE: &[u8] = b"Skipped: Not set carbon address.";

/// Response body of a completed write.
pub const DONE_RESPONSE: &[u8] = b"Done.";

/// Counters exposed by a client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStats {
    /// Samples dropped because their lines could not be rendered.
    pub ignored_samples: u64,
}

/// Reads from Graphite-web and writes to carbon for one configuration.
#[derive(Debug)]
pub struct GraphiteClient {
    graphite: GraphiteConfig,
    writer: CarbonWriter,
    reader: Reader,
    cache: Option<PathsCache>,
    ignored_samples: AtomicU64,
}

impl GraphiteClient {
    /// Creates a client. No connection is opened until the first write.
    ///
    /// # Errors
    ///
    /// Returns [`ReadError::ClientCreate`] if the HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self, ReadError> {
        let graphite = config.graphite.clone();
        let write = &graphite.write;
        let cache = write
            .enable_paths_cache
            .then(|| PathsCache::new(write.paths_cache_ttl, write.paths_cache_purge_interval));

        Ok(Self {
            writer: CarbonWriter::new(write, config.write.timeout),
            reader: Reader::new(&graphite, &config.read)?,
            cache,
            ignored_samples: AtomicU64::new(0),
            graphite,
        })
    }

    /// Storage name, for logs.
    pub fn name(&self) -> &'static str {
        "graphite"
    }

    /// Current counters.
    pub fn stats(&self) -> ClientStats {
        ClientStats {
            ignored_samples: self.ignored_samples.load(Ordering::Relaxed),
        }
    }

    /// The paths cache, when enabled.
    pub fn paths_cache(&self) -> Option<&PathsCache> {
        self.cache.as_ref()
    }

    /// Renders the Carbon lines of one sample under `prefix`.
    ///
    /// # Errors
    ///
    /// Returns [`PathError::InvalidSampleValue`] for NaN or infinite values.
    pub fn lines(&self, sample: &Sample, prefix: &str) -> Result<Vec<Vec<u8>>, PathError> {
        let write = &self.graphite.write;
        let Some(cache) = &self.cache else {
            return to_datapoints(sample, prefix, &write.rules, &write.template_data);
        };
        if !sample.value.is_finite() {
            return Err(PathError::InvalidSampleValue {
                value: sample.value,
            });
        }
        let paths = cache.get_or_insert_with(prefix, &sample.metric, || {
            paths_from_metric(&sample.metric, prefix, &write.rules, &write.template_data)
        });
        datapoint_lines(&paths, sample)
    }

    /// Writes samples to carbon.
    ///
    /// Returns a short status body: [`SKIPPED_RESPONSE`] when no carbon
    /// address is configured, the rendered lines for a dry run, and
    /// [`DONE_RESPONSE`] once everything was sent. Samples that cannot be
    /// rendered are skipped and counted in [`ClientStats::ignored_samples`].
    ///
    /// # Errors
    ///
    /// Returns [`WriteError::Cancelled`] if `token` is cancelled before I/O
    /// begins, or the dial/send error that ended the write.
    pub fn write(
        &self,
        samples: &[Sample],
        buf_len_hint: usize,
        prefix_override: Option<&str>,
        dry_run: bool,
        token: &CancelToken,
    ) -> Result<Vec<u8>, WriteError> {
        if self.graphite.write.carbon_address.is_empty() {
            return Ok(SKIPPED_RESPONSE.to_vec());
        }

        let prefix = self.graphite.storage_prefix(prefix_override);
        debug!(num_samples = samples.len(), storage = self.name(), "remote write");

        let prepared = prepare_write(samples, self.writer.transport(), buf_len_hint, |sample| {
            self.lines(sample, prefix)
        });
        if prepared.skipped > 0 {
            self.ignored_samples
                .fetch_add(prepared.skipped, Ordering::Relaxed);
        }

        if dry_run {
            return Ok(prepared.concat());
        }
        self.writer.send(&prepared.buffers, token)?;
        Ok(DONE_RESPONSE.to_vec())
    }

    /// Answers a remote-read request from Graphite-web.
    ///
    /// Returns `None` when no Graphite-web URL is configured.
    ///
    /// # Errors
    ///
    /// Returns the [`ReadError`] of the first failing query.
    pub fn read(
        &self,
        request: &proto::ReadRequest,
        prefix_override: Option<&str>,
        token: &CancelToken,
    ) -> Result<Option<proto::ReadResponse>, ReadError> {
        let prefix = self.graphite.storage_prefix(prefix_override);
        self.reader.read(request, prefix, token)
    }

    /// Closes the carbon connection. Waits for an in-flight write.
    pub fn shutdown(&self) {
        self.writer.close();
        if let Some(cache) = &self.cache {
            cache.clear();
        }
    }
}

impl fmt::Display for GraphiteClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[carbon={} graphite-web={}]",
            self.name(),
            self.graphite.write.carbon_address,
            self.reader.url()
        )
    }
}
