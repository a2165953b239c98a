//! Remote-read backed by Graphite-web.
//!
//! A query becomes a set of Graphite targets in one of two ways:
//!
//! - **Path mode** expands `<prefix><name>.**` through the metrics API and
//!   keeps the leaves whose decoded labels satisfy every matcher.
//! - **Tag mode** sends a single `seriesByTag(...)` expression.
//!
//! Each target is then rendered over the query window by a small pool of
//! workers. A failing target is logged and skipped; partial data beats no
//! data for dashboards.

use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam::channel;
use reqwest::blocking::Client;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::config::{GraphiteConfig, ReadConfig};
use crate::error::ReadError;
use crate::matcher::{MatchType, Matcher};
use crate::model::METRIC_NAME_LABEL;
use crate::paths::{metric_labels_from_path, metric_labels_from_tags};
use crate::remote::{labels_to_proto, proto};
use crate::render::{
    Datapoint, EXPAND_ENDPOINT, ExpandResponse, RENDER_ENDPOINT, RenderResponse, fetch_json,
    prepare_url,
};

/// Concurrent render requests per query.
pub const MAX_FETCH_WORKERS: usize = 5;

/// Pairs needing more interpolated points than this are left as-is.
pub const MAX_INTERPOLATED_POINTS: i64 = 100_000;

/// A Graphite-web reader.
#[derive(Debug, Clone)]
pub struct Reader {
    http: Client,
    url: String,
    enable_tags: bool,
    max_point_delta: Duration,
    timeout: Duration,
    delay: Duration,
}

impl Reader {
    /// Creates a reader for the configured Graphite-web.
    ///
    /// # Errors
    ///
    /// Returns [`ReadError::ClientCreate`] if the HTTP client cannot be built.
    pub fn new(graphite: &GraphiteConfig, read: &ReadConfig) -> Result<Self, ReadError> {
        let http = Client::builder()
            .timeout(read.timeout)
            .build()
            .map_err(|source| ReadError::ClientCreate { source })?;
        Ok(Self {
            http,
            url: graphite.read.url.clone(),
            enable_tags: graphite.enable_tags,
            max_point_delta: graphite.read.max_point_delta,
            timeout: read.timeout,
            delay: read.delay,
        })
    }

    /// The Graphite-web base URL; empty when reads are disabled.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Answers a remote-read request.
    ///
    /// Returns `None` when no Graphite-web URL is configured. The whole call
    /// runs under the read timeout; the first failing query fails it.
    ///
    /// # Errors
    ///
    /// Returns the first query's [`ReadError`].
    pub fn read(
        &self,
        request: &proto::ReadRequest,
        prefix: &str,
        token: &CancelToken,
    ) -> Result<Option<proto::ReadResponse>, ReadError> {
        if self.url.is_empty() {
            return Ok(None);
        }
        debug!(queries = request.queries.len(), prefix, "remote read");

        let token = token.child_with_timeout(self.timeout);
        let results = request
            .queries
            .iter()
            .map(|query| self.handle_query(query, prefix, &token))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(proto::ReadResponse { results }))
    }

    /// Answers one query.
    ///
    /// # Errors
    ///
    /// Returns an error if the query cannot be turned into targets. Render
    /// failures of individual targets are logged and skipped.
    pub fn handle_query(
        &self,
        query: &proto::Query,
        prefix: &str,
        token: &CancelToken,
    ) -> Result<proto::QueryResult, ReadError> {
        let Some((from, until)) = query_window(query, unix_now(), self.delay) else {
            debug!("skipping query with empty time range");
            return Ok(proto::QueryResult::default());
        };

        let targets = if self.enable_tags {
            vec![series_by_tag(&query.matchers, prefix)?]
        } else {
            self.query_to_targets(&query.matchers, prefix, token)?
        };

        debug!(?targets, from, until, "fetching data");
        let timeseries = self.fetch_data(&targets, from, until, prefix, token);
        Ok(proto::QueryResult { timeseries })
    }

    /// Path mode: expands the metric name and filters leaves by matchers.
    ///
    /// # Errors
    ///
    /// Returns [`ReadError::MissingName`] without an equality matcher on the
    /// metric name, an error for an invalid matcher, or the expand request's
    /// error.
    pub fn query_to_targets(
        &self,
        matchers: &[proto::LabelMatcher],
        prefix: &str,
        token: &CancelToken,
    ) -> Result<Vec<String>, ReadError> {
        let name = matchers
            .iter()
            .filter(|m| m.name == METRIC_NAME_LABEL && m.r#type == MatchType::Equal as i32)
            .map(|m| m.value.as_str())
            .next_back()
            .unwrap_or_default();
        if name.is_empty() {
            return Err(ReadError::MissingName);
        }
        let matchers = compile_matchers(matchers)?;

        let query = format!("{prefix}{name}.**");
        let url = prepare_url(
            &self.url,
            EXPAND_ENDPOINT,
            &[("format", "json"), ("leavesOnly", "1"), ("query", &query)],
        )?;
        let expanded: ExpandResponse = fetch_json(&self.http, &url, token).inspect_err(|e| {
            warn!(%url, error = %e, "error fetching expand endpoint");
        })?;

        Ok(filter_targets(&matchers, expanded.results, prefix))
    }

    /// Renders one target over `[from, until]` seconds.
    ///
    /// # Errors
    ///
    /// Returns the render request's error, or a label error for a series whose
    /// path cannot be decoded.
    pub fn target_to_timeseries(
        &self,
        target: &str,
        from: i64,
        until: i64,
        prefix: &str,
        token: &CancelToken,
    ) -> Result<Vec<proto::TimeSeries>, ReadError> {
        let from = from.to_string();
        let until = until.to_string();
        let url = prepare_url(
            &self.url,
            RENDER_ENDPOINT,
            &[
                ("format", "json"),
                ("from", &from),
                ("until", &until),
                ("target", target),
            ],
        )?;
        let responses: Vec<RenderResponse> = fetch_json(&self.http, &url, token)?;

        responses
            .into_iter()
            .map(|response| {
                let labels = if self.enable_tags {
                    metric_labels_from_tags(&response.tags, prefix)
                } else {
                    metric_labels_from_path(&response.target, prefix).map_err(|e| {
                        warn!(path = %response.target, prefix, error = %e, "undecodable series path");
                        ReadError::Label {
                            target: response.target.clone(),
                            source: e,
                        }
                    })?
                };
                Ok(proto::TimeSeries {
                    labels: labels_to_proto(&labels),
                    samples: samples_from_datapoints(&response.datapoints, self.max_point_delta),
                })
            })
            .collect()
    }

    /// Renders every target with up to [`MAX_FETCH_WORKERS`] threads and
    /// gathers the series. Failed targets are logged and left out.
    pub fn fetch_data(
        &self,
        targets: &[String],
        from: i64,
        until: i64,
        prefix: &str,
        token: &CancelToken,
    ) -> Vec<proto::TimeSeries> {
        if targets.is_empty() {
            return Vec::new();
        }

        let (input_tx, input_rx) = channel::bounded::<&str>(targets.len());
        for target in targets {
            // Capacity covers every target and the receiver is alive.
            let _ = input_tx.send(target);
        }
        drop(input_tx);

        let (output_tx, output_rx) = channel::unbounded::<Vec<proto::TimeSeries>>();
        thread::scope(|scope| {
            for _ in 0..MAX_FETCH_WORKERS.min(targets.len()) {
                let input = input_rx.clone();
                let output = output_tx.clone();
                scope.spawn(move || {
                    for target in input {
                        match self.target_to_timeseries(target, from, until, prefix, token) {
                            Ok(series) => {
                                if output.send(series).is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!(
                                target = %target,
                                error = %e,
                                "error fetching and parsing target datapoints"
                            ),
                        }
                    }
                });
            }
            // The output closes once the last worker drops its sender.
            drop(output_tx);
            output_rx.iter().flatten().collect()
        })
    }
}

/// Compiles protobuf matchers.
///
/// # Errors
///
/// Returns [`ReadError::UnknownMatchType`] or [`ReadError::InvalidMatcher`].
pub fn compile_matchers(matchers: &[proto::LabelMatcher]) -> Result<Vec<Matcher>, ReadError> {
    matchers
        .iter()
        .map(|m| Matcher::new(MatchType::try_from(m.r#type)?, &m.name, &m.value))
        .collect()
}

/// Keeps the targets whose path-decoded labels satisfy every matcher.
///
/// A missing label compares as the empty string. Paths that do not decode
/// are logged and dropped.
pub fn filter_targets(matchers: &[Matcher], targets: Vec<String>, prefix: &str) -> Vec<String> {
    targets
        .into_iter()
        .filter(|target| {
            let labels = match metric_labels_from_path(target, prefix) {
                Ok(labels) => labels,
                Err(e) => {
                    warn!(path = %target, prefix, error = %e, "skipping target");
                    return false;
                }
            };
            debug!(%target, prefix, ?labels, "filtering target");
            matchers.iter().all(|m| {
                m.matches(labels.get(m.name()).map_or("", String::as_str))
            })
        })
        .collect()
}

/// Tag mode: builds the `seriesByTag` expression for a matcher list.
///
/// The metric name is sent as the `name` tag with the prefix prepended;
/// regexes are anchored.
///
/// # Errors
///
/// Returns [`ReadError::UnknownMatchType`] for a matcher type outside 0..=3.
pub fn series_by_tag(matchers: &[proto::LabelMatcher], prefix: &str) -> Result<String, ReadError> {
    let clauses = matchers
        .iter()
        .map(|m| {
            let (name, value) = if m.name == METRIC_NAME_LABEL {
                ("name", format!("{prefix}{}", m.value))
            } else {
                (m.name.as_str(), m.value.clone())
            };
            Ok(match MatchType::try_from(m.r#type)? {
                MatchType::Equal => format!("\"{name}={value}\""),
                MatchType::NotEqual => format!("\"{name}!={value}\""),
                MatchType::RegexMatch => format!("\"{name}=~^({value})$\""),
                MatchType::RegexNoMatch => format!("\"{name}!=~^({value})$\""),
            })
        })
        .collect::<Result<Vec<String>, ReadError>>()?;
    Ok(format!("seriesByTag({})", clauses.join(",")))
}

/// Converts datapoints to samples, skipping gaps.
///
/// With a non-zero `max_point_delta` (whole seconds), consecutive non-null
/// points further apart than that are linearly interpolated at that step.
/// Points whose timestamp does not fit in milliseconds are logged and
/// dropped.
pub fn samples_from_datapoints(
    datapoints: &[Datapoint],
    max_point_delta: Duration,
) -> Vec<proto::Sample> {
    let interval = i64::try_from(max_point_delta.as_secs()).unwrap_or(i64::MAX);
    let mut samples = Vec::with_capacity(datapoints.len());

    for (i, point) in datapoints.iter().enumerate() {
        let Some(value) = point.value else {
            continue;
        };
        let Some(timestamp_ms) = point.timestamp.checked_mul(1000) else {
            warn!(timestamp = point.timestamp, "skipping datapoint with out-of-range timestamp");
            continue;
        };
        samples.push(proto::Sample {
            value,
            timestamp: timestamp_ms,
        });

        if interval == 0 {
            continue;
        }
        let Some(next) = datapoints.get(i + 1) else {
            continue;
        };
        let Some(next_value) = next.value else {
            continue;
        };
        let Some(delta) = next.timestamp.checked_sub(point.timestamp) else {
            continue;
        };
        if delta / interval > MAX_INTERPOLATED_POINTS {
            warn!(
                from = point.timestamp,
                to = next.timestamp,
                "datapoints too far apart to interpolate"
            );
            continue;
        }

        #[allow(clippy::cast_precision_loss)] // second deltas are small
        let slope = (next_value - value) / delta as f64;
        for j in 1..delta / interval {
            let step = j * interval;
            let Some(timestamp_ms) = point
                .timestamp
                .checked_add(step)
                .and_then(|t| t.checked_mul(1000))
            else {
                break;
            };
            #[allow(clippy::cast_precision_loss)]
            let interpolated = value + step as f64 * slope;
            samples.push(proto::Sample {
                value: interpolated,
                timestamp: timestamp_ms,
            });
        }
    }
    samples
}

/// The `[from, until]` window in seconds for a query, with `until` capped at
/// `now - delay`. `None` when the capped window is empty.
pub fn query_window(query: &proto::Query, now_secs: i64, delay: Duration) -> Option<(i64, i64)> {
    let from = query.start_timestamp_ms / 1000;
    let delay = i64::try_from(delay.as_secs()).unwrap_or(i64::MAX);
    let until = (query.end_timestamp_ms / 1000).min(now_secs.saturating_sub(delay));
    (until >= from).then_some((from, until))
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lm(kind: MatchType, name: &str, value: &str) -> proto::LabelMatcher {
        proto::LabelMatcher {
            r#type: kind as i32,
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    fn dp(value: Option<f64>, timestamp: i64) -> Datapoint {
        Datapoint { value, timestamp }
    }

    fn query(start_ms: i64, end_ms: i64) -> proto::Query {
        proto::Query {
            start_timestamp_ms: start_ms,
            end_timestamp_ms: end_ms,
            ..proto::Query::default()
        }
    }

    #[test]
    fn test_series_by_tag() {
        let matchers = vec![
            lm(MatchType::Equal, "__name__", "up"),
            lm(MatchType::NotEqual, "job", "a"),
            lm(MatchType::RegexMatch, "dc", "eu.*"),
            lm(MatchType::RegexNoMatch, "host", "test-.*"),
        ];
        let target = series_by_tag(&matchers, "prefix.").unwrap();
        assert_eq!(
            target,
            r#"seriesByTag("name=prefix.up","job!=a","dc=~^(eu.*)$","host!=~^(test-.*)$")"#
        );
    }

    #[test]
    fn test_series_by_tag_unknown_type() {
        let mut matcher = lm(MatchType::Equal, "job", "a");
        matcher.r#type = 9;
        let err = series_by_tag(&[matcher], "").unwrap_err();
        assert!(matches!(err, ReadError::UnknownMatchType { kind: 9 }));
    }

    #[test]
    fn test_filter_targets() {
        let matchers = compile_matchers(&[
            lm(MatchType::Equal, "__name__", "up"),
            lm(MatchType::RegexMatch, "job", "node|api"),
            lm(MatchType::Equal, "env", ""),
        ])
        .unwrap();
        let targets = vec![
            "p.up.job.node".to_string(),
            "p.up.job.api.env.prod".to_string(),
            "p.up.job.db".to_string(),
            "p.up.job".to_string(),
        ];
        assert_eq!(filter_targets(&matchers, targets, "p."), ["p.up.job.node"]);
    }

    #[test]
    fn test_compile_matchers_rejects_bad_regex() {
        let err = compile_matchers(&[lm(MatchType::RegexMatch, "job", "(")]).unwrap_err();
        assert!(matches!(err, ReadError::InvalidMatcher { .. }));
    }

    #[test]
    fn test_missing_name_matcher() {
        let reader = Reader::new(&GraphiteConfig::default(), &ReadConfig::default()).unwrap();
        let token = CancelToken::new();
        for matchers in [
            vec![lm(MatchType::Equal, "job", "a")],
            vec![lm(MatchType::RegexMatch, "__name__", "up")],
            vec![lm(MatchType::Equal, "__name__", "")],
        ] {
            let err = reader.query_to_targets(&matchers, "", &token).unwrap_err();
            assert!(matches!(err, ReadError::MissingName));
        }
    }

    #[test]
    fn test_samples_skip_nulls() {
        let samples = samples_from_datapoints(
            &[dp(Some(1.0), 10), dp(None, 20), dp(Some(3.0), 30)],
            Duration::ZERO,
        );
        assert_eq!(
            samples,
            vec![
                proto::Sample {
                    value: 1.0,
                    timestamp: 10_000
                },
                proto::Sample {
                    value: 3.0,
                    timestamp: 30_000
                },
            ]
        );
    }

    #[test]
    fn test_samples_interpolated() {
        let samples = samples_from_datapoints(
            &[dp(Some(0.0), 0), dp(Some(100.0), 10)],
            Duration::from_secs(1),
        );
        assert_eq!(samples.len(), 11);
        for (i, sample) in samples.iter().enumerate() {
            let i = i as i64;
            assert_eq!(sample.timestamp, i * 1000);
            assert!((sample.value - (i as f64) * 10.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_samples_out_of_range_timestamp_dropped() {
        let samples = samples_from_datapoints(
            &[dp(Some(1.0), i64::MAX), dp(Some(2.0), 10), dp(Some(3.0), i64::MIN)],
            Duration::ZERO,
        );
        assert_eq!(
            samples,
            vec![proto::Sample {
                value: 2.0,
                timestamp: 10_000
            }]
        );
    }

    #[test]
    fn test_interpolation_with_extreme_timestamps() {
        // The delta between these overflows i64.
        let samples = samples_from_datapoints(
            &[dp(Some(1.0), -10), dp(Some(2.0), i64::MAX)],
            Duration::from_secs(60),
        );
        assert_eq!(
            samples,
            vec![proto::Sample {
                value: 1.0,
                timestamp: -10_000
            }]
        );

        // Too many steps between the points to fill in.
        let samples = samples_from_datapoints(
            &[dp(Some(1.0), 0), dp(Some(2.0), 1_000_000_000_000)],
            Duration::from_secs(1),
        );
        assert_eq!(samples.len(), 2);
    }

    #[test]
    fn test_no_interpolation_across_gap() {
        let samples = samples_from_datapoints(
            &[dp(Some(0.0), 0), dp(None, 10), dp(Some(100.0), 20)],
            Duration::from_secs(1),
        );
        assert_eq!(samples.len(), 2);
    }

    #[test]
    fn test_sub_second_delta_disables_interpolation() {
        let samples = samples_from_datapoints(
            &[dp(Some(0.0), 0), dp(Some(1.0), 10)],
            Duration::from_millis(500),
        );
        assert_eq!(samples.len(), 2);
    }

    #[test]
    fn test_query_window_capped_by_delay() {
        let window = query_window(&query(1_000_000, 9_000_000), 5_000, Duration::from_secs(1000));
        assert_eq!(window, Some((1_000, 4_000)));
    }

    #[test]
    fn test_query_window_empty() {
        let window = query_window(&query(4_500_000, 9_000_000), 5_000, Duration::from_secs(1000));
        assert_eq!(window, None);
    }

    #[test]
    fn test_read_without_url() {
        let reader = Reader::new(&GraphiteConfig::default(), &ReadConfig::default()).unwrap();
        let response = reader
            .read(&proto::ReadRequest::default(), "", &CancelToken::new())
            .unwrap();
        assert!(response.is_none());
    }

    #[test]
    fn test_fetch_data_without_targets() {
        let reader = Reader::new(&GraphiteConfig::default(), &ReadConfig::default()).unwrap();
        assert!(reader.fetch_data(&[], 0, 1, "", &CancelToken::new()).is_empty());
    }
}
