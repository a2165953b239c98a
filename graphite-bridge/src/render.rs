//! Graphite-web HTTP API: URL building, fetching and response types.

use std::collections::BTreeMap;
use std::fmt;

use reqwest::Url;
use reqwest::blocking::Client;
use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cancel::CancelToken;
use crate::error::ReadError;

/// Render API path.
pub const RENDER_ENDPOINT: &str = "/render/";

/// Expand API path.
pub const EXPAND_ENDPOINT: &str = "/metrics/expand";

/// Response bodies are cut to this many characters in logs and errors.
const BODY_LOG_CHARS: usize = 140;

/// Largest timestamp magnitude, in seconds, that still fits in milliseconds.
pub const MAX_TIMESTAMP_SECS: i64 = i64::MAX / 1000;

/// One `[value, timestamp]` pair of a render response.
///
/// `null` values stay `None`; they are gaps, not zeros.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Datapoint {
    /// The value, or `None` for a gap.
    pub value: Option<f64>,
    /// Seconds since epoch.
    pub timestamp: i64,
}

impl<'de> Deserialize<'de> for Datapoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PairVisitor;

        impl<'de> Visitor<'de> for PairVisitor {
            type Value = Datapoint;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a [value, timestamp] pair")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Datapoint, A::Error> {
                let value: Option<f64> = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let timestamp: f64 = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                if seq.next_element::<de::IgnoredAny>()?.is_some() {
                    return Err(de::Error::invalid_length(3, &self));
                }
                #[allow(clippy::cast_precision_loss)]
                let bound = MAX_TIMESTAMP_SECS as f64;
                if !timestamp.is_finite() || timestamp.abs() > bound {
                    return Err(de::Error::invalid_value(
                        de::Unexpected::Float(timestamp),
                        &"a timestamp in seconds within the millisecond range",
                    ));
                }
                #[allow(clippy::cast_possible_truncation)] // Graphite timestamps are whole seconds
                let timestamp = timestamp as i64;
                Ok(Datapoint { value, timestamp })
            }
        }

        deserializer.deserialize_seq(PairVisitor)
    }
}

/// One series of a render response.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RenderResponse {
    /// The target path or expression.
    pub target: String,
    /// Series tags; only tag-indexed Graphite fills these in.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Datapoints in timestamp order.
    pub datapoints: Vec<Datapoint>,
}

/// Expand API response.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ExpandResponse {
    /// Matching leaf paths.
    pub results: Vec<String>,
}

/// Joins `endpoint` onto `base` and appends query parameters in order.
///
/// # Errors
///
/// Returns [`ReadError::Url`] if `base` is not an absolute URL.
pub fn prepare_url(base: &str, endpoint: &str, params: &[(&str, &str)]) -> Result<Url, ReadError> {
    let mut url = Url::parse(base).map_err(|e| ReadError::Url {
        url: base.to_string(),
        reason: e.to_string(),
    })?;
    if url.cannot_be_a_base() {
        return Err(ReadError::Url {
            url: base.to_string(),
            reason: "not a base URL".to_string(),
        });
    }

    let path = format!(
        "{}/{}",
        url.path().trim_end_matches('/'),
        endpoint.trim_start_matches('/')
    );
    url.set_path(&path);
    url.query_pairs_mut().extend_pairs(params);
    Ok(url)
}

/// Fetches a URL and returns the body.
///
/// The request timeout is the token's remaining time; an expired or
/// cancelled token fails without sending anything.
///
/// # Errors
///
/// Returns [`ReadError::DeadlineExceeded`] for a done token,
/// [`ReadError::Request`] for transport errors, and
/// [`ReadError::HttpStatus`] for non-success responses.
pub fn fetch_url(client: &Client, url: &Url, token: &CancelToken) -> Result<Vec<u8>, ReadError> {
    let mut request = client.get(url.clone());
    match token.remaining() {
        Some(remaining) if remaining.is_zero() => {
            return Err(ReadError::DeadlineExceeded {
                url: url.to_string(),
            });
        }
        Some(remaining) => request = request.timeout(remaining),
        None => {}
    }

    let response = request.send().map_err(|source| ReadError::Request {
        url: url.to_string(),
        source,
    })?;
    let status = response.status();
    let body = response.bytes().map_err(|source| ReadError::Request {
        url: url.to_string(),
        source,
    })?;

    if !status.is_success() {
        let body = truncate_chars(&String::from_utf8_lossy(&body), BODY_LOG_CHARS);
        return Err(ReadError::HttpStatus {
            url: url.to_string(),
            status: status.as_u16(),
            body,
        });
    }
    Ok(body.to_vec())
}

/// Fetches a URL and decodes its JSON body.
///
/// # Errors
///
/// Returns the [`fetch_url`] errors, or [`ReadError::Decode`] if the body
/// does not decode as `T`.
pub fn fetch_json<T>(client: &Client, url: &Url, token: &CancelToken) -> Result<T, ReadError>
where
    T: for<'de> Deserialize<'de>,
{
    let body = fetch_url(client, url, token)?;
    serde_json::from_slice(&body).map_err(|source| {
        warn!(
            %url,
            body = %truncate_chars(&String::from_utf8_lossy(&body), BODY_LOG_CHARS),
            error = %source,
            "error parsing graphite-web response body"
        );
        ReadError::Decode {
            url: url.to_string(),
            source,
        }
    })
}

/// Cuts `s` to at most `max` characters, marking the cut with `...`.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((end, _)) => format!("{}...", &s[..end]),
        None => s.to_string(),
    }
}
