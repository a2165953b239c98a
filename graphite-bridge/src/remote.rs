//! Prometheus remote-write and remote-read payloads.
//!
//! Both protocols carry a snappy-compressed (block format) protobuf message
//! in the HTTP body. This module only deals with bodies; routing and HTTP
//! status handling belong to whatever server embeds the gateway.

use prost::Message;

use crate::error::RemoteError;
use crate::model::{Metric, Sample};

/// Prometheus remote storage protobuf types.
///
/// Hand-written types matching `prometheus/prompb/remote.proto` and
/// `types.proto`; prost derives avoid a protoc build step.
pub mod proto {
    /// A write request containing one or more time series.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct WriteRequest {
        /// The time series to write.
        #[prost(message, repeated, tag = "1")]
        pub timeseries: Vec<TimeSeries>,
    }

    /// A single time series with labels and samples.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct TimeSeries {
        /// Metric labels identifying the series.
        #[prost(message, repeated, tag = "1")]
        pub labels: Vec<Label>,
        /// Data samples for this series.
        #[prost(message, repeated, tag = "2")]
        pub samples: Vec<Sample>,
    }

    /// A key-value label pair.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Label {
        /// Label name.
        #[prost(string, tag = "1")]
        pub name: String,
        /// Label value.
        #[prost(string, tag = "2")]
        pub value: String,
    }

    /// A single data sample (value + timestamp).
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Sample {
        /// The sample value.
        #[prost(double, tag = "1")]
        pub value: f64,
        /// Timestamp in milliseconds since epoch.
        #[prost(int64, tag = "2")]
        pub timestamp: i64,
    }

    /// A remote-read request.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct ReadRequest {
        /// Queries, answered in order.
        #[prost(message, repeated, tag = "1")]
        pub queries: Vec<Query>,
    }

    /// One selector over a time range.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Query {
        /// Range start in milliseconds since epoch.
        #[prost(int64, tag = "1")]
        pub start_timestamp_ms: i64,
        /// Range end in milliseconds since epoch.
        #[prost(int64, tag = "2")]
        pub end_timestamp_ms: i64,
        /// Label matchers, all of which must hold.
        #[prost(message, repeated, tag = "3")]
        pub matchers: Vec<LabelMatcher>,
        /// Optional evaluation hints; not used for fetching.
        #[prost(message, optional, tag = "4")]
        pub hints: Option<ReadHints>,
    }

    /// A label matcher as sent by Prometheus.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct LabelMatcher {
        /// Match type: 0 `=`, 1 `!=`, 2 `=~`, 3 `!~`. An enum on the wire,
        /// which encodes as an int32 varint.
        #[prost(int32, tag = "1")]
        pub r#type: i32,
        /// Label name.
        #[prost(string, tag = "2")]
        pub name: String,
        /// Value or regex.
        #[prost(string, tag = "3")]
        pub value: String,
    }

    /// Query hints from the PromQL engine.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct ReadHints {
        /// Query step in milliseconds.
        #[prost(int64, tag = "1")]
        pub step_ms: i64,
        /// Function wrapping the selector, if any.
        #[prost(string, tag = "2")]
        pub func: String,
        /// Start of the selected range in milliseconds.
        #[prost(int64, tag = "3")]
        pub start_ms: i64,
        /// End of the selected range in milliseconds.
        #[prost(int64, tag = "4")]
        pub end_ms: i64,
    }

    /// A remote-read response.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct ReadResponse {
        /// One result per query, in request order.
        #[prost(message, repeated, tag = "1")]
        pub results: Vec<QueryResult>,
    }

    /// The series answering one query.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct QueryResult {
        /// Matching series.
        #[prost(message, repeated, tag = "1")]
        pub timeseries: Vec<TimeSeries>,
    }
}

/// Converts a label set to the protobuf form, sorted by name.
pub fn labels_to_proto(metric: &Metric) -> Vec<proto::Label> {
    metric
        .iter()
        .map(|(name, value)| proto::Label {
            name: name.clone(),
            value: value.clone(),
        })
        .collect()
}

/// Decodes a remote-write body into one [`Sample`] per protobuf sample.
///
/// # Errors
///
/// Returns [`RemoteError::Decompression`] or [`RemoteError::Decode`] for a
/// malformed body.
pub fn decode_write_request(body: &[u8]) -> Result<Vec<Sample>, RemoteError> {
    let request: proto::WriteRequest = decode_snappy(body)?;

    let capacity = request.timeseries.iter().map(|ts| ts.samples.len()).sum();
    let mut samples = Vec::with_capacity(capacity);
    for series in request.timeseries {
        let metric: Metric = series
            .labels
            .into_iter()
            .map(|label| (label.name, label.value))
            .collect();
        samples.extend(series.samples.iter().map(|sample| Sample {
            metric: metric.clone(),
            value: sample.value,
            timestamp_ms: sample.timestamp,
        }));
    }
    Ok(samples)
}

/// Encodes samples as a remote-write body, one series per sample.
///
/// # Errors
///
/// Returns [`RemoteError::Encode`] or [`RemoteError::Compression`].
pub fn encode_write_request(samples: &[Sample]) -> Result<Vec<u8>, RemoteError> {
    let request = proto::WriteRequest {
        timeseries: samples
            .iter()
            .map(|sample| proto::TimeSeries {
                labels: labels_to_proto(&sample.metric),
                samples: vec![proto::Sample {
                    value: sample.value,
                    timestamp: sample.timestamp_ms,
                }],
            })
            .collect(),
    };
    encode_snappy(&request)
}

/// Decodes a remote-read body.
///
/// # Errors
///
/// Returns [`RemoteError::Decompression`] or [`RemoteError::Decode`] for a
/// malformed body.
pub fn decode_read_request(body: &[u8]) -> Result<proto::ReadRequest, RemoteError> {
    decode_snappy(body)
}

/// Encodes a remote-read request body.
///
/// # Errors
///
/// Returns [`RemoteError::Encode`] or [`RemoteError::Compression`].
pub fn encode_read_request(request: &proto::ReadRequest) -> Result<Vec<u8>, RemoteError> {
    encode_snappy(request)
}

/// Decodes a remote-read response body.
///
/// # Errors
///
/// Returns [`RemoteError::Decompression`] or [`RemoteError::Decode`] for a
/// malformed body.
pub fn decode_read_response(body: &[u8]) -> Result<proto::ReadResponse, RemoteError> {
    decode_snappy(body)
}

/// Encodes a remote-read response body.
///
/// # Errors
///
/// Returns [`RemoteError::Encode`] or [`RemoteError::Compression`].
pub fn encode_read_response(response: &proto::ReadResponse) -> Result<Vec<u8>, RemoteError> {
    encode_snappy(response)
}

fn decode_snappy<M: Message + Default>(body: &[u8]) -> Result<M, RemoteError> {
    let raw = snap::raw::Decoder::new()
        .decompress_vec(body)
        .map_err(|source| RemoteError::Decompression { source })?;
    M::decode(raw.as_slice()).map_err(|source| RemoteError::Decode { source })
}

fn encode_snappy<M: Message>(message: &M) -> Result<Vec<u8>, RemoteError> {
    let mut buf = Vec::with_capacity(message.encoded_len());
    message
        .encode(&mut buf)
        .map_err(|source| RemoteError::Encode { source })?;
    snap::raw::Encoder::new()
        .compress_vec(&buf)
        .map_err(|source| RemoteError::Compression { source })
}
