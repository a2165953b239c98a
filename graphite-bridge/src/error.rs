//! Error types for the graphite-bridge gateway.

use thiserror::Error;

/// The main error type for all gateway operations.
///
/// Each variant wraps the error enum of one concern (configuration, path
/// templating, the Carbon write path, the Graphite-web read path and the
/// Prometheus wire codec), so callers can match on the concern first.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Error loading or validating configuration.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Error parsing a path template.
    #[error("template error: {0}")]
    Template(#[from] TemplateError),

    /// Error converting between metrics and Graphite paths.
    #[error("path error: {0}")]
    Path(#[from] PathError),

    /// Error delivering datapoints to Carbon.
    #[error("write error: {0}")]
    Write(#[from] WriteError),

    /// Error answering a remote-read query from Graphite-web.
    #[error("read error: {0}")]
    Read(#[from] ReadError),

    /// Error decoding or encoding a Prometheus remote payload.
    #[error("remote protocol error: {0}")]
    Remote(#[from] RemoteError),
}

/// Errors that can occur when loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config file '{path}': {source}")]
    Io {
        /// Path to the file.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration is not valid TOML or does not match the schema.
    ///
    /// Template parse failures and invalid rule regexes surface here too,
    /// since both are compiled while the file is deserialized.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The carbon transport is neither `tcp` nor `udp`.
    #[error("unsupported carbon transport '{transport}' (expected tcp or udp)")]
    InvalidTransport {
        /// The configured transport.
        transport: String,
    },

    /// The Graphite-web URL is not an absolute URL.
    #[error("invalid graphite read url '{url}': {reason}")]
    InvalidUrl {
        /// The configured URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// Errors that can occur when parsing a path template.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    /// The template source is syntactically invalid.
    #[error("parse error at byte {position}: {reason}")]
    Syntax {
        /// Byte offset into the template source.
        position: usize,
        /// What was wrong.
        reason: String,
    },

    /// The template calls a function that is not in the function table.
    #[error("function \"{name}\" not defined")]
    UnknownFunction {
        /// The function name.
        name: String,
    },

    /// A function is called with the wrong number of arguments.
    #[error("wrong number of args for {name}: want {expected} got {got}")]
    Arity {
        /// The function name.
        name: String,
        /// Number of arguments the function takes.
        expected: usize,
        /// Number of arguments supplied, including a piped value.
        got: usize,
    },
}

/// Errors that can occur when converting between metrics and paths.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PathError {
    /// The sample value is NaN or infinite and cannot be sent to Carbon.
    #[error("invalid sample value: {value}")]
    InvalidSampleValue {
        /// The rejected value.
        value: f64,
    },

    /// A default-format path has a dangling label name without a value.
    #[error("unable to parse labels from path '{path}': odd number of nodes in path")]
    OddNodes {
        /// The path that failed to parse.
        path: String,
    },
}

/// Errors that can occur on the Carbon write path.
#[derive(Error, Debug)]
pub enum WriteError {
    /// The caller cancelled the request before any I/O began.
    #[error("request context cancelled")]
    Cancelled,

    /// The carbon address did not resolve to any socket address.
    #[error("could not resolve carbon address '{address}'")]
    Resolve {
        /// The configured address.
        address: String,
    },

    /// Dialing carbon failed.
    #[error("failed to connect to carbon at '{address}': {source}")]
    Connect {
        /// The configured address.
        address: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Copying a buffer onto the carbon socket failed.
    #[error("failed to send to carbon: {source}")]
    Send {
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The compression stage failed while producing output.
    #[error("failed to compress carbon payload: {source}")]
    Compression {
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors that can occur on the Graphite-web read path.
#[derive(Error, Debug)]
pub enum ReadError {
    /// Path-emulation mode needs an equality matcher on the metric name.
    #[error("invalid remote query: no __name__ label provided")]
    MissingName,

    /// The query contains a matcher type this gateway does not know.
    #[error("unknown match type {kind}")]
    UnknownMatchType {
        /// The raw matcher type from the protobuf message.
        kind: i32,
    },

    /// A regex matcher could not be compiled.
    #[error("invalid matcher {name}=~{value:?}: {source}")]
    InvalidMatcher {
        /// The label name.
        name: String,
        /// The regex source.
        value: String,
        /// The regex compilation error.
        #[source]
        source: regex::Error,
    },

    /// A rendered series path could not be decoded back into labels.
    #[error("invalid series '{target}': {source}")]
    Label {
        /// The series target returned by Graphite-web.
        target: String,
        /// The decoding error.
        #[source]
        source: PathError,
    },

    /// The Graphite-web URL could not be built.
    #[error("invalid graphite-web url '{url}': {reason}")]
    Url {
        /// The base URL that was configured.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The HTTP request failed.
    #[error("request to '{url}' failed: {source}")]
    Request {
        /// The URL being fetched.
        url: String,
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// Graphite-web answered with a non-success status.
    #[error("'{url}' returned status {status}: {body}")]
    HttpStatus {
        /// The URL being fetched.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// The (truncated) response body.
        body: String,
    },

    /// The response body was not the expected JSON.
    #[error("failed to decode response from '{url}': {source}")]
    Decode {
        /// The URL being fetched.
        url: String,
        /// The JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// The caller's deadline passed or the request was cancelled.
    #[error("deadline exceeded before fetching '{url}'")]
    DeadlineExceeded {
        /// The URL that was not fetched.
        url: String,
    },

    /// The HTTP client could not be built.
    #[error("failed to create HTTP client: {source}")]
    ClientCreate {
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },
}

/// Errors that can occur while decoding or encoding Prometheus payloads.
#[derive(Error, Debug)]
pub enum RemoteError {
    /// The body is not valid snappy (block format).
    #[error("failed to decompress payload: {source}")]
    Decompression {
        /// The snappy error.
        #[source]
        source: snap::Error,
    },

    /// The response could not be snappy-compressed.
    #[error("failed to compress payload: {source}")]
    Compression {
        /// The snappy error.
        #[source]
        source: snap::Error,
    },

    /// The decompressed body is not a valid protobuf message.
    #[error("failed to decode protobuf message: {source}")]
    Decode {
        /// The prost decode error.
        #[source]
        source: prost::DecodeError,
    },

    /// A JSON test-write body is not an array of samples.
    #[error("failed to decode JSON samples: {source}")]
    Json {
        /// The JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// The response message could not be encoded.
    #[error("failed to encode protobuf message: {source}")]
    Encode {
        /// The prost encode error.
        #[source]
        source: prost::EncodeError,
    },
}

/// Type alias for `Result<T, BridgeError>`.
pub type Result<T> = std::result::Result<T, BridgeError>;
