//! Gateway configuration.
//!
//! Configuration is a TOML file in which every section is optional:
//!
//! ```toml
//! [log]
//! level = "info"
//! format = "text"          # or "json"
//!
//! [read]
//! timeout = "5m"
//! delay = "1h"             # never query the most recent hour
//! ignore_error = true
//!
//! [write]
//! timeout = "5m"           # also the carbon dial timeout
//!
//! [graphite]
//! default_prefix = "prometheus."
//! enable_tags = false
//!
//! [graphite.write]
//! carbon_address = "localhost:2003"
//! carbon_transport = "tcp"
//! carbon_reconnect_interval = "1h"
//! compress_type = "plain"  # or "lz4"
//! template_data = { shared = "data.foo" }
//!
//! [[graphite.write.rules]]
//! match = { owner = "team-X" }
//! match_re = { testlabel = "^test:.*$" }
//! template = "tmpl_1.{{ .shared | escape }}.{{ .labels.owner }}"
//! continue = true
//!
//! [graphite.read]
//! url = "http://localhost:8080"
//! max_point_delta = "0s"
//! ```
//!
//! Rule templates and regexes are compiled while the file is deserialized,
//! so a configuration that loads successfully never fails on them later.

use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::paths::{Rule, TemplateData};

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Logging.
    pub log: LogConfig,
    /// Remote-read handling.
    pub read: ReadConfig,
    /// Remote-write handling.
    pub write: WriteConfig,
    /// The Graphite backend.
    pub graphite: GraphiteConfig,
}

impl Config {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, is not valid TOML,
    /// does not match the schema, or fails validation.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        contents.parse()
    }

    fn parse(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates settings that the schema alone cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidUrl`] if the Graphite-web URL is set but
    /// is not an absolute URL.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = &self.graphite.read.url;
        if !url.is_empty() {
            reqwest::Url::parse(url).map_err(|e| ConfigError::InvalidUrl {
                url: url.clone(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    /// Level filter used when `RUST_LOG` is not set.
    /// Default: "info"
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// Remote-read handling.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReadConfig {
    /// Upper bound for a whole read call.
    /// Default: 5m
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Data newer than `now - delay` is never queried.
    /// Default: 1h
    #[serde(with = "humantime_serde")]
    pub delay: Duration,

    /// Answer failed reads with an empty result instead of an error.
    /// Default: true
    pub ignore_error: bool,
}

impl Default for ReadConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5 * MINUTE),
            delay: Duration::from_secs(HOUR),
            ignore_error: true,
        }
    }
}

/// Remote-write handling.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct WriteConfig {
    /// Dial timeout for carbon connections.
    /// Default: 5m
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5 * MINUTE),
        }
    }
}

/// The Graphite backend.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct GraphiteConfig {
    /// Prefix prepended to every default path and expand query.
    pub default_prefix: String,

    /// Read through Graphite's tag index (`seriesByTag`) instead of
    /// emulating labels with path nodes.
    pub enable_tags: bool,

    /// Accepted for compatibility with existing configuration files. Default
    /// paths use the dotted Carbon form whichever format is selected.
    pub openmetrics: bool,

    /// Carbon side.
    pub write: GraphiteWriteConfig,

    /// Graphite-web side.
    pub read: GraphiteReadConfig,
}

impl GraphiteConfig {
    /// Returns `override_prefix` when it is set and non-empty, else the
    /// configured default prefix.
    pub fn storage_prefix<'a>(&'a self, override_prefix: Option<&'a str>) -> &'a str {
        match override_prefix {
            Some(prefix) if !prefix.is_empty() => prefix,
            _ => &self.default_prefix,
        }
    }
}

/// Carbon transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub enum CarbonTransport {
    /// One persistent TCP stream.
    #[default]
    Tcp,
    /// Datagrams of at most 1024 bytes.
    Udp,
}

impl CarbonTransport {
    /// Lowercase transport name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl TryFrom<String> for CarbonTransport {
    type Error = ConfigError;

    fn try_from(transport: String) -> Result<Self, Self::Error> {
        match transport.as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            _ => Err(ConfigError::InvalidTransport { transport }),
        }
    }
}

impl From<CarbonTransport> for String {
    fn from(transport: CarbonTransport) -> Self {
        transport.as_str().to_string()
    }
}

/// Compression applied to the carbon stream. Unknown values mean `plain`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(from = "String", into = "String")]
pub enum CompressType {
    /// No compression.
    #[default]
    Plain,
    /// LZ4 frame format.
    Lz4,
}

impl From<String> for CompressType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "lz4" => Self::Lz4,
            _ => Self::Plain,
        }
    }
}

impl From<CompressType> for String {
    fn from(value: CompressType) -> Self {
        match value {
            CompressType::Plain => "plain".to_string(),
            CompressType::Lz4 => "lz4".to_string(),
        }
    }
}

/// Maximum LZ4 block size. Unknown values mean `default`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(from = "String", into = "String")]
pub enum Lz4BlockSize {
    /// Encoder default.
    #[default]
    Default,
    /// 64 KiB.
    Max64Kb,
    /// 256 KiB.
    Max256Kb,
    /// 1 MiB.
    Max1Mb,
    /// 4 MiB.
    Max4Mb,
}

impl From<String> for Lz4BlockSize {
    fn from(value: String) -> Self {
        match value.as_str() {
            "max64KB" => Self::Max64Kb,
            "max256KB" => Self::Max256Kb,
            "max1MB" => Self::Max1Mb,
            "max4MB" => Self::Max4Mb,
            _ => Self::Default,
        }
    }
}

impl From<Lz4BlockSize> for String {
    fn from(value: Lz4BlockSize) -> Self {
        match value {
            Lz4BlockSize::Default => "default",
            Lz4BlockSize::Max64Kb => "max64KB",
            Lz4BlockSize::Max256Kb => "max256KB",
            Lz4BlockSize::Max1Mb => "max1MB",
            Lz4BlockSize::Max4Mb => "max4MB",
        }
        .to_string()
    }
}

/// LZ4 frame parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Lz4FrameInfo {
    /// Larger blocks compress slightly better and use more memory.
    pub block_size: Lz4BlockSize,
    /// Link blocks so each can reference the previous one.
    pub block_mode: bool,
    /// Append a checksum of the whole uncompressed content.
    pub content_checksum: bool,
    /// Follow every block with a checksum of its compressed data.
    pub block_checksum: bool,
}

/// LZ4 stream preferences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Lz4Preferences {
    /// Frame parameters.
    pub frame: Lz4FrameInfo,
    /// Compression level, 3 to 12. The frame encoder only implements the
    /// fast mode, so the level is carried but has no effect.
    /// Default: 9
    pub compression_level: u32,
    /// Flush the frame after every write.
    pub auto_flush: bool,
    /// Favor decompression speed in high compression modes. Carried but
    /// has no effect, like `compression_level`.
    pub decompression_speed: bool,
}

impl Default for Lz4Preferences {
    fn default() -> Self {
        Self {
            frame: Lz4FrameInfo::default(),
            compression_level: 9,
            auto_flush: false,
            decompression_speed: false,
        }
    }
}

/// The Carbon side of the Graphite backend.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct GraphiteWriteConfig {
    /// `host:port` of the carbon receiver. Empty disables writes.
    pub carbon_address: String,

    /// Transport used to reach carbon.
    pub carbon_transport: CarbonTransport,

    /// How long a carbon connection is reused before it is redialed.
    /// Default: 1h
    #[serde(with = "humantime_serde")]
    pub carbon_reconnect_interval: Duration,

    /// Compression of the carbon stream.
    pub compress_type: CompressType,

    /// LZ4 settings, used when `compress_type = "lz4"`.
    pub lz4_preferences: Lz4Preferences,

    /// Memoize computed paths per metric.
    /// Default: true
    pub enable_paths_cache: bool,

    /// Lifetime of a memoized path.
    /// Default: 7m
    #[serde(with = "humantime_serde")]
    pub paths_cache_ttl: Duration,

    /// Minimum time between sweeps of expired paths.
    /// Default: 8m
    #[serde(with = "humantime_serde")]
    pub paths_cache_purge_interval: Duration,

    /// Values available to rule templates.
    pub template_data: TemplateData,

    /// Templating rules, in evaluation order.
    pub rules: Vec<Rule>,
}

impl Default for GraphiteWriteConfig {
    fn default() -> Self {
        Self {
            carbon_address: String::new(),
            carbon_transport: CarbonTransport::Tcp,
            carbon_reconnect_interval: Duration::from_secs(HOUR),
            compress_type: CompressType::Plain,
            lz4_preferences: Lz4Preferences::default(),
            enable_paths_cache: true,
            paths_cache_ttl: Duration::from_secs(7 * MINUTE),
            paths_cache_purge_interval: Duration::from_secs(8 * MINUTE),
            template_data: TemplateData::new(),
            rules: Vec::new(),
        }
    }
}

/// The Graphite-web side of the Graphite backend.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct GraphiteReadConfig {
    /// Base URL of Graphite-web. Empty disables reads.
    pub url: String,

    /// Linearly interpolate points this far apart; zero disables it.
    #[serde(with = "humantime_serde")]
    pub max_point_delta: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.log.level, "info");
        assert_eq!(config.read.timeout, Duration::from_secs(300));
        assert_eq!(config.read.delay, Duration::from_secs(3600));
        assert!(config.read.ignore_error);
        assert_eq!(config.write.timeout, Duration::from_secs(300));

        let write = &config.graphite.write;
        assert_eq!(write.carbon_transport, CarbonTransport::Tcp);
        assert_eq!(write.carbon_reconnect_interval, Duration::from_secs(3600));
        assert_eq!(write.compress_type, CompressType::Plain);
        assert_eq!(write.lz4_preferences.compression_level, 9);
        assert!(write.enable_paths_cache);
        assert_eq!(write.paths_cache_ttl, Duration::from_secs(420));
        assert_eq!(write.paths_cache_purge_interval, Duration::from_secs(480));
        assert_eq!(config.graphite.read.max_point_delta, Duration::ZERO);
    }

    #[test]
    fn test_full_config_parse() {
        let toml = r#"
[log]
level = "debug"
format = "json"

[read]
timeout = "30s"
delay = "10m"
ignore_error = false

[write]
timeout = "2s"

[graphite]
default_prefix = "prom."
enable_tags = true

[graphite.write]
carbon_address = "carbon:2003"
carbon_transport = "udp"
carbon_reconnect_interval = "5m"
compress_type = "lz4"
enable_paths_cache = false
template_data = { shared = "data.foo", replicas = 3 }

[graphite.write.lz4_preferences]
compression_level = 12
auto_flush = true

[graphite.write.lz4_preferences.frame]
block_size = "max256KB"
block_mode = true
content_checksum = true

[[graphite.write.rules]]
match = { owner = "team-X" }
match_re = { testlabel = "^test:.*$" }
template = "tmpl_1.{{ .shared | escape }}.{{ .labels.owner }}"
continue = true

[[graphite.write.rules]]
match = { owner = "team-Z" }

[graphite.read]
url = "http://graphite:8080/"
max_point_delta = "1m"
"#;
        let config = Config::from_str(toml).unwrap();
        assert_eq!(config.log.format, LogFormat::Json);
        assert_eq!(config.read.delay, Duration::from_secs(600));
        assert!(!config.read.ignore_error);
        assert_eq!(config.write.timeout, Duration::from_secs(2));
        assert!(config.graphite.enable_tags);

        let write = &config.graphite.write;
        assert_eq!(write.carbon_transport, CarbonTransport::Udp);
        assert_eq!(write.compress_type, CompressType::Lz4);
        assert_eq!(write.lz4_preferences.frame.block_size, Lz4BlockSize::Max256Kb);
        assert!(write.lz4_preferences.frame.block_mode);
        assert!(write.lz4_preferences.auto_flush);
        assert_eq!(write.template_data["replicas"], json!(3));
        assert_eq!(write.rules.len(), 2);
        assert!(write.rules[0].continue_matching);
        assert!(write.rules[1].template.is_none());
        assert_eq!(config.graphite.read.max_point_delta, Duration::from_secs(60));
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let err = Config::from_str("[graphite]\nprefix = \"x\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_unknown_compression_falls_back_to_plain() {
        let config = Config::from_str(
            "[graphite.write]\ncompress_type = \"zstd\"\n[graphite.write.lz4_preferences.frame]\nblock_size = \"huge\"",
        )
        .unwrap();
        assert_eq!(config.graphite.write.compress_type, CompressType::Plain);
        assert_eq!(
            config.graphite.write.lz4_preferences.frame.block_size,
            Lz4BlockSize::Default
        );
    }

    #[test]
    fn test_invalid_transport() {
        let err = Config::from_str("[graphite.write]\ncarbon_transport = \"quic\"").unwrap_err();
        assert!(err.to_string().contains("quic"));
    }

    #[test]
    fn test_bad_template_is_fatal() {
        let toml = "[[graphite.write.rules]]\ntemplate = \"{{ nope .x }}\"";
        let err = Config::from_str(toml).unwrap_err();
        assert!(err.to_string().contains("not defined"));
    }

    #[test]
    fn test_bad_regex_is_fatal() {
        let toml = "[[graphite.write.rules]]\nmatch_re = { job = \"(\" }";
        assert!(Config::from_str(toml).is_err());
    }

    #[test]
    fn test_invalid_read_url() {
        let err = Config::from_str("[graphite.read]\nurl = \"not a url\"").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidUrl { .. }));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.toml");
        fs::write(&path, "[graphite]\ndefault_prefix = \"prom.\"\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.graphite.default_prefix, "prom.");

        let err = Config::from_file(dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_storage_prefix() {
        let graphite = GraphiteConfig {
            default_prefix: "prom.".to_string(),
            ..GraphiteConfig::default()
        };
        assert_eq!(graphite.storage_prefix(None), "prom.");
        assert_eq!(graphite.storage_prefix(Some("")), "prom.");
        assert_eq!(graphite.storage_prefix(Some("other.")), "other.");
    }
}
