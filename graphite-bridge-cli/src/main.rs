//! CLI for the graphite-bridge gateway.
//!
//! Provides commands for validating configuration, previewing Carbon paths,
//! pushing samples to carbon and running remote-read queries against
//! Graphite-web.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand, ValueEnum};
use graphite_bridge::config::{LogConfig, LogFormat};
use graphite_bridge::gateway::JsonSample;
use graphite_bridge::remote::proto;
use graphite_bridge::{CancelToken, Config, Gateway, GraphiteClient, MatchType, Sample};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// graphite-bridge — Prometheus remote storage gateway for Graphite.
#[derive(Parser)]
#[command(name = "graphite-bridge", version, about)]
struct Cli {
    /// Path to the TOML configuration file. Defaults apply when omitted.
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Load and validate the configuration, then print a summary.
    CheckConfig,

    /// Print the Carbon paths a metric is written to.
    Paths {
        /// Metric name.
        name: String,

        /// Label as `name=value`; repeatable.
        #[arg(long = "label", short = 'l')]
        labels: Vec<String>,

        /// Storage prefix override.
        #[arg(long)]
        prefix: Option<String>,
    },

    /// Write JSON samples, one object per line, to carbon.
    Write {
        /// Input file; stdin when omitted or `-`.
        input: Option<PathBuf>,

        /// Print the Carbon lines instead of sending them.
        #[arg(long)]
        dry_run: bool,

        /// Storage prefix override.
        #[arg(long)]
        prefix: Option<String>,
    },

    /// Run a remote-read query against Graphite-web.
    Read {
        /// Matchers like `__name__=up`, `job=~"node|api"`; repeatable.
        #[arg(long = "match", short = 'm', required = true)]
        matchers: Vec<String>,

        /// Time range ending now (e.g. "2h", "30m", "7d"). Reads stop at
        /// `now - read.delay` (1h by default), so the range must be longer
        /// than the delay to return anything.
        #[arg(long, default_value = "2h")]
        range: String,

        /// Storage prefix override.
        #[arg(long)]
        prefix: Option<String>,

        /// Output format.
        #[arg(long, default_value = "json")]
        format: OutputFormat,
    },
}

/// Output format for query results.
#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Comma-separated values.
    Csv,
    /// JSON array of series.
    Json,
}

fn main() {
    let cli = Cli::parse();

    let result = load_config(cli.config.as_deref()).and_then(|config| {
        init_logging(&config.log);
        match cli.command {
            Commands::CheckConfig => cmd_check_config(&config),
            Commands::Paths {
                name,
                labels,
                prefix,
            } => cmd_paths(&config, &name, &labels, prefix.as_deref()),
            Commands::Write {
                input,
                dry_run,
                prefix,
            } => cmd_write(config, input.as_deref(), dry_run, prefix.as_deref()),
            Commands::Read {
                matchers,
                range,
                prefix,
                format,
            } => cmd_read(&config, &matchers, &range, prefix.as_deref(), &format),
        }
    });

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn load_config(path: Option<&Path>) -> Result<Config, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(Config::from_file(path)?),
        None => Ok(Config::default()),
    }
}

/// Logs go to stderr; `RUST_LOG` overrides the configured level.
fn init_logging(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr);
    match log.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Implements `graphite-bridge check-config`.
fn cmd_check_config(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let graphite = &config.graphite;
    let write = &graphite.write;

    println!("Configuration OK");
    println!();
    println!("Prefix: {:?}", graphite.default_prefix);
    if write.carbon_address.is_empty() {
        println!("Carbon: disabled");
    } else {
        println!(
            "Carbon: {} ({}, {}, reconnect every {:?})",
            write.carbon_address,
            write.carbon_transport.as_str(),
            String::from(write.compress_type),
            write.carbon_reconnect_interval
        );
    }
    println!("Rules: {}", write.rules.len());
    for (i, rule) in write.rules.iter().enumerate() {
        let template = rule
            .template
            .as_ref()
            .map_or("(drop)", |template| template.source());
        let stop = if rule.continue_matching { "" } else { ", stop" };
        println!("  Rule {i}: {template}{stop}");
    }

    if graphite.read.url.is_empty() {
        println!("Graphite-web: disabled");
    } else {
        let mode = if graphite.enable_tags { "tags" } else { "paths" };
        println!("Graphite-web: {} ({mode})", graphite.read.url);
    }
    Ok(())
}

/// Implements `graphite-bridge paths <name>`.
fn cmd_paths(
    config: &Config,
    name: &str,
    labels: &[String],
    prefix: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let labels = labels
        .iter()
        .map(|label| {
            label
                .split_once('=')
                .ok_or_else(|| format!("Label '{label}' is not name=value"))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let sample = Sample::new(name, labels, 0.0, 0);

    let write = &config.graphite.write;
    let paths = graphite_bridge::paths::paths_from_metric(
        &sample.metric,
        config.graphite.storage_prefix(prefix),
        &write.rules,
        &write.template_data,
    );
    if paths.is_empty() {
        println!("# dropped by rules");
    }
    for path in paths {
        println!("{}", String::from_utf8_lossy(&path));
    }
    Ok(())
}

/// Implements `graphite-bridge write [input]`.
fn cmd_write(
    config: Config,
    input: Option<&Path>,
    dry_run: bool,
    prefix: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let reader: Box<dyn BufRead> = match input {
        Some(path) if path != Path::new("-") => Box::new(BufReader::new(File::open(path)?)),
        _ => Box::new(BufReader::new(io::stdin())),
    };

    let mut samples = Vec::new();
    let mut bytes = 0;
    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        bytes += line.len();
        let sample: JsonSample =
            serde_json::from_str(&line).map_err(|e| format!("line {}: {e}", n + 1))?;
        samples.push(Sample::from(sample));
    }
    debug!(samples = samples.len(), bytes, "read input");

    let gateway = Gateway::new(config)?;
    let response = gateway.write_samples(&samples, bytes, prefix, dry_run, &CancelToken::new())?;
    let stats = gateway.client().stats();
    gateway.client().shutdown();

    let mut stdout = io::stdout().lock();
    stdout.write_all(&response)?;
    if !dry_run {
        writeln!(stdout)?;
    }
    info!(
        samples = samples.len(),
        ignored = stats.ignored_samples,
        "write finished"
    );
    Ok(())
}

/// Implements `graphite-bridge read --match ...`.
fn cmd_read(
    config: &Config,
    matchers: &[String],
    range: &str,
    prefix: Option<&str>,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let matchers = matchers
        .iter()
        .map(|m| parse_matcher(m))
        .collect::<Result<Vec<_>, _>>()?;

    let range_ms = i64::try_from(parse_duration(range)?.as_millis())?;
    let now_ms = i64::try_from(SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis())?;
    let request = proto::ReadRequest {
        queries: vec![proto::Query {
            start_timestamp_ms: now_ms.saturating_sub(range_ms),
            end_timestamp_ms: now_ms,
            matchers,
            hints: None,
        }],
    };

    let client = GraphiteClient::new(config)?;
    let Some(response) = client.read(&request, prefix, &CancelToken::new())? else {
        return Err("No Graphite-web url configured".into());
    };
    let series: Vec<&proto::TimeSeries> = response
        .results
        .iter()
        .flat_map(|result| &result.timeseries)
        .collect();

    match format {
        OutputFormat::Csv => {
            println!("series,timestamp_ms,value");
            for ts in &series {
                let name = series_name(ts);
                for sample in &ts.samples {
                    println!("\"{name}\",{},{}", sample.timestamp, sample.value);
                }
            }
        }
        OutputFormat::Json => {
            let json: Vec<serde_json::Value> = series
                .iter()
                .map(|ts| {
                    let labels: serde_json::Map<String, serde_json::Value> = ts
                        .labels
                        .iter()
                        .map(|l| (l.name.clone(), serde_json::Value::from(l.value.clone())))
                        .collect();
                    let samples: Vec<serde_json::Value> = ts
                        .samples
                        .iter()
                        .map(|s| serde_json::json!([s.timestamp, s.value]))
                        .collect();
                    serde_json::json!({ "labels": labels, "samples": samples })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
    }
    Ok(())
}

/// Renders a series as `name{k="v",...}`.
fn series_name(ts: &proto::TimeSeries) -> String {
    let mut name = String::new();
    let mut labels = Vec::new();
    for label in &ts.labels {
        if label.name == "__name__" {
            name.clone_from(&label.value);
        } else {
            labels.push(format!("{}={:?}", label.name, label.value));
        }
    }
    format!("{name}{{{}}}", labels.join(","))
}

/// Parses `name<op>value` where op is `=`, `!=`, `=~` or `!~`. Surrounding
/// double quotes on the value are removed.
fn parse_matcher(s: &str) -> Result<proto::LabelMatcher, String> {
    let (pos, kind, op_len) = [
        ("=~", MatchType::RegexMatch),
        ("!~", MatchType::RegexNoMatch),
        ("!=", MatchType::NotEqual),
        ("=", MatchType::Equal),
    ]
    .iter()
    .filter_map(|(op, kind)| s.find(op).map(|pos| (pos, *kind, op.len())))
    .min_by_key(|(pos, _, op_len)| (*pos, std::cmp::Reverse(*op_len)))
    .ok_or_else(|| format!("Matcher '{s}' has no operator"))?;

    let name = s[..pos].trim();
    if name.is_empty() {
        return Err(format!("Matcher '{s}' has no label name"));
    }
    let value = s[pos + op_len..].trim();
    let value = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value);

    Ok(proto::LabelMatcher {
        r#type: kind as i32,
        name: name.to_string(),
        value: value.to_string(),
    })
}

/// Parses a human-readable duration string (e.g., "1h", "30m", "7d").
fn parse_duration(s: &str) -> Result<Duration, Box<dyn std::error::Error>> {
    let s = s.trim();
    if s.is_empty() {
        return Err("Empty duration string".into());
    }
    humantime::parse_duration(s).map_err(|e| format!("Invalid duration '{s}': {e}").into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("7d").unwrap(), Duration::from_secs(604_800));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5x").is_err());
    }

    #[test]
    fn test_parse_duration_bad_unit() {
        assert!(parse_duration("5µ").is_err());
        assert!(parse_duration("µ").is_err());
        assert!(parse_duration("h").is_err());
    }

    #[test]
    fn test_parse_duration_overflow() {
        assert!(parse_duration("99999999999999999999d").is_err());
        assert!(parse_duration("9999999999999999999h").is_err());
    }

    #[test]
    fn test_read_range_default_exceeds_delay() {
        let cli = Cli::try_parse_from(["graphite-bridge", "read", "-m", "__name__=up"]).unwrap();
        let Commands::Read { range, .. } = cli.command else {
            panic!("expected read command");
        };
        assert!(parse_duration(&range).unwrap() > Config::default().read.delay);
    }

    #[test]
    fn test_parse_matcher() {
        let m = parse_matcher("__name__=up").unwrap();
        assert_eq!(
            (m.r#type, m.name.as_str(), m.value.as_str()),
            (0, "__name__", "up")
        );

        let m = parse_matcher("job!=node").unwrap();
        assert_eq!((m.r#type, m.value.as_str()), (1, "node"));

        let m = parse_matcher(r#"job=~"node|api""#).unwrap();
        assert_eq!((m.r#type, m.value.as_str()), (2, "node|api"));

        let m = parse_matcher("job!~a=b").unwrap();
        assert_eq!((m.r#type, m.name.as_str(), m.value.as_str()), (3, "job", "a=b"));
    }

    #[test]
    fn test_parse_matcher_invalid() {
        assert!(parse_matcher("job").is_err());
        assert!(parse_matcher("=up").is_err());
    }

    #[test]
    fn test_series_name() {
        let ts = proto::TimeSeries {
            labels: vec![
                proto::Label {
                    name: "__name__".to_string(),
                    value: "up".to_string(),
                },
                proto::Label {
                    name: "job".to_string(),
                    value: "node".to_string(),
                },
            ],
            samples: Vec::new(),
        };
        assert_eq!(series_name(&ts), "up{job=\"node\"}");
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from([
            "graphite-bridge",
            "--config",
            "bridge.toml",
            "read",
            "-m",
            "__name__=up",
            "--range",
            "30m",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("bridge.toml")));
        assert!(matches!(cli.command, Commands::Read { .. }));
    }
}
