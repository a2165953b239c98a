//! Mapping between metrics and Graphite paths.
//!
//! The write direction turns a metric into one or more Carbon paths, either
//! through user rules (see [`Rule`]) or through the default path
//! `<prefix><name>.<label>.<value>...` with labels sorted by name. The read
//! direction parses a default path, or a tag map returned by a tag-indexed
//! Graphite, back into labels.

use std::collections::BTreeMap;
use std::fmt;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::PathError;
use crate::escape::{escape, unescape};
use crate::model::{METRIC_NAME_LABEL, Metric, Sample, metric_name};
use crate::template::Template;

/// Free-form values exposed to rule templates next to `labels`.
pub type TemplateData = BTreeMap<String, Value>;

/// A regex that must match a whole label value.
///
/// The pattern is wrapped as `^(?:pattern)$` when compiled, so `test:.*`
/// and `^test:.*$` behave the same and partial matches never count.
#[derive(Clone)]
pub struct AnchoredRegex {
    source: String,
    regex: Regex,
}

impl AnchoredRegex {
    /// Compiles an anchored regex.
    ///
    /// # Errors
    ///
    /// Returns the regex error when the pattern is invalid.
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            source: pattern.to_string(),
            regex: Regex::new(&format!("^(?:{pattern})$"))?,
        })
    }

    /// Returns true if the whole value matches.
    pub fn is_match(&self, value: &str) -> bool {
        self.regex.is_match(value)
    }

    /// The pattern as written in the configuration.
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Debug for AnchoredRegex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AnchoredRegex").field(&self.source).finish()
    }
}

impl PartialEq for AnchoredRegex {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl<'de> Deserialize<'de> for AnchoredRegex {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let pattern = String::deserialize(deserializer)?;
        Self::new(&pattern).map_err(serde::de::Error::custom)
    }
}

impl Serialize for AnchoredRegex {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

/// A templating rule.
///
/// A rule matches a metric when every `match` label is equal and every
/// `match_re` regex matches; an absent label compares as `""`. A matching
/// rule renders `template` into one output path. Rules are tried in order;
/// a matching rule with `continue = false` stops the walk.
///
/// A stopping rule without a template yields no path, which is how a
/// configuration drops metrics it does not want stored.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Rule {
    /// Template producing the output path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<Template>,

    /// Labels that must be exactly equal.
    #[serde(default, rename = "match")]
    pub match_labels: BTreeMap<String, String>,

    /// Labels that must fully match a regex.
    #[serde(default)]
    pub match_re: BTreeMap<String, AnchoredRegex>,

    /// Keep evaluating later rules after this one matched.
    #[serde(default, rename = "continue")]
    pub continue_matching: bool,
}

impl Rule {
    /// Returns true if the metric satisfies every matcher of this rule.
    pub fn matches(&self, metric: &Metric) -> bool {
        let label = |name: &str| metric.get(name).map_or("", String::as_str);

        self.match_labels
            .iter()
            .all(|(name, value)| label(name) == value)
            && self
                .match_re
                .iter()
                .all(|(name, regex)| regex.is_match(label(name)))
    }
}

/// Builds the context rules render against: every `template_data` entry plus
/// a `labels` object holding the metric's labels.
pub fn load_context(template_data: &TemplateData, metric: &Metric) -> Value {
    let mut context: serde_json::Map<String, Value> = template_data
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let labels: serde_json::Map<String, Value> = metric
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    context.insert("labels".to_string(), Value::Object(labels));
    Value::Object(context)
}

/// Computes the Carbon paths for a metric.
///
/// Rules are walked in order and every matching rule with a template
/// contributes one rendered path, until a matching rule with
/// `continue = false` stops the walk. Templated paths are only kept when
/// such a stopping rule was reached; otherwise the metric gets the default
/// path alone.
pub fn paths_from_metric(
    metric: &Metric,
    prefix: &str,
    rules: &[Rule],
    template_data: &TemplateData,
) -> Vec<Vec<u8>> {
    let (paths, stopped) = templated_paths(metric, rules, template_data);
    if stopped {
        paths
    } else {
        vec![default_path(metric, prefix)]
    }
}

fn templated_paths(
    metric: &Metric,
    rules: &[Rule],
    template_data: &TemplateData,
) -> (Vec<Vec<u8>>, bool) {
    let mut paths = Vec::new();
    let mut context: Option<Value> = None;

    for rule in rules.iter().filter(|rule| rule.matches(metric)) {
        if let Some(template) = &rule.template {
            let context = context.get_or_insert_with(|| load_context(template_data, metric));
            paths.push(template.render(context).into_bytes());
        }
        if !rule.continue_matching {
            return (paths, true);
        }
    }
    (paths, false)
}

/// Renders the default path: `<prefix><name>` followed by `.<label>.<value>`
/// for every other label in name order, all escaped.
///
/// A name that already carries the prefix is not prefixed twice.
pub fn default_path(metric: &Metric, prefix: &str) -> Vec<u8> {
    let name = metric_name(metric);
    let name = name.strip_prefix(prefix).unwrap_or(name);

    let mut path = Vec::with_capacity(prefix.len() + name.len() + metric.len() * 16);
    path.extend_from_slice(prefix.as_bytes());
    path.extend_from_slice(&escape(name));

    for (label, value) in metric {
        if label == METRIC_NAME_LABEL || label.is_empty() {
            continue;
        }
        path.push(b'.');
        path.extend_from_slice(&escape(label));
        path.push(b'.');
        path.extend_from_slice(&escape(value));
    }
    path
}

/// Parses labels back out of a default path.
///
/// The prefix and any surrounding dots are removed. The first node is the
/// metric name (taken as is); the remaining nodes are unescaped
/// `label.value` pairs.
///
/// # Errors
///
/// Returns [`PathError::OddNodes`] when a label has no value node.
pub fn metric_labels_from_path(path: &str, prefix: &str) -> Result<Metric, PathError> {
    let cleaned = path.strip_prefix(prefix).unwrap_or(path).trim_matches('.');
    let mut nodes = cleaned.split('.');

    let mut labels = Metric::new();
    let name = nodes.next().unwrap_or_default();
    labels.insert(METRIC_NAME_LABEL.to_string(), name.to_string());

    let rest: Vec<&str> = nodes.collect();
    if rest.len() % 2 != 0 {
        return Err(PathError::OddNodes {
            path: path.to_string(),
        });
    }
    for pair in rest.chunks_exact(2) {
        labels.insert(unescape(pair[0]), unescape(pair[1]));
    }
    Ok(labels)
}

/// Converts the tag map of a tag-indexed series into labels.
///
/// The `name` tag becomes the metric name with the prefix removed; every
/// other tag is copied unchanged.
pub fn metric_labels_from_tags(tags: &BTreeMap<String, String>, prefix: &str) -> Metric {
    tags.iter()
        .map(|(key, value)| {
            if key == "name" {
                let name = value.strip_prefix(prefix).unwrap_or(value);
                (METRIC_NAME_LABEL.to_string(), name.to_string())
            } else {
                (key.clone(), value.clone())
            }
        })
        .collect()
}

/// Renders Carbon plaintext lines, one per path:
/// `<path> <value with 6 decimals> <timestamp in seconds>\n`.
///
/// # Errors
///
/// Returns [`PathError::InvalidSampleValue`] for NaN or infinite values.
pub fn datapoint_lines(paths: &[Vec<u8>], sample: &Sample) -> Result<Vec<Vec<u8>>, PathError> {
    check_value(sample.value)?;

    let suffix = format!(" {:.6} {}\n", sample.value, sample.timestamp_secs());
    Ok(paths
        .iter()
        .map(|path| {
            let mut line = Vec::with_capacity(path.len() + suffix.len());
            line.extend_from_slice(path);
            line.extend_from_slice(suffix.as_bytes());
            line
        })
        .collect())
}

/// Computes the paths of a sample and renders its Carbon lines.
///
/// # Errors
///
/// Returns [`PathError::InvalidSampleValue`] for NaN or infinite values,
/// before any path is computed.
pub fn to_datapoints(
    sample: &Sample,
    prefix: &str,
    rules: &[Rule],
    template_data: &TemplateData,
) -> Result<Vec<Vec<u8>>, PathError> {
    check_value(sample.value)?;
    let paths = paths_from_metric(&sample.metric, prefix, rules, template_data);
    datapoint_lines(&paths, sample)
}

fn check_value(value: f64) -> Result<(), PathError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(PathError::InvalidSampleValue { value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANY_CHARS: &str = "abc!ABC:012-3!45ö67~89./(){},=.\"\\";
    const MANY_CHARS_ESCAPED: &str =
        "abc!ABC:012-3!45%C3%B667~89%2E%2F\\(\\)\\{\\}\\,%3D%2E\\\"\\\\";

    fn metric(pairs: &[(&str, &str)]) -> Metric {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn owner_metric(owner: &str) -> Metric {
        metric(&[
            ("__name__", "test:metric"),
            ("testlabel", "test:value"),
            ("owner", owner),
            ("many_chars", MANY_CHARS),
        ])
    }

    fn test_rules() -> (Vec<Rule>, TemplateData) {
        #[derive(Deserialize)]
        struct Write {
            template_data: TemplateData,
            rules: Vec<Rule>,
        }

        let write: Write = toml::from_str(
            r#"
            template_data = { shared = "data.foo" }

            [[rules]]
            match = { owner = "team-X" }
            match_re = { testlabel = "^test:.*$" }
            template = "tmpl_1.{{.shared | escape}}.{{.labels.owner}}"
            continue = true

            [[rules]]
            match = { owner = "team-X", testlabel2 = "test:value2" }
            template = "tmpl_2.{{.labels.owner}}.{{.shared}}"

            [[rules]]
            match = { owner = "team-Y" }
            template = "tmpl_3.{{.labels.owner}}.{{.shared}}"

            [[rules]]
            match = { owner = "team-Z" }
            "#,
        )
        .unwrap();
        (write.rules, write.template_data)
    }

    fn as_strings(paths: Vec<Vec<u8>>) -> Vec<String> {
        paths
            .into_iter()
            .map(|p| String::from_utf8(p).unwrap())
            .collect()
    }

    #[test]
    fn test_load_context() {
        let mut data = TemplateData::new();
        data.insert("key1".to_string(), Value::from("value1"));
        let m = metric(&[("__name__", "test_metric"), ("label1", "value1")]);

        let ctx = load_context(&data, &m);
        assert_eq!(ctx["key1"], "value1");
        assert_eq!(ctx["labels"]["__name__"], "test_metric");
        assert_eq!(ctx["labels"]["label1"], "value1");
    }

    #[test]
    fn test_rule_matches() {
        let m = metric(&[
            ("__name__", "test_metric"),
            ("label1", "value1"),
            ("label2", "value2"),
        ]);
        let mut rule = Rule::default();
        rule.match_labels
            .insert("__name__".to_string(), "test_metric".to_string());
        rule.match_labels
            .insert("label1".to_string(), "value1".to_string());
        assert!(rule.matches(&m));

        rule.match_labels
            .insert("label1".to_string(), "wrong".to_string());
        assert!(!rule.matches(&m));
    }

    #[test]
    fn test_rule_regex_is_anchored() {
        let m = metric(&[("__name__", "x"), ("instance", "host-1:9100")]);
        let mut rule = Rule::default();
        rule.match_re
            .insert("instance".to_string(), AnchoredRegex::new("host-1").unwrap());
        assert!(!rule.matches(&m));

        rule.match_re
            .insert("instance".to_string(), AnchoredRegex::new("host-1.*").unwrap());
        assert!(rule.matches(&m));
    }

    #[test]
    fn test_rule_missing_label_is_empty() {
        let m = metric(&[("__name__", "x")]);
        let mut rule = Rule::default();
        rule.match_re
            .insert("absent".to_string(), AnchoredRegex::new("").unwrap());
        assert!(rule.matches(&m));

        rule.match_labels
            .insert("absent".to_string(), "something".to_string());
        assert!(!rule.matches(&m));
    }

    #[test]
    fn test_default_path() {
        let expected = format!(
            "prefix.test:metric.many_chars.{MANY_CHARS_ESCAPED}.owner.team-X.testlabel.test:value"
        );
        let paths = paths_from_metric(&owner_metric("team-X"), "prefix.", &[], &TemplateData::new());
        assert_eq!(as_strings(paths), vec![expected]);
    }

    #[test]
    fn test_default_path_strips_duplicate_prefix() {
        let m = metric(&[("__name__", "prefix.up"), ("job", "node")]);
        assert_eq!(default_path(&m, "prefix."), b"prefix.up.job.node");
    }

    #[test]
    fn test_default_path_skips_empty_label_names() {
        let m = metric(&[("__name__", "up"), ("", "orphan"), ("job", "node")]);
        assert_eq!(default_path(&m, ""), b"up.job.node");
    }

    #[test]
    fn test_unmatched_metric_uses_default_path() {
        let (rules, data) = test_rules();
        let m = metric(&[
            ("__name__", "test:metric"),
            ("testlabel", "test:value"),
            ("owner", "team-K"),
            ("testlabel2", "test:value2"),
        ]);
        let paths = paths_from_metric(&m, "prefix.", &rules, &data);
        assert_eq!(
            as_strings(paths),
            vec!["prefix.test:metric.owner.team-K.testlabel.test:value.testlabel2.test:value2"]
        );
    }

    #[test]
    fn test_templated_path() {
        let (rules, data) = test_rules();
        let paths = paths_from_metric(&owner_metric("team-Y"), "", &rules, &data);
        assert_eq!(as_strings(paths), vec!["tmpl_3.team-Y.data.foo"]);
    }

    #[test]
    fn test_continue_rule_without_stop_falls_back_to_default() {
        // Only the continue=true rule matches, so the walk never stops.
        let (rules, data) = test_rules();
        let paths = paths_from_metric(&owner_metric("team-X"), "prefix.", &rules, &data);
        assert_eq!(
            as_strings(paths),
            vec![format!(
                "prefix.test:metric.many_chars.{MANY_CHARS_ESCAPED}.owner.team-X.testlabel.test:value"
            )]
        );
    }

    #[test]
    fn test_multiple_templated_paths_in_rule_order() {
        let (rules, data) = test_rules();
        let m = metric(&[
            ("__name__", "test:metric"),
            ("testlabel", "test:value"),
            ("owner", "team-X"),
            ("testlabel2", "test:value2"),
        ]);
        let paths = paths_from_metric(&m, "prefix.", &rules, &data);
        assert_eq!(
            as_strings(paths),
            vec!["tmpl_1.data%2Efoo.team-X", "tmpl_2.team-X.data.foo"]
        );
    }

    #[test]
    fn test_rule_without_template_drops_metric() {
        let (rules, data) = test_rules();
        let m = metric(&[
            ("__name__", "test:metric"),
            ("testlabel", "test:value"),
            ("owner", "team-Z"),
            ("testlabel2", "test:value2"),
        ]);
        assert!(paths_from_metric(&m, "", &rules, &data).is_empty());
    }

    #[test]
    fn test_replace_on_missing_label() {
        let rule: Rule = toml::from_str(
            r#"
            match_re = { testlabel = "test:value" }
            template = 'test.{{ replace .labels.doesnotexist " " "_" }}'
            "#,
        )
        .unwrap();
        let paths = paths_from_metric(&owner_metric("team-X"), "", &[rule], &TemplateData::new());
        assert_eq!(as_strings(paths), vec!["test."]);
    }

    #[test]
    fn test_rule_rejects_unknown_fields() {
        let err = toml::from_str::<Rule>("tmpl = 'x'").unwrap_err();
        assert!(err.to_string().contains("tmpl"));
    }

    #[test]
    fn test_metric_labels_from_path() {
        let labels =
            metric_labels_from_path("prefix.test:metric.owner.team-X.url.http:%2F%2Fa%2Eb", "prefix.")
                .unwrap();
        assert_eq!(
            labels,
            metric(&[
                ("__name__", "test:metric"),
                ("owner", "team-X"),
                ("url", "http://a.b"),
            ])
        );
    }

    #[test]
    fn test_metric_labels_from_default_path() {
        let m = owner_metric("team-X");
        let path = String::from_utf8(default_path(&m, "prefix.")).unwrap();
        assert_eq!(metric_labels_from_path(&path, "prefix.").unwrap(), m);
    }

    #[test]
    fn test_metric_labels_from_path_malformed_percent() {
        let labels = metric_labels_from_path("prefix.up.ratio.50%zz%2E5", "prefix.").unwrap();
        assert_eq!(labels, metric(&[("__name__", "up"), ("ratio", "50%zz.5")]));
    }

    #[test]
    fn test_metric_labels_from_path_odd_nodes() {
        let err = metric_labels_from_path("prefix.up.job", "prefix.").unwrap_err();
        assert!(err.to_string().contains("odd number of nodes in path"));
    }

    #[test]
    fn test_metric_labels_from_tags() {
        let tags: BTreeMap<String, String> = [
            ("name", "prefix.test:metric"),
            ("owner", "team-X"),
            ("dc", "eu"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let labels = metric_labels_from_tags(&tags, "prefix.");
        assert_eq!(
            labels,
            metric(&[
                ("__name__", "test:metric"),
                ("dc", "eu"),
                ("owner", "team-X"),
            ])
        );
    }

    #[test]
    fn test_to_datapoints() {
        let sample = Sample {
            metric: owner_metric("team-X"),
            value: 123.456,
            timestamp_ms: 1_609_459_200 * 1000,
        };
        let lines = to_datapoints(&sample, "prefix.", &[], &TemplateData::new()).unwrap();
        assert_eq!(
            as_strings(lines),
            vec![format!(
                "prefix.test:metric.many_chars.{MANY_CHARS_ESCAPED}.owner.team-X.testlabel.test:value 123.456000 1609459200\n"
            )]
        );
    }

    #[test]
    fn test_to_datapoints_invalid_value() {
        for value in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let sample = Sample {
                metric: owner_metric("team-X"),
                value,
                timestamp_ms: 1_609_459_200 * 1000,
            };
            let err = to_datapoints(&sample, "prefix.", &[], &TemplateData::new()).unwrap_err();
            assert!(err.to_string().contains("invalid sample value"));
        }
    }
}
