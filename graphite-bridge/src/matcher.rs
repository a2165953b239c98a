//! Prometheus label matchers.

use std::fmt;

use regex::Regex;

use crate::error::ReadError;

/// The kind of comparison a [`Matcher`] performs.
///
/// Discriminants follow the remote-read protobuf enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchType {
    /// `name="value"`
    Equal = 0,
    /// `name!="value"`
    NotEqual = 1,
    /// `name=~"regex"`
    RegexMatch = 2,
    /// `name!~"regex"`
    RegexNoMatch = 3,
}

impl MatchType {
    /// Operator as written in PromQL.
    pub fn operator(self) -> &'static str {
        match self {
            Self::Equal => "=",
            Self::NotEqual => "!=",
            Self::RegexMatch => "=~",
            Self::RegexNoMatch => "!~",
        }
    }
}

impl TryFrom<i32> for MatchType {
    type Error = ReadError;

    fn try_from(kind: i32) -> Result<Self, Self::Error> {
        match kind {
            0 => Ok(Self::Equal),
            1 => Ok(Self::NotEqual),
            2 => Ok(Self::RegexMatch),
            3 => Ok(Self::RegexNoMatch),
            kind => Err(ReadError::UnknownMatchType { kind }),
        }
    }
}

/// A compiled label matcher.
///
/// Regex kinds are anchored as `^(?:value)$`, so they must match the whole
/// label value.
#[derive(Clone)]
pub struct Matcher {
    kind: MatchType,
    name: String,
    value: String,
    regex: Option<Regex>,
}

impl Matcher {
    /// Creates a matcher, compiling the regex for regex kinds.
    ///
    /// # Errors
    ///
    /// Returns [`ReadError::InvalidMatcher`] if the regex does not compile.
    pub fn new(
        kind: MatchType,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Self, ReadError> {
        let name = name.into();
        let value = value.into();
        let regex = match kind {
            MatchType::RegexMatch | MatchType::RegexNoMatch => Some(
                Regex::new(&format!("^(?:{value})$")).map_err(|source| {
                    ReadError::InvalidMatcher {
                        name: name.clone(),
                        value: value.clone(),
                        source,
                    }
                })?,
            ),
            MatchType::Equal | MatchType::NotEqual => None,
        };
        Ok(Self {
            kind,
            name,
            value,
            regex,
        })
    }

    /// The matcher kind.
    pub fn kind(&self) -> MatchType {
        self.kind
    }

    /// The label name this matcher applies to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The value or regex source.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Returns true if `value` satisfies the matcher.
    pub fn matches(&self, value: &str) -> bool {
        match (self.kind, &self.regex) {
            (MatchType::Equal, _) => value == self.value,
            (MatchType::NotEqual, _) => value != self.value,
            (MatchType::RegexMatch, Some(re)) => re.is_match(value),
            (MatchType::RegexNoMatch, Some(re)) => !re.is_match(value),
            (MatchType::RegexMatch | MatchType::RegexNoMatch, None) => false,
        }
    }
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{:?}", self.name, self.kind.operator(), self.value)
    }
}
