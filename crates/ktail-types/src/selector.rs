use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Errors produced while parsing a label selector
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectorError {
    #[error("empty requirement in selector {0:?}")]
    EmptyRequirement(String),

    #[error("invalid label key {0:?}")]
    InvalidKey(String),

    #[error("invalid label value {0:?}")]
    InvalidValue(String),

    #[error("unknown set operator {0:?} (expected `in` or `notin`)")]
    UnknownOperator(String),

    #[error("unbalanced parentheses in {0:?}")]
    Unbalanced(String),
}

/// A single selector requirement
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    In(String, BTreeSet<String>),
    NotIn(String, BTreeSet<String>),
    Exists(String),
    NotExists(String),
}

impl Requirement {
    /// Check the requirement against a label set
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Self::Equals(k, v) => labels.get(k) == Some(v),
            Self::NotEquals(k, v) => labels.get(k) != Some(v),
            Self::In(k, values) => labels.get(k).is_some_and(|v| values.contains(v)),
            Self::NotIn(k, values) => labels.get(k).is_none_or(|v| !values.contains(v)),
            Self::Exists(k) => labels.contains_key(k),
            Self::NotExists(k) => !labels.contains_key(k),
        }
    }

    fn parse(raw: &str) -> Result<Self, SelectorError> {
        let s = raw.trim();
        if s.is_empty() {
            return Err(SelectorError::EmptyRequirement(raw.to_string()));
        }

        if let Some(key) = s.strip_prefix('!') {
            return Ok(Self::NotExists(parse_key(key)?));
        }

        if let Some((key, value)) = s.split_once("!=") {
            return Ok(Self::NotEquals(parse_key(key)?, parse_value(value)?));
        }

        if let Some((key, value)) = s.split_once("==").or_else(|| s.split_once('=')) {
            return Ok(Self::Equals(parse_key(key)?, parse_value(value)?));
        }

        if let Some(open) = s.find('(') {
            let inner = s[open + 1..]
                .strip_suffix(')')
                .ok_or_else(|| SelectorError::Unbalanced(s.to_string()))?;
            if inner.contains('(') || inner.contains(')') {
                return Err(SelectorError::Unbalanced(s.to_string()));
            }

            let mut head = s[..open].split_whitespace();
            let key = parse_key(head.next().unwrap_or_default())?;
            let op = head.next().unwrap_or_default();
            if head.next().is_some() {
                return Err(SelectorError::InvalidKey(s[..open].trim().to_string()));
            }

            let values = inner
                .split(',')
                .map(parse_value)
                .collect::<Result<BTreeSet<_>, _>>()?;

            return match op {
                "in" => Ok(Self::In(key, values)),
                "notin" => Ok(Self::NotIn(key, values)),
                other => Err(SelectorError::UnknownOperator(other.to_string())),
            };
        }

        Ok(Self::Exists(parse_key(s)?))
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |values: &BTreeSet<String>| values.iter().cloned().collect::<Vec<_>>().join(",");
        match self {
            Self::Equals(k, v) => write!(f, "{}={}", k, v),
            Self::NotEquals(k, v) => write!(f, "{}!={}", k, v),
            Self::In(k, values) => write!(f, "{} in ({})", k, join(values)),
            Self::NotIn(k, values) => write!(f, "{} notin ({})", k, join(values)),
            Self::Exists(k) => write!(f, "{}", k),
            Self::NotExists(k) => write!(f, "!{}", k),
        }
    }
}

/// Kubernetes label selector (equality and set based)
///
/// Requirements are ANDed. The empty selector matches every label set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    /// Selector that matches everything
    pub fn everything() -> Self {
        Self::default()
    }

    /// Parse a selector such as `app=web,tier in (a,b),!canary`
    pub fn parse(s: &str) -> Result<Self, SelectorError> {
        if s.trim().is_empty() {
            return Ok(Self::everything());
        }

        let requirements = split_requirements(s)?
            .into_iter()
            .map(Requirement::parse)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { requirements })
    }

    /// Check whether a label set satisfies every requirement
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }
}

impl FromStr for LabelSelector {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.requirements.iter().map(|r| r.to_string()).collect();
        write!(f, "{}", parts.join(","))
    }
}

/// Split on commas that are not inside a value list
fn split_requirements(s: &str) -> Result<Vec<&str>, SelectorError> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;

    for (i, ch) in s.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| SelectorError::Unbalanced(s.to_string()))?;
            }
            ',' if depth == 0 => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }

    if depth != 0 {
        return Err(SelectorError::Unbalanced(s.to_string()));
    }
    parts.push(&s[start..]);
    Ok(parts)
}

fn parse_key(raw: &str) -> Result<String, SelectorError> {
    let key = raw.trim();
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'));
    if valid {
        Ok(key.to_string())
    } else {
        Err(SelectorError::InvalidKey(raw.to_string()))
    }
}

fn parse_value(raw: &str) -> Result<String, SelectorError> {
    let value = raw.trim();
    if value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        Ok(value.to_string())
    } else {
        Err(SelectorError::InvalidValue(raw.to_string()))
    }
}
