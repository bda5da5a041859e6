//! Subscription rules and their compiled form.

use crate::error::{BusError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Topic segment separator.
const SEPARATOR: char = '.';

/// Regex fragment standing for one arbitrary segment.
const ANY_SEGMENT: &str = "[^.]+";

/// How a rule's pattern is compared to a topic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    Exact,
    Prefix,
    Wildcard,
}

impl RuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::Exact => "exact",
            RuleKind::Prefix => "prefix",
            RuleKind::Wildcard => "wildcard",
        }
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleKind {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "exact" => Ok(RuleKind::Exact),
            "prefix" => Ok(RuleKind::Prefix),
            "wildcard" => Ok(RuleKind::Wildcard),
            other => Err(BusError::InvalidTopicRule {
                pattern: String::new(),
                reason: format!("unknown rule kind {:?}", other),
            }),
        }
    }
}

/// A subscription rule as supplied by a client.
///
/// Serialized as a `[pattern, kind]` pair. Matches report the rule exactly as
/// supplied so clients can tell which of their subscriptions selected a message.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "(String, RuleKind)", into = "(String, RuleKind)")]
pub struct TopicRule {
    pub pattern: String,
    pub kind: RuleKind,
}

impl TopicRule {
    pub fn new(pattern: impl Into<String>, kind: RuleKind) -> Self {
        Self {
            pattern: pattern.into(),
            kind,
        }
    }

    pub fn exact(pattern: impl Into<String>) -> Self {
        Self::new(pattern, RuleKind::Exact)
    }

    pub fn prefix(pattern: impl Into<String>) -> Self {
        Self::new(pattern, RuleKind::Prefix)
    }

    pub fn wildcard(pattern: impl Into<String>) -> Self {
        Self::new(pattern, RuleKind::Wildcard)
    }
}

impl From<(String, RuleKind)> for TopicRule {
    fn from((pattern, kind): (String, RuleKind)) -> Self {
        Self { pattern, kind }
    }
}

impl From<TopicRule> for (String, RuleKind) {
    fn from(rule: TopicRule) -> Self {
        (rule.pattern, rule.kind)
    }
}

/// Rules grouped by kind, wildcards compiled to anchored expressions.
#[derive(Clone, Debug, Default)]
pub struct CompiledRuleSet {
    exact: Vec<TopicRule>,
    prefix: Vec<TopicRule>,
    wildcard: Vec<(Regex, TopicRule)>,
}

impl CompiledRuleSet {
    /// Compile a list of rules.
    pub fn compile(rules: impl IntoIterator<Item = TopicRule>) -> Result<Self> {
        let mut set = CompiledRuleSet::default();

        for rule in rules {
            match rule.kind {
                RuleKind::Exact => set.exact.push(rule),
                RuleKind::Prefix => set.prefix.push(rule),
                RuleKind::Wildcard => {
                    let regex = Regex::new(&wildcard_expression(&rule.pattern)).map_err(|e| {
                        BusError::InvalidTopicRule {
                            pattern: rule.pattern.clone(),
                            reason: e.to_string(),
                        }
                    })?;
                    set.wildcard.push((regex, rule));
                }
            }
        }

        Ok(set)
    }

    /// Every rule matching `topic`, exact rules first, then prefix, then wildcard.
    pub fn matches(&self, topic: &str) -> Vec<TopicRule> {
        let exact = self.exact.iter().filter(|rule| rule.pattern == topic);
        let prefix = self
            .prefix
            .iter()
            .filter(|rule| topic.starts_with(rule.pattern.as_str()));
        let wildcard = self
            .wildcard
            .iter()
            .filter(|(regex, _)| regex.is_match(topic))
            .map(|(_, rule)| rule);

        exact.chain(prefix).chain(wildcard).cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.prefix.is_empty() && self.wildcard.is_empty()
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.prefix.len() + self.wildcard.len()
    }
}

/// Build the anchored expression for a wildcard pattern.
///
/// Each empty segment becomes one arbitrary segment, so a leading or
/// trailing dot leaves that edge open by exactly one segment.
fn wildcard_expression(pattern: &str) -> String {
    let body = pattern
        .split(SEPARATOR)
        .map(|segment| {
            if segment.is_empty() {
                ANY_SEGMENT.to_string()
            } else {
                regex::escape(segment)
            }
        })
        .collect::<Vec<_>>()
        .join(r"\.");

    format!("^{}$", body)
}

/// Map each topic to the rules it matches.
///
/// `None` subscribes to everything (every topic maps to an empty match
/// list); an empty rule set subscribes to nothing.
pub fn restrict<'a, I>(
    topics: I,
    rules: Option<&CompiledRuleSet>,
) -> BTreeMap<String, Vec<TopicRule>>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut restricted = BTreeMap::new();

    for topic in topics {
        match rules {
            None => {
                restricted.insert(topic.to_string(), Vec::new());
            }
            Some(rules) => {
                let matched = rules.matches(topic);
                if !matched.is_empty() {
                    restricted.insert(topic.to_string(), matched);
                }
            }
        }
    }

    restricted
}

/// Prepend `namespace` unless the topic already lives under it.
pub fn normalize_topic(namespace: &str, topic: &str) -> String {
    if topic.starts_with(namespace) {
        topic.to_string()
    } else {
        format!("{}{}", namespace, topic)
    }
}

/// Keep only rules under `namespace`, dropping any rule whose pattern is the
/// namespace root itself (`ns.` as prefix, `ns..` as wildcard, ...).
pub fn narrow_to_namespace(rules: &[TopicRule], namespace: &str) -> Vec<TopicRule> {
    let root = namespace.trim_end_matches(SEPARATOR);

    rules
        .iter()
        .filter(|rule| rule.pattern.starts_with(namespace))
        .filter(|rule| rule.pattern.trim_end_matches(SEPARATOR) != root)
        .cloned()
        .collect()
}
