//! Topic rule engine.
//!
//! Topics are dot-delimited hierarchical strings (`tidemark.front.issue.42`).
//! Subscriptions are expressed as rules of three kinds:
//! - `Exact`: the topic equals the pattern
//! - `Prefix`: the topic starts with the pattern
//! - `Wildcard`: an empty segment (`a..c`) stands for exactly one arbitrary segment
//!
//! Rules are compiled once into a [`CompiledRuleSet`] and evaluated against
//! topics without side effects, so evaluation is safe from any thread.
//!
//! # Example
//!
//! ```ignore
//! let rules = CompiledRuleSet::compile(vec![
//!     TopicRule::new("tidemark.front.", RuleKind::Prefix),
//!     TopicRule::new("tidemark..issue", RuleKind::Wildcard),
//! ])?;
//!
//! for rule in rules.matches("tidemark.front.issue") {
//!     println!("matched {} ({})", rule.pattern, rule.kind);
//! }
//! ```

mod rules;

pub use rules::{
    narrow_to_namespace, normalize_topic, restrict, CompiledRuleSet, RuleKind, TopicRule,
};
