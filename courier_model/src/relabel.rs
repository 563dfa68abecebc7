//! Relabelling rules applied to series before they are shipped.
//!
//! Rules run in order against a [`LabelBuilder`]; `keep` and `drop` decide
//! whether the series is shipped at all, the remaining actions rewrite its
//! label set.

use regex::Regex;
use snafu::{ResultExt, Snafu};

use crate::labels::LabelBuilder;

const DEFAULT_SEPARATOR: &str = ";";
const DEFAULT_REPLACEMENT: &str = "$1";

#[derive(Debug, Snafu)]
pub enum RelabelError {
    #[snafu(display("invalid relabel pattern {pattern:?}"))]
    Pattern {
        pattern: String,
        source: regex::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelabelAction {
    /// Rewrite `target_label` from the expanded replacement when the
    /// concatenated source labels match.
    Replace,
    /// Keep the series only when the concatenated source labels match.
    Keep,
    /// Drop the series when the concatenated source labels match.
    Drop,
    /// Delete every label whose name matches.
    LabelDrop,
    /// Delete every label whose name does not match.
    LabelKeep,
}

#[derive(Debug, Clone)]
pub struct RelabelRule {
    pub action: RelabelAction,
    pub source_labels: Vec<String>,
    pub separator: String,
    pub regex: Regex,
    pub target_label: String,
    pub replacement: String,
}

impl RelabelRule {
    pub fn new(action: RelabelAction, pattern: &str) -> Result<Self, RelabelError> {
        // Match the full value, not a substring of it.
        let anchored = format!("^(?:{pattern})$");
        let regex = Regex::new(&anchored).context(PatternSnafu { pattern })?;
        Ok(Self {
            action,
            source_labels: Vec::new(),
            separator: DEFAULT_SEPARATOR.to_owned(),
            regex,
            target_label: String::new(),
            replacement: DEFAULT_REPLACEMENT.to_owned(),
        })
    }

    pub fn with_source_labels(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.source_labels = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_target_label(mut self, name: impl Into<String>) -> Self {
        self.target_label = name.into();
        self
    }

    pub fn with_replacement(mut self, replacement: impl Into<String>) -> Self {
        self.replacement = replacement.into();
        self
    }

    fn source_value(&self, builder: &LabelBuilder) -> String {
        let mut parts = Vec::with_capacity(self.source_labels.len());
        for name in &self.source_labels {
            parts.push(builder.get(name).unwrap_or_default().to_owned());
        }
        parts.join(&self.separator)
    }
}

/// Runs every rule against the builder in order. Returns `false` when a
/// `keep`/`drop` rule decides the series must not be shipped.
pub fn process_builder(builder: &mut LabelBuilder, rules: &[RelabelRule]) -> bool {
    for rule in rules {
        match rule.action {
            RelabelAction::Keep => {
                if !rule.regex.is_match(&rule.source_value(builder)) {
                    return false;
                }
            }
            RelabelAction::Drop => {
                if rule.regex.is_match(&rule.source_value(builder)) {
                    return false;
                }
            }
            RelabelAction::Replace => {
                let value = rule.source_value(builder);
                let Some(captures) = rule.regex.captures(&value) else {
                    continue;
                };
                let mut expanded = String::new();
                captures.expand(&rule.replacement, &mut expanded);
                builder.set(&rule.target_label, &expanded);
            }
            RelabelAction::LabelDrop => {
                for name in builder.names() {
                    if rule.regex.is_match(&name) {
                        builder.del(&name);
                    }
                }
            }
            RelabelAction::LabelKeep => {
                for name in builder.names() {
                    if !rule.regex.is_match(&name) {
                        builder.del(&name);
                    }
                }
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::Labels;

    fn builder_for(pairs: &[(&str, &str)]) -> LabelBuilder {
        let mut builder = LabelBuilder::new();
        builder.reset(&Labels::from_pairs(pairs.iter().copied()));
        builder
    }

    #[test]
    fn drop_rule_rejects_matching_series() {
        let rule = RelabelRule::new(RelabelAction::Drop, "dev-.*")
            .unwrap()
            .with_source_labels(["env"]);
        let mut builder = builder_for(&[("env", "dev-eu")]);
        assert!(!process_builder(&mut builder, &[rule.clone()]));

        let mut builder = builder_for(&[("env", "prod")]);
        assert!(process_builder(&mut builder, &[rule]));
    }

    #[test]
    fn replace_expands_capture_groups() {
        let rule = RelabelRule::new(RelabelAction::Replace, "([^:]+):(\\d+)")
            .unwrap()
            .with_source_labels(["address"])
            .with_target_label("host")
            .with_replacement("$1");
        let mut builder = builder_for(&[("address", "db-1:9090")]);
        assert!(process_builder(&mut builder, &[rule]));
        assert_eq!(builder.get("host"), Some("db-1"));
    }

    #[test]
    fn labelkeep_prunes_everything_else() {
        let rule = RelabelRule::new(RelabelAction::LabelKeep, "__name__|job").unwrap();
        let mut builder = builder_for(&[("__name__", "up"), ("job", "api"), ("scratch", "x")]);
        assert!(process_builder(&mut builder, &[rule]));
        assert_eq!(
            builder.labels(),
            Labels::from_pairs([("__name__", "up"), ("job", "api")])
        );
    }
}
