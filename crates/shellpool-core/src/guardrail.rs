use std::path::{Path, PathBuf};

use glob::Pattern;
use regex::{Regex, RegexBuilder};
use serde::Deserialize;

use crate::config::GuardrailConfig;

/// How a policy pattern is interpreted. Matching is case-insensitive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatcherKind {
    #[default]
    Substring,
    Regex,
    Glob,
}

/// Policy as written in configuration or a policy document.
#[derive(Debug, Clone, Deserialize)]
pub struct PolicyRule {
    pub name: String,
    pub pattern: String,
    #[serde(default)]
    pub kind: MatcherKind,
    #[serde(default)]
    pub message: Option<String>,
}

/// User-level policy document: a TOML file with `[[policies]]` tables.
#[derive(Debug, Default, Deserialize)]
pub struct PolicyDocument {
    #[serde(default)]
    pub policies: Vec<PolicyRule>,
}

#[derive(Debug, thiserror::Error)]
pub enum GuardrailError {
    #[error("invalid pattern in policy {name}: {message}")]
    InvalidPattern { name: String, message: String },

    #[error("failed to load policy document {}: {message}", path.display())]
    Document { path: PathBuf, message: String },
}

#[derive(Debug, Clone)]
pub enum Matcher {
    Substring(String),
    Regex(Regex),
    Glob(Pattern),
}

impl Matcher {
    fn matches(&self, command: &str, lowered: &str) -> bool {
        match self {
            Self::Substring(needle) => lowered.contains(needle.as_str()),
            Self::Regex(re) => re.is_match(command),
            Self::Glob(pat) => pat.matches(lowered),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GuardrailPolicy {
    pub name: String,
    pub matcher: Matcher,
    pub message: String,
}

impl GuardrailPolicy {
    /// # Errors
    ///
    /// Returns `GuardrailError::InvalidPattern` when a regex or glob does not compile.
    pub fn from_rule(rule: &PolicyRule) -> Result<Self, GuardrailError> {
        let invalid = |e: &dyn std::fmt::Display| GuardrailError::InvalidPattern {
            name: rule.name.clone(),
            message: e.to_string(),
        };
        let matcher = match rule.kind {
            MatcherKind::Substring => Matcher::Substring(rule.pattern.to_lowercase()),
            MatcherKind::Regex => Matcher::Regex(
                RegexBuilder::new(&rule.pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| invalid(&e))?,
            ),
            MatcherKind::Glob => {
                Matcher::Glob(Pattern::new(&rule.pattern.to_lowercase()).map_err(|e| invalid(&e))?)
            }
        };
        Ok(Self {
            name: rule.name.clone(),
            matcher,
            message: rule
                .message
                .clone()
                .unwrap_or_else(|| format!("command blocked by policy {}", rule.name)),
        })
    }
}

/// Outcome of a guardrail check.
#[derive(Debug, Clone, Copy)]
pub enum Verdict<'a> {
    Allowed,
    Blocked(&'a GuardrailPolicy),
}

impl Verdict<'_> {
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

const DEFAULT_POLICIES: &[(&str, &str, &str)] = &[
    (
        "recursive-root-delete",
        r"\brm\s+(?:-[-a-z]+\s+)*-[a-z]*r[a-z]*\s+(?:-[-a-z]+\s+)*(?:/\*?|~/?|\$home/?)(?:\s|;|&|\||$)",
        "recursive deletion of the root or home directory is not allowed",
    ),
    (
        "mkfs",
        r"\bmkfs(?:\.\w+)?\b",
        "formatting filesystems is not allowed",
    ),
    (
        "dd-to-device",
        r"\bdd\b.*\bof=/dev/(?:sd|hd|vd|xvd|nvme|mmcblk|disk)",
        "writing raw data to a block device is not allowed",
    ),
    (
        "fork-bomb",
        r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
        "fork bombs are not allowed",
    ),
    (
        "power-state",
        r"(?:^|[;&|(]\s*|\bsudo\s+)(?:shutdown|reboot|halt|poweroff)\b",
        "changing the machine power state is not allowed",
    ),
];

/// Ordered safety policies; the first match blocks the command.
#[derive(Debug, Clone, Default)]
pub struct GuardrailChecker {
    policies: Vec<GuardrailPolicy>,
}

impl GuardrailChecker {
    #[must_use]
    pub fn new(policies: Vec<GuardrailPolicy>) -> Self {
        Self { policies }
    }

    /// Built-in policies only.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(default_policies(&[]))
    }

    /// Build the checker from configuration: built-in policies (minus the
    /// `allowed` names), then the policy document, then inline policies.
    ///
    /// # Errors
    ///
    /// Returns an error if the policy document cannot be read or parsed, or a
    /// pattern does not compile.
    pub fn from_config(config: &GuardrailConfig) -> Result<Self, GuardrailError> {
        let mut policies = if config.use_defaults {
            default_policies(&config.allowed)
        } else {
            Vec::new()
        };
        if let Some(path) = &config.policies_file {
            for rule in &load_policy_document(path)?.policies {
                policies.push(GuardrailPolicy::from_rule(rule)?);
            }
        }
        for rule in &config.policies {
            policies.push(GuardrailPolicy::from_rule(rule)?);
        }
        Ok(Self::new(policies))
    }

    #[must_use]
    pub fn check(&self, command: &str) -> Verdict<'_> {
        let lowered = command.to_lowercase();
        self.policies
            .iter()
            .find(|p| p.matcher.matches(command, &lowered))
            .map_or(Verdict::Allowed, Verdict::Blocked)
    }

    #[must_use]
    pub fn policies(&self) -> &[GuardrailPolicy] {
        &self.policies
    }
}

fn default_policies(allowed: &[String]) -> Vec<GuardrailPolicy> {
    DEFAULT_POLICIES
        .iter()
        .filter(|(name, _, _)| !allowed.iter().any(|a| a.eq_ignore_ascii_case(name)))
        .filter_map(|(name, pattern, message)| {
            let rule = PolicyRule {
                name: (*name).to_owned(),
                pattern: (*pattern).to_owned(),
                kind: MatcherKind::Regex,
                message: Some((*message).to_owned()),
            };
            GuardrailPolicy::from_rule(&rule).ok()
        })
        .collect()
}

/// # Errors
///
/// Returns `GuardrailError::Document` if the file cannot be read or is not valid TOML.
pub fn load_policy_document(path: &Path) -> Result<PolicyDocument, GuardrailError> {
    let doc_err = |message: String| GuardrailError::Document {
        path: path.to_path_buf(),
        message,
    };
    let content = std::fs::read_to_string(path).map_err(|e| doc_err(e.to_string()))?;
    toml::from_str(&content).map_err(|e| doc_err(e.to_string()))
}
