use std::collections::HashMap;

use glob::Pattern;
use serde::{Deserialize, Serialize};

use crate::context::ToolExecutionContext;
use crate::executor::ToolCall;

/// Verdict gating whether a tool call proceeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyDecision {
    Allow,
    #[serde(alias = "ask_user")]
    Ask,
    Deny,
}

/// Decides on a tool call before it reaches the registry.
pub trait PolicyEngine: Send + Sync {
    fn check_permission(&self, call: &ToolCall, context: &ToolExecutionContext) -> PolicyDecision;
}

/// Lets every call through.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl PolicyEngine for AllowAll {
    fn check_permission(&self, _call: &ToolCall, _context: &ToolExecutionContext) -> PolicyDecision {
        PolicyDecision::Allow
    }
}

/// Single permission rule: glob `pattern` + decision.
#[derive(Debug, Clone, Deserialize)]
pub struct PermissionRule {
    pub pattern: String,
    pub action: PolicyDecision,
}

/// Param keys tried in order to find the string a rule's glob is matched against.
const SUBJECT_KEYS: &[&str] = &["command", "cmd", "path", "file_path", "session_id"];

/// Maps tool name → ordered list of rules. First matching rule wins; default is `Ask`.
#[derive(Debug, Clone, Default)]
pub struct PermissionPolicy {
    rules: HashMap<String, Vec<PermissionRule>>,
}

impl PermissionPolicy {
    #[must_use]
    pub fn new(rules: HashMap<String, Vec<PermissionRule>>) -> Self {
        Self { rules }
    }

    /// Check permission for a tool name and its subject string. First matching glob wins.
    #[must_use]
    pub fn check(&self, tool_name: &str, subject: &str) -> PolicyDecision {
        let Some(rules) = self.rules.get(tool_name) else {
            return PolicyDecision::Ask;
        };
        let normalized = subject.to_lowercase();
        for rule in rules {
            if let Ok(pat) = Pattern::new(&rule.pattern.to_lowercase())
                && pat.matches(&normalized)
            {
                return rule.action;
            }
        }
        PolicyDecision::Ask
    }

    /// Returns true if all rules for `tool_name` are Deny.
    #[must_use]
    pub fn is_fully_denied(&self, tool_name: &str) -> bool {
        self.rules.get(tool_name).is_some_and(|rules| {
            !rules.is_empty() && rules.iter().all(|r| r.action == PolicyDecision::Deny)
        })
    }
}

/// The first string param among [`SUBJECT_KEYS`], else the params as compact JSON.
fn subject_of(call: &ToolCall) -> String {
    SUBJECT_KEYS
        .iter()
        .find_map(|key| call.params.get(*key).and_then(|v| v.as_str()))
        .map_or_else(
            || serde_json::to_string(&call.params).unwrap_or_default(),
            str::to_owned,
        )
}

impl PolicyEngine for PermissionPolicy {
    fn check_permission(&self, call: &ToolCall, _context: &ToolExecutionContext) -> PolicyDecision {
        self.check(&call.tool_name, &subject_of(call))
    }
}

/// TOML-deserializable permissions config section.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct PermissionsConfig {
    #[serde(flatten)]
    pub tools: HashMap<String, Vec<PermissionRule>>,
}

impl From<PermissionsConfig> for PermissionPolicy {
    fn from(config: PermissionsConfig) -> Self {
        Self::new(config.tools)
    }
}
