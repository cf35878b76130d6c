//! Prompt routing.
//!
//! Picks at most one tool server for a free-text prompt: enabled rules are
//! scanned highest priority first (stable for ties) and the first pattern
//! that compiles and matches case-insensitively wins. No match means the
//! caller talks to the model directly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use regex::{Regex, RegexBuilder};

use super::errors::McpError;
use crate::store::{RoutingRule, ServerStatus, ToolServerConfig, ToolServerRegistry};

/// Compiled size cap for user-supplied patterns.
const PATTERN_SIZE_LIMIT: usize = 1 << 20;

/// A matched rule and the server it routes to.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteMatch {
    pub rule: RoutingRule,
    pub server: ToolServerConfig,
}

/// Compile a routing pattern the way matching does.
pub fn compile_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .size_limit(PATTERN_SIZE_LIMIT)
        .build()
}

pub struct RoutingEngine {
    registry: Arc<ToolServerRegistry>,
    enabled: bool,
    /// Compiled patterns by source text; `None` marks an invalid pattern.
    compiled: Mutex<HashMap<String, Option<Regex>>>,
}

impl RoutingEngine {
    /// `enabled = false` turns every lookup into "no match".
    pub fn new(registry: Arc<ToolServerRegistry>, enabled: bool) -> Self {
        Self {
            registry,
            enabled,
            compiled: Mutex::new(HashMap::new()),
        }
    }

    /// Highest-priority enabled rule matching `text`, regardless of whether
    /// its server is usable.
    pub fn match_rule(&self, text: &str) -> Result<Option<RoutingRule>, McpError> {
        if !self.enabled {
            return Ok(None);
        }
        let rules = self.registry.list_enabled_rules()?;
        Ok(self.select_rule(rules, text, |_| true))
    }

    /// Like [`match_rule`](Self::match_rule), but only returns a rule whose
    /// server can take the prompt now: remote servers always, Docker servers
    /// only while `Running`. Scanning continues past unusable servers.
    pub fn route(&self, text: &str) -> Result<Option<RouteMatch>, McpError> {
        if !self.enabled {
            return Ok(None);
        }
        let servers: HashMap<String, ToolServerConfig> = self
            .registry
            .list()?
            .into_iter()
            .map(|s| (s.id.clone(), s))
            .collect();
        let rules = self.registry.list_enabled_rules()?;

        let usable = |rule: &RoutingRule| {
            servers
                .get(&rule.server_id)
                .is_some_and(|s| s.is_remote() || s.status == ServerStatus::Running)
        };
        let Some(rule) = self.select_rule(rules, text, usable) else {
            return Ok(None);
        };
        let server = servers
            .get(&rule.server_id)
            .cloned()
            .ok_or_else(|| McpError::ServerNotFound {
                id: rule.server_id.clone(),
            })?;

        tracing::debug!(server = %server.name, pattern = %rule.pattern, priority = rule.priority, "prompt routed");
        Ok(Some(RouteMatch { rule, server }))
    }

    /// First rule, by descending priority, that is enabled, passes `accept`,
    /// and whose pattern matches `text`.
    pub fn select_rule(
        &self,
        mut rules: Vec<RoutingRule>,
        text: &str,
        accept: impl Fn(&RoutingRule) -> bool,
    ) -> Option<RoutingRule> {
        rules.sort_by_key(|r| std::cmp::Reverse(r.priority));
        rules
            .into_iter()
            .filter(|r| r.is_enabled)
            .find(|r| self.matches(&r.pattern, text) && accept(r))
    }

    fn matches(&self, pattern: &str, text: &str) -> bool {
        let mut compiled = self.compiled.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let regex = compiled.entry(pattern.to_string()).or_insert_with(|| match compile_pattern(pattern) {
            Ok(regex) => Some(regex),
            Err(e) => {
                tracing::warn!(pattern = %pattern, error = %e, "skipping invalid routing pattern");
                None
            }
        });
        regex.as_ref().is_some_and(|r| r.is_match(text))
    }
}
