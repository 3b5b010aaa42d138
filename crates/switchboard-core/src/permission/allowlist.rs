//! Standing permission rules.
//!
//! A rule pre-decides permission requests for one tool whose invocation
//! matches its pattern (see [`pattern`](super::pattern)). Rules are either
//! global or bound to one session, and either allow or deny.
//!
//! When several rules match, the winner is chosen by a named
//! [`RulePrecedence`] policy so the evaluation order is explicit and tested.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::pattern;
use crate::bus::{Event, EventBus, Topic};
use crate::error::{CoreError, CoreResult};
use crate::session::SessionId;
use crate::store::{Collection, Records};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleScope {
    Global,
    Session,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleEffect {
    #[default]
    Allow,
    Deny,
}

/// How matching rules are ranked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RulePrecedence {
    /// Session rules (oldest first), then global rules. First match wins,
    /// whatever its effect.
    #[default]
    SessionFirst,
    /// Any matching deny rule wins; otherwise the first matching allow rule,
    /// session rules before global ones.
    DenyFirst,
}

pub const DEFAULT_PRECEDENCE: RulePrecedence = RulePrecedence::SessionFirst;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllowlistRule {
    pub id: String,
    pub tool: String,
    pub pattern: String,
    pub scope: RuleScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub effect: RuleEffect,
    pub created_at: DateTime<Utc>,
}

impl AllowlistRule {
    fn applies_to(&self, session_id: &SessionId, tool: &str, invocation: &str) -> bool {
        let in_scope = match self.scope {
            RuleScope::Global => true,
            RuleScope::Session => self.session_id.as_ref() == Some(session_id),
        };
        in_scope && self.tool == tool && pattern::matches(&self.pattern, invocation)
    }

    fn same_as(&self, rule: &NewRule) -> bool {
        self.tool == rule.tool
            && pattern::normalize(&self.pattern) == pattern::normalize(&rule.pattern)
            && self.scope == rule.scope
            && self.session_id == rule.session_id
            && self.effect == rule.effect
    }
}

/// A rule as submitted, before it gets an id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRule {
    pub tool: String,
    pub pattern: String,
    pub scope: RuleScope,
    #[serde(default)]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub effect: RuleEffect,
}

impl NewRule {
    pub fn allow(tool: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            pattern: pattern.into(),
            scope: RuleScope::Global,
            session_id: None,
            effect: RuleEffect::Allow,
        }
    }

    pub fn for_session(mut self, session_id: SessionId) -> Self {
        self.scope = RuleScope::Session;
        self.session_id = Some(session_id);
        self
    }

    pub fn with_effect(mut self, effect: RuleEffect) -> Self {
        self.effect = effect;
        self
    }

    fn validate(&self) -> CoreResult<()> {
        if self.tool.trim().is_empty() {
            return Err(CoreError::InvalidInput("rule tool cannot be empty".to_string()));
        }
        if pattern::normalize(&self.pattern).is_empty() {
            return Err(CoreError::InvalidInput("rule pattern cannot be empty".to_string()));
        }
        match (self.scope, &self.session_id) {
            (RuleScope::Session, None) => Err(CoreError::InvalidInput(
                "session-scoped rule requires a session id".to_string(),
            )),
            (RuleScope::Global, Some(_)) => Err(CoreError::InvalidInput(
                "global rule cannot name a session".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// Pick the deciding rule among `rules` (in creation order).
pub fn select_rule<'a>(
    rules: &'a [AllowlistRule],
    session_id: &SessionId,
    tool: &str,
    invocation: &str,
    precedence: RulePrecedence,
) -> Option<&'a AllowlistRule> {
    let matching: Vec<&AllowlistRule> = [RuleScope::Session, RuleScope::Global]
        .into_iter()
        .flat_map(|scope| rules.iter().filter(move |r| r.scope == scope))
        .filter(|r| r.applies_to(session_id, tool, invocation))
        .collect();

    match precedence {
        RulePrecedence::SessionFirst => matching.first().copied(),
        RulePrecedence::DenyFirst => matching
            .iter()
            .find(|r| r.effect == RuleEffect::Deny)
            .or_else(|| matching.first())
            .copied(),
    }
}

pub struct Allowlist {
    rules: RwLock<Vec<AllowlistRule>>,
    records: Records,
    bus: Arc<EventBus>,
    precedence: RulePrecedence,
}

impl Allowlist {
    pub fn new(records: Records, bus: Arc<EventBus>, precedence: RulePrecedence) -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
            records,
            bus,
            precedence,
        }
    }

    pub fn precedence(&self) -> RulePrecedence {
        self.precedence
    }

    /// Load persisted rules, in creation order.
    pub async fn load(&self) -> CoreResult<usize> {
        let mut loaded: Vec<AllowlistRule> = self.records.load_all(Collection::Rules).await?;
        loaded.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let count = loaded.len();
        *self.rules.write().await = loaded;
        Ok(count)
    }

    /// Add a rule. An identical existing rule is returned instead of a copy.
    pub async fn add(&self, rule: NewRule) -> CoreResult<AllowlistRule> {
        rule.validate()?;

        let mut rules = self.rules.write().await;
        if let Some(existing) = rules.iter().find(|r| r.same_as(&rule)) {
            return Ok(existing.clone());
        }

        let rule = AllowlistRule {
            id: Uuid::new_v4().to_string(),
            tool: rule.tool,
            pattern: rule.pattern.trim().to_string(),
            scope: rule.scope,
            session_id: rule.session_id,
            effect: rule.effect,
            created_at: Utc::now(),
        };
        self.records.save(Collection::Rules, &rule.id, &rule).await?;
        rules.push(rule.clone());
        drop(rules);

        log::info!(
            "Added {:?} rule {} for {} `{}`",
            rule.effect,
            rule.id,
            rule.tool,
            rule.pattern
        );
        self.bus
            .publish(&Topic::Rules, Event::RuleAdded { rule: rule.clone() });
        Ok(rule)
    }

    /// Global rules plus, when given, the session's own rules.
    pub async fn list(&self, session_id: Option<&SessionId>) -> Vec<AllowlistRule> {
        self.rules
            .read()
            .await
            .iter()
            .filter(|r| match r.scope {
                RuleScope::Global => true,
                RuleScope::Session => session_id.is_some() && r.session_id.as_ref() == session_id,
            })
            .cloned()
            .collect()
    }

    pub async fn remove(&self, id: &str) -> CoreResult<bool> {
        let mut rules = self.rules.write().await;
        let Some(index) = rules.iter().position(|r| r.id == id) else {
            return Ok(false);
        };
        self.records.remove(Collection::Rules, id).await?;
        rules.remove(index);
        drop(rules);

        self.bus.publish(
            &Topic::Rules,
            Event::RuleRemoved {
                rule_id: id.to_string(),
            },
        );
        Ok(true)
    }

    /// Drop every rule scoped to a session.
    pub async fn remove_for_session(&self, session_id: &SessionId) -> CoreResult<usize> {
        let mut rules = self.rules.write().await;
        let doomed: Vec<String> = rules
            .iter()
            .filter(|r| r.scope == RuleScope::Session && r.session_id.as_ref() == Some(session_id))
            .map(|r| r.id.clone())
            .collect();

        for id in &doomed {
            self.records.remove(Collection::Rules, id).await?;
        }
        rules.retain(|r| !doomed.contains(&r.id));
        drop(rules);

        for rule_id in &doomed {
            self.bus.publish(
                &Topic::Rules,
                Event::RuleRemoved {
                    rule_id: rule_id.clone(),
                },
            );
        }
        Ok(doomed.len())
    }

    /// The rule deciding a tool call, if any.
    pub async fn evaluate(
        &self,
        session_id: &SessionId,
        tool: &str,
        invocation: &str,
    ) -> Option<AllowlistRule> {
        let rules = self.rules.read().await;
        select_rule(&rules, session_id, tool, invocation, self.precedence).cloned()
    }
}
