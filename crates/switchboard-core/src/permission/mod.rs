//! Permission brokering between blocking CLI hooks and remote deciders.
//!
//! - [`request`] - the request/decision data model
//! - [`pattern`] - allowlist pattern matching
//! - [`prefixes`] - pattern suggestions for shell commands
//! - [`allowlist`] - standing allow/deny rules and their precedence
//! - [`broker`] - the blocking request/resolve exchange

pub mod allowlist;
pub mod broker;
pub mod pattern;
pub mod prefixes;
pub mod request;

pub use allowlist::{
    select_rule, Allowlist, AllowlistRule, NewRule, RuleEffect, RulePrecedence, RuleScope,
    DEFAULT_PRECEDENCE,
};
pub use broker::{BrokerSettings, Outcome, PermissionBroker};
pub use request::{Decider, Decision, PendingRequest, RequestKind, TimeoutPolicy};
