//! Authorization gate, consumed from the external rules collaborator.
//!
//! The engine never decides *whether* an operation is allowed; it asks the
//! evaluator before admitting anything into a document. A denial surfaces
//! as an explicit message to the client and mutates nothing.

use serde_json::Value;

use crate::crdt::types::ReplicaId;

/// What the client is trying to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Read,
    Write,
    Delete,
}

/// Evaluation context handed to the rules engine.
#[derive(Debug, Clone)]
pub struct EvalContext {
    pub replica: ReplicaId,
    pub user: Option<Value>,
}

/// The evaluator's verdict.
#[derive(Debug, Clone)]
pub struct AccessDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl AccessDecision {
    pub fn allow() -> Self {
        AccessDecision {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        AccessDecision {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// The authorization surface the engine consumes. `path` is
/// `collection/doc_id`.
pub trait RulesEvaluator: Send + Sync {
    fn evaluate(&self, action: Action, path: &str, ctx: &EvalContext) -> AccessDecision;
}

/// Default evaluator: everything is allowed.
pub struct AllowAll;

impl RulesEvaluator for AllowAll {
    fn evaluate(&self, _action: Action, _path: &str, _ctx: &EvalContext) -> AccessDecision {
        AccessDecision::allow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DenyWrites;

    impl RulesEvaluator for DenyWrites {
        fn evaluate(&self, action: Action, _path: &str, _ctx: &EvalContext) -> AccessDecision {
            match action {
                Action::Read => AccessDecision::allow(),
                _ => AccessDecision::deny("read-only rules"),
            }
        }
    }

    #[test]
    fn test_allow_all() {
        let ctx = EvalContext {
            replica: 1,
            user: None,
        };
        assert!(AllowAll.evaluate(Action::Write, "notes/1", &ctx).allowed);
    }

    #[test]
    fn test_custom_evaluator_denies() {
        let ctx = EvalContext {
            replica: 1,
            user: None,
        };
        let decision = DenyWrites.evaluate(Action::Write, "notes/1", &ctx);
        assert!(!decision.allowed);
        assert_eq!(decision.reason.as_deref(), Some("read-only rules"));
    }
}
