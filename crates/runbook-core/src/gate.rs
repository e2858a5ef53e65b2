//! Confirmation gate applied before a run request is sent.
//!
//! The gate is a pure predicate. It is a convenience for the operator, not
//! a security boundary: the coordinator re-checks the tier with
//! [`required_tier`] before dispatching anything.

use crate::registry::Action;
use crate::types::PermissionTier;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The phrase an operator must type to run a dangerous action.
pub const CONFIRMATION_PHRASE: &str = "confirm";

// ---------------------------------------------------------------------------
// GateDecision
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum GateDecision {
    Allow,
    Deny { reason: DenyReason },
}

impl GateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, GateDecision::Allow)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DenyReason {
    InsufficientTier {
        required: PermissionTier,
        actual: PermissionTier,
    },
    ConfirmationMismatch,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::InsufficientTier { required, actual } => {
                write!(f, "requires {required} permission, you have {actual}")
            }
            DenyReason::ConfirmationMismatch => write!(
                f,
                "dangerous action: type '{CONFIRMATION_PHRASE}' to proceed"
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Checks
// ---------------------------------------------------------------------------

/// Minimum tier needed to run `action`.
pub fn required_tier(action: &Action) -> PermissionTier {
    if action.dangerous {
        PermissionTier::ElevatedUse
    } else {
        PermissionTier::Use
    }
}

/// Whether `text` is an acceptable confirmation (trimmed, case-insensitive).
pub fn confirmation_matches(text: &str) -> bool {
    text.trim().to_lowercase() == CONFIRMATION_PHRASE
}

/// Client-side gate: tier check plus, for dangerous actions, the typed phrase.
pub fn check(action: &Action, tier: PermissionTier, confirmation: &str) -> GateDecision {
    let required = required_tier(action);
    if tier < required {
        return GateDecision::Deny {
            reason: DenyReason::InsufficientTier {
                required,
                actual: tier,
            },
        };
    }
    if action.dangerous && !confirmation_matches(confirmation) {
        return GateDecision::Deny {
            reason: DenyReason::ConfirmationMismatch,
        };
    }
    GateDecision::Allow
}

/// Server-side re-check of the tier alone.
pub fn authorize(action: &Action, tier: PermissionTier) -> crate::Result<()> {
    let required = required_tier(action);
    if tier < required {
        return Err(crate::RunbookError::PermissionDenied {
            required,
            actual: tier,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
