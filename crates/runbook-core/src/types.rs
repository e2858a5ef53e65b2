use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// PermissionTier
// ---------------------------------------------------------------------------

/// Operator permission tier. Ordered: `Use < ElevatedUse < Manage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionTier {
    Use,
    ElevatedUse,
    Manage,
}

impl PermissionTier {
    pub fn as_str(self) -> &'static str {
        match self {
            PermissionTier::Use => "use",
            PermissionTier::ElevatedUse => "elevated_use",
            PermissionTier::Manage => "manage",
        }
    }
}

impl fmt::Display for PermissionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PermissionTier {
    type Err = crate::error::RunbookError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "use" => Ok(PermissionTier::Use),
            "elevated_use" => Ok(PermissionTier::ElevatedUse),
            "manage" => Ok(PermissionTier::Manage),
            _ => Err(crate::error::RunbookError::InvalidTier(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// RunStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of a run.
///
/// ```text
/// Requested ──ack──▶ Running ──exit 0──────▶ Success
///                            ──exit != 0───▶ Failure
///                            ──transport──▶ Error
/// ```
///
/// `Error` is also reachable from `Requested`, for a run whose executor
/// disappears before acknowledging. No transition leaves a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Requested,
    Running,
    Success,
    Failure,
    Error,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::Failure | RunStatus::Error)
    }

    /// Whether moving from `self` to `next` is a legal forward transition.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Requested, Running)
                | (Requested, Error)
                | (Running, Success)
                | (Running, Failure)
                | (Running, Error)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Requested => "requested",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failure => "failure",
            RunStatus::Error => "error",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// OutputStream
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Id validation
// ---------------------------------------------------------------------------

/// Validate a server/action/run id: non-empty, ASCII letters, digits, `-`, `_`, `.`.
pub fn validate_id(id: &str) -> crate::Result<()> {
    if id.is_empty()
        || !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(crate::error::RunbookError::InvalidId(id.to_string()));
    }
    Ok(())
}
