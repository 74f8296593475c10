//! Execution-mode decision engine.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Requested execution mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Block until the worker finishes.
    #[default]
    Sync,
    /// Run in the background and return a task id.
    Async,
    /// Let [`decide`] pick.
    Auto,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Sync => "sync",
            Self::Async => "async",
            Self::Auto => "auto",
        };
        write!(f, "{s}")
    }
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sync" => Ok(Self::Sync),
            "async" => Ok(Self::Async),
            "auto" => Ok(Self::Auto),
            other => Err(format!("unknown execution mode '{other}'")),
        }
    }
}

/// Concrete mode after resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolvedMode {
    Sync,
    Async,
}

impl std::fmt::Display for ResolvedMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sync => write!(f, "sync"),
            Self::Async => write!(f, "async"),
        }
    }
}

impl ExecutionMode {
    /// The concrete mode, unless this is `Auto`.
    pub fn resolved(self) -> Option<ResolvedMode> {
        match self {
            Self::Sync => Some(ResolvedMode::Sync),
            Self::Async => Some(ResolvedMode::Async),
            Self::Auto => None,
        }
    }
}

/// Estimated task complexity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    #[default]
    Moderate,
    Complex,
}

/// Caller-declared task traits that drive the mode decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCharacteristics {
    pub estimated_complexity: Complexity,
    /// Task needs ongoing interaction with the user.
    pub requires_user_context: bool,
    /// A quick response matters.
    pub is_time_sensitive: bool,
    /// Task can finish without further input.
    pub can_run_independently: bool,
    /// Task will probably need clarifying questions.
    pub may_need_clarification: bool,
}

impl Default for TaskCharacteristics {
    fn default() -> Self {
        Self {
            estimated_complexity: Complexity::Moderate,
            requires_user_context: false,
            is_time_sensitive: false,
            can_run_independently: true,
            may_need_clarification: false,
        }
    }
}

/// Per-worker defaults used when the caller does not override them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerPreference {
    pub preferred_mode: Option<ExecutionMode>,
    pub typical_complexity: Option<Complexity>,
    pub typically_needs_context: bool,
}

/// Pick sync or async. First matching rule wins:
///
/// 1. `forced` unless `Auto`
/// 2. the worker's preferred mode unless `Auto`
/// 3. sync when the task needs user context
/// 4. sync when clarification is likely and time matters
/// 5. async for complex tasks that can run independently
/// 6. sync for simple tasks
/// 7. async for anything else that can run independently
/// 8. sync
pub fn decide(
    characteristics: &TaskCharacteristics,
    preference: Option<&WorkerPreference>,
    forced: Option<ExecutionMode>,
) -> ResolvedMode {
    if let Some(mode) = forced.and_then(ExecutionMode::resolved) {
        return mode;
    }

    if let Some(mode) = preference
        .and_then(|p| p.preferred_mode)
        .and_then(ExecutionMode::resolved)
    {
        return mode;
    }

    let c = characteristics;
    if c.requires_user_context {
        return ResolvedMode::Sync;
    }
    if c.may_need_clarification && c.is_time_sensitive {
        return ResolvedMode::Sync;
    }
    if c.estimated_complexity == Complexity::Complex && c.can_run_independently {
        return ResolvedMode::Async;
    }
    if c.estimated_complexity == Complexity::Simple {
        return ResolvedMode::Sync;
    }
    if c.can_run_independently {
        return ResolvedMode::Async;
    }

    ResolvedMode::Sync
}
