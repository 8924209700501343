//! Stages, actions and the allowed-action table.

use std::fmt;

use axum::http::StatusCode;

/// Decision points a request travels through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Receive,
    Hash,
    Lookup,
    Hit,
    Miss,
    Pass,
    Fetch,
    Error,
    Deliver,
    Log,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Receive => "receive",
            Stage::Hash => "hash",
            Stage::Lookup => "lookup",
            Stage::Hit => "hit",
            Stage::Miss => "miss",
            Stage::Pass => "pass",
            Stage::Fetch => "fetch",
            Stage::Error => "error",
            Stage::Deliver => "deliver",
            Stage::Log => "log",
        }
    }

    /// Action taken when a handler keeps the builtin behaviour.
    pub fn default_action(&self) -> Action {
        match self {
            Stage::Receive | Stage::Hash => Action::Hash,
            Stage::Miss => Action::Fetch,
            Stage::Pass => Action::Pass,
            Stage::Lookup | Stage::Hit | Stage::Fetch | Stage::Error | Stage::Deliver | Stage::Log => {
                Action::Deliver
            }
        }
    }

    /// Whether a handler for this stage may return `action`.
    pub fn allows(&self, action: &Action) -> bool {
        use Action as A;
        match self {
            Stage::Receive => matches!(action, A::Hash | A::Pass | A::Error(_) | A::Restart),
            Stage::Hash => matches!(action, A::Hash),
            // Lookup has no handler; it routes on the cache result.
            Stage::Lookup => false,
            Stage::Hit => matches!(action, A::Deliver | A::Pass | A::Restart | A::Error(_)),
            Stage::Miss => matches!(action, A::Fetch | A::Pass | A::Error(_) | A::DeliverStale),
            Stage::Pass => matches!(action, A::Pass | A::Error(_)),
            Stage::Fetch => matches!(
                action,
                A::Deliver | A::Pass | A::Error(_) | A::Restart | A::HitForPass | A::DeliverStale
            ),
            Stage::Error => matches!(action, A::Deliver | A::Restart | A::DeliverStale),
            Stage::Deliver => matches!(action, A::Deliver | A::Restart),
            Stage::Log => matches!(action, A::Deliver),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tagged result of a stage handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Hash,
    Pass,
    /// Route to the Error stage with this status.
    Error(StatusCode),
    Restart,
    Deliver,
    Fetch,
    HitForPass,
    DeliverStale,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Hash => "hash",
            Action::Pass => "pass",
            Action::Error(_) => "error",
            Action::Restart => "restart",
            Action::Deliver => "deliver",
            Action::Fetch => "fetch",
            Action::HitForPass => "hit_for_pass",
            Action::DeliverStale => "deliver_stale",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
