use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::executor::{ToolCall, ToolResult};

/// Lifecycle of a single tool call.
///
/// `Pending → Executing → {Success | Failed}`; a policy denial goes straight from `Pending` to
/// `Failed`. Terminal states are never left. Retries start a fresh `Pending` under a new call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ToolExecutionState {
    Pending {
        call_id: String,
        call: ToolCall,
    },
    Executing {
        call_id: String,
        started_at_ms: u64,
    },
    Success {
        call_id: String,
        result: ToolResult,
        duration_ms: u64,
    },
    Failed {
        call_id: String,
        error: String,
        duration_ms: u64,
    },
}

impl ToolExecutionState {
    #[must_use]
    pub fn call_id(&self) -> &str {
        match self {
            Self::Pending { call_id, .. }
            | Self::Executing { call_id, .. }
            | Self::Success { call_id, .. }
            | Self::Failed { call_id, .. } => call_id,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending { .. } => "pending",
            Self::Executing { .. } => "executing",
            Self::Success { .. } => "success",
            Self::Failed { .. } => "failed",
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success { .. } | Self::Failed { .. })
    }

    #[must_use]
    pub fn can_transition_to(&self, next: &Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending { .. }, Self::Executing { .. } | Self::Failed { .. })
                | (Self::Executing { .. }, Self::Success { .. } | Self::Failed { .. })
        )
    }
}

pub type StateEventTx = mpsc::UnboundedSender<ToolExecutionState>;

/// Latest state per call id.
#[derive(Debug, Default)]
pub struct ToolStateManager {
    states: Mutex<HashMap<String, ToolExecutionState>>,
    event_tx: Option<StateEventTx>,
}

impl ToolStateManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish every accepted state on `tx`.
    #[must_use]
    pub fn with_event_tx(mut self, tx: StateEventTx) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Record `state` for its call id. Returns `false` and keeps the previous state when the
    /// transition is not allowed.
    pub fn update_state(&self, state: ToolExecutionState) -> bool {
        {
            let mut states = self
                .states
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let allowed = match states.get(state.call_id()) {
                None => matches!(state, ToolExecutionState::Pending { .. }),
                Some(current) => current.can_transition_to(&state),
            };
            if !allowed {
                tracing::warn!(
                    call_id = state.call_id(),
                    next = state.name(),
                    "rejected tool state transition"
                );
                return false;
            }
            tracing::debug!(call_id = state.call_id(), state = state.name(), "tool state");
            states.insert(state.call_id().to_owned(), state.clone());
        }
        if let Some(ref tx) = self.event_tx {
            let _ = tx.send(state);
        }
        true
    }

    #[must_use]
    pub fn get_state(&self, call_id: &str) -> Option<ToolExecutionState> {
        self.states
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(call_id)
            .cloned()
    }

    #[must_use]
    pub fn all_states(&self) -> HashMap<String, ToolExecutionState> {
        self.states
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) {
        self.states
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
    }
}
