//! Error types for the state machine engine.

use crate::BoxError;

/// Errors returned by [`StateMachine`](crate::StateMachine) operations.
///
/// Registration and startup errors are setup mistakes and surface before
/// the tick loop ever runs. Only [`FsmError::Action`] can occur at runtime.
#[derive(Debug, thiserror::Error)]
pub enum FsmError {
    /// `register_states` was given fewer states than a machine needs.
    #[error("at least {min} state(s) required, got {got}")]
    TooFewStates { min: usize, got: usize },

    /// A state with this name is already registered.
    #[error("state {0} is already registered")]
    DuplicateState(String),

    /// The referenced state was never registered.
    #[error("state {0} is not registered")]
    UnknownState(String),

    /// `startup` was called on a machine without states.
    #[error("machine {0} has no states registered")]
    NoStates(String),

    /// `startup` was called before a starting state was set.
    #[error("machine {0} has no starting state")]
    NoStartingState(String),

    /// The operation is only valid before `startup` (or after `shutdown`).
    #[error("machine {0} is running")]
    AlreadyRunning(String),

    /// A state action failed.
    #[error("action of state {state} failed: {source}")]
    Action {
        state: String,
        #[source]
        source: BoxError,
    },

    /// The tick loop task panicked or was aborted.
    #[error("tick loop of machine {0} terminated abnormally")]
    LoopAborted(String),
}
