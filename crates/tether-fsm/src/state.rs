//! States: a name, an optional tick-skip count and an async action.

use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::StateMachine;

/// Error type returned by state actions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Anything usable as a state name: a string, an integer tag, or (most
/// commonly) a fieldless enum.
pub trait StateKey:
    Copy + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static
{
}

impl<T> StateKey for T where
    T: Copy + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static
{
}

pub(crate) type Action<K> =
    Arc<dyn Fn(ActionContext<K>) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// What an action receives when it fires.
pub struct ActionContext<K: StateKey> {
    /// Handle to the machine running the action. Actions use it to move to
    /// the next state.
    pub machine: StateMachine<K>,
    /// The state whose action is firing.
    pub state: K,
    /// Ticks elapsed since the most recent entry into `state` (starts at 1).
    pub tick: u64,
}

/// A single registered state.
pub struct State<K: StateKey> {
    pub(crate) name: K,
    pub(crate) ticks: u32,
    pub(crate) action: Action<K>,
}

impl<K: StateKey> State<K> {
    /// Creates a state whose action fires on every tick.
    ///
    /// Arguments for the action are whatever the closure captures.
    pub fn new<F, Fut>(name: K, action: F) -> Self
    where
        F: Fn(ActionContext<K>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        Self {
            name,
            ticks: 0,
            action: Arc::new(move |ctx| Box::pin(action(ctx))),
        }
    }

    /// Creates a state with a no-op action.
    pub fn idle(name: K) -> Self {
        Self::new(name, |_| async { Ok(()) })
    }

    /// Fire the action only every `ticks` ticks, counted from entry into
    /// the state. `0` and `1` both mean every tick.
    pub fn with_ticks(mut self, ticks: u32) -> Self {
        self.ticks = ticks;
        self
    }

    /// The state's name.
    pub fn name(&self) -> K {
        self.name
    }

    /// The configured tick-skip count.
    pub fn ticks(&self) -> u32 {
        self.ticks
    }

    /// Whether the action is due after `ticks_in_state` ticks in the state.
    pub(crate) fn is_due(&self, ticks_in_state: u64) -> bool {
        self.ticks <= 1 || ticks_in_state % u64::from(self.ticks) == 0
    }
}

impl<K: StateKey> fmt::Debug for State<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("name", &self.name)
            .field("ticks", &self.ticks)
            .finish_non_exhaustive()
    }
}
