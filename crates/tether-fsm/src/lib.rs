//! Tick-driven finite-state machine engine for Tether.
//!
//! A [`StateMachine`] owns a set of named [`State`]s and a current-state
//! pointer. A background task driven by a fixed-period [`Ticker`] fires the
//! current state's action on every tick, or every `n`th tick for states
//! registered [`with_ticks(n)`](State::with_ticks). The engine knows nothing
//! about what the states mean; actions move the machine along by calling
//! [`StateMachine::move_to_state`].
//!
//! ```rust,no_run
//! # async fn demo() -> Result<(), tether_fsm::FsmError> {
//! use std::time::Duration;
//! use tether_fsm::{MachineConfig, State, StateMachine};
//!
//! let machine = StateMachine::new(MachineConfig::new("door", Duration::from_millis(100)));
//! machine.register_states(
//!     vec![
//!         State::new("closed", |ctx| async move {
//!             ctx.machine.move_to_state("open");
//!             Ok(())
//!         }),
//!         State::idle("open").with_ticks(5),
//!     ],
//!     "closed",
//!     None,
//! )?;
//! machine.startup()?;
//! machine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

mod error;
mod machine;
mod state;
mod ticker;

pub use error::FsmError;
pub use machine::{MIN_STATES, MachineConfig, StateMachine};
pub use state::{ActionContext, BoxError, State, StateKey};
pub use ticker::{TickConfig, TickInfo, TickPolicy, Ticker};
