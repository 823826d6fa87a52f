//! The state machine: registered states, a current-state pointer and the
//! background tick loop that fires the current state's action.
//!
//! # Lifecycle
//!
//! ```text
//! new() → register_state(s) → set_starting_state() → startup()
//!                                                       │
//!                                      pause() ⇄ resume()
//!                                                       │
//!                                                  shutdown() → startup() …
//! ```
//!
//! The current state lives behind a lock and is only ever swapped under it,
//! so `move_to_state` is safe from any task. Actions are serialized by a
//! separate async step lock: the tick loop and [`StateMachine::trigger`]
//! both go through it, so no two actions of one machine overlap.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::ticker::{TickConfig, Ticker};
use crate::{ActionContext, FsmError, State, StateKey};

/// Smallest number of states `register_states` accepts.
pub const MIN_STATES: usize = 1;

/// Configuration for a [`StateMachine`].
#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// Name used in logs and errors.
    pub name: String,
    /// Ticker settings (period, overrun policy, jitter).
    pub tick: TickConfig,
    /// Stop the tick loop on the first failed action instead of logging
    /// the failure and carrying on.
    pub bail_on_error: bool,
    /// Log every transition at `info` instead of `debug`.
    pub trace: bool,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            name: "fsm".to_string(),
            tick: TickConfig::default(),
            bail_on_error: false,
            trace: false,
        }
    }
}

impl MachineConfig {
    /// A config with the given name and tick period.
    pub fn new(name: impl Into<String>, period: Duration) -> Self {
        Self {
            name: name.into(),
            tick: TickConfig::with_period(period),
            ..Default::default()
        }
    }
}

struct Core<K: StateKey> {
    states: HashMap<K, State<K>>,
    starting: Option<K>,
    stopping: Option<K>,
    current: Option<K>,
    /// Ticks since the most recent entry into `current`.
    ticks_in_state: u64,
    saved: Option<K>,
    /// Set by `shutdown` until the loop has exited. While set, the machine
    /// stays in its stopping state whatever in-flight actions ask for.
    stop_pending: bool,
}

/// Per-run handles, recreated by every `startup`.
struct Run {
    quit: oneshot::Sender<()>,
    paused: watch::Sender<bool>,
    stopped: watch::Receiver<bool>,
    task: JoinHandle<Result<(), FsmError>>,
}

struct Shared<K: StateKey> {
    config: MachineConfig,
    trace: AtomicBool,
    core: Mutex<Core<K>>,
    run: Mutex<Option<Run>>,
    step: tokio::sync::Mutex<()>,
}

/// A named, tick-driven finite-state machine.
///
/// Cheap to clone: clones share the same machine.
pub struct StateMachine<K: StateKey> {
    shared: Arc<Shared<K>>,
}

impl<K: StateKey> Clone for StateMachine<K> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K: StateKey> StateMachine<K> {
    /// Creates an empty, stopped machine.
    pub fn new(config: MachineConfig) -> Self {
        let trace = AtomicBool::new(config.trace);
        Self {
            shared: Arc::new(Shared {
                config,
                trace,
                core: Mutex::new(Core {
                    states: HashMap::new(),
                    starting: None,
                    stopping: None,
                    current: None,
                    ticks_in_state: 0,
                    saved: None,
                    stop_pending: false,
                }),
                run: Mutex::new(None),
                step: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// The machine's name.
    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    // -- Registration ------------------------------------------------------

    /// Registers a single state. Only valid while the machine is stopped.
    pub fn register_state(&self, state: State<K>) -> Result<(), FsmError> {
        self.ensure_stopped()?;
        let mut core = self.shared.core.lock();
        if core.states.contains_key(&state.name) {
            return Err(FsmError::DuplicateState(state.name.to_string()));
        }
        debug!(machine = %self.name(), state = %state.name, ticks = state.ticks, "state registered");
        core.states.insert(state.name, state);
        Ok(())
    }

    /// Registers a set of states together with the starting state and the
    /// optional stopping state.
    ///
    /// Nothing is registered unless the whole set is valid.
    pub fn register_states(
        &self,
        states: Vec<State<K>>,
        starting: K,
        stopping: Option<K>,
    ) -> Result<(), FsmError> {
        if states.len() < MIN_STATES {
            return Err(FsmError::TooFewStates {
                min: MIN_STATES,
                got: states.len(),
            });
        }
        self.ensure_stopped()?;
        {
            let core = self.shared.core.lock();
            let mut seen = Vec::with_capacity(states.len());
            for state in &states {
                if core.states.contains_key(&state.name) || seen.contains(&state.name) {
                    return Err(FsmError::DuplicateState(state.name.to_string()));
                }
                seen.push(state.name);
            }
            for name in std::iter::once(starting).chain(stopping) {
                if !seen.contains(&name) && !core.states.contains_key(&name) {
                    return Err(FsmError::UnknownState(name.to_string()));
                }
            }
        }
        for state in states {
            self.register_state(state)?;
        }
        self.set_starting_state(starting)?;
        if let Some(stopping) = stopping {
            self.set_stopping_state(stopping)?;
        }
        Ok(())
    }

    /// Sets the state entered by `startup`.
    pub fn set_starting_state(&self, name: K) -> Result<(), FsmError> {
        let mut core = self.shared.core.lock();
        if !core.states.contains_key(&name) {
            return Err(FsmError::UnknownState(name.to_string()));
        }
        core.starting = Some(name);
        Ok(())
    }

    /// Sets the state `shutdown` drives the machine into before stopping.
    pub fn set_stopping_state(&self, name: K) -> Result<(), FsmError> {
        let mut core = self.shared.core.lock();
        if !core.states.contains_key(&name) {
            return Err(FsmError::UnknownState(name.to_string()));
        }
        core.stopping = Some(name);
        Ok(())
    }

    // -- Transitions -------------------------------------------------------

    /// Makes `name` the current state and resets its tick counter.
    ///
    /// Returns `false` (and changes nothing) when `name` is not registered,
    /// or when a `shutdown` is under way and `name` is not the stopping
    /// state. Moving to the state the machine is already in is a successful
    /// no-op.
    pub fn move_to_state(&self, name: K) -> bool {
        self.transition(None, name)
    }

    /// Moves to `to` only if the machine is in `from` right now.
    ///
    /// The check and the move happen under one lock, so a concurrent
    /// transition can't slip in between. Returns whether the move happened.
    pub fn move_from(&self, from: K, to: K) -> bool {
        self.transition(Some(from), to)
    }

    fn transition(&self, expected: Option<K>, name: K) -> bool {
        let mut core = self.shared.core.lock();
        if !core.states.contains_key(&name) {
            warn!(machine = %self.name(), state = %name, "move to unregistered state rejected");
            return false;
        }
        if expected.is_some() && core.current != expected {
            return false;
        }
        if core.stop_pending && core.stopping != Some(name) {
            debug!(machine = %self.name(), state = %name, "move rejected, machine is stopping");
            return false;
        }
        if core.current == Some(name) {
            return true;
        }
        let previous = core.current.replace(name);
        core.ticks_in_state = 0;
        drop(core);
        self.log_transition(previous, name);
        true
    }

    /// The current state, if the machine has entered one.
    pub fn current_state(&self) -> Option<K> {
        self.shared.core.lock().current
    }

    /// Ticks counted since the current state was entered.
    pub fn ticks_in_state(&self) -> u64 {
        self.shared.core.lock().ticks_in_state
    }

    /// Remembers the current state in a single slot (overwriting it).
    pub fn save_state(&self) {
        let mut core = self.shared.core.lock();
        core.saved = core.current;
    }

    /// Moves back to the state remembered by [`save_state`](Self::save_state).
    ///
    /// Returns `false` when nothing was saved.
    pub fn restore_state(&self) -> bool {
        let saved = self.shared.core.lock().saved;
        match saved {
            Some(name) => self.move_to_state(name),
            None => false,
        }
    }

    /// Toggles transition logging at `info` level.
    pub fn enable_state_trace(&self, on: bool) {
        self.shared.trace.store(on, Ordering::Relaxed);
    }

    // -- Running -----------------------------------------------------------

    /// Enters the starting state and spawns the tick loop.
    ///
    /// The starting state is entered only if the machine has no current
    /// state yet, or is parked in its stopping state after a `shutdown`.
    /// Must not be called from within a state action.
    pub fn startup(&self) -> Result<(), FsmError> {
        let mut run = self.shared.run.lock();
        if run.is_some() {
            return Err(FsmError::AlreadyRunning(self.name().to_string()));
        }

        let entered = {
            let mut core = self.shared.core.lock();
            if core.states.is_empty() {
                return Err(FsmError::NoStates(self.name().to_string()));
            }
            let starting = core
                .starting
                .ok_or_else(|| FsmError::NoStartingState(self.name().to_string()))?;
            core.stop_pending = false;
            if core.current.is_none() || core.current == core.stopping {
                let previous = core.current.replace(starting);
                core.ticks_in_state = 0;
                Some((previous, starting))
            } else {
                None
            }
        };
        if let Some((previous, starting)) = entered {
            self.log_transition(previous, starting);
        }

        let (quit_tx, quit_rx) = oneshot::channel();
        let (paused_tx, paused_rx) = watch::channel(false);
        let (stopped_tx, stopped_rx) = watch::channel(false);
        let ticker = Ticker::new(self.shared.config.tick.clone());
        let task = tokio::spawn(tick_loop(self.clone(), ticker, quit_rx, paused_rx, stopped_tx));

        *run = Some(Run {
            quit: quit_tx,
            paused: paused_tx,
            stopped: stopped_rx,
            task,
        });
        info!(machine = %self.name(), "state machine started");
        Ok(())
    }

    /// Stops the machine.
    ///
    /// With a stopping state configured, the machine first moves there and
    /// waits until that state's action has run once. Then the tick loop is
    /// told to quit and awaited. Calling `shutdown` on a stopped machine
    /// returns `Ok(())` immediately.
    pub async fn shutdown(&self) -> Result<(), FsmError> {
        let Some(run) = self.shared.run.lock().take() else {
            debug!(machine = %self.name(), "shutdown on a stopped machine");
            return Ok(());
        };
        let Run {
            quit,
            paused,
            mut stopped,
            task,
        } = run;

        // A paused ticker would never reach the stopping action.
        paused.send_replace(false);

        let entered = {
            let mut core = self.shared.core.lock();
            match core.stopping {
                Some(stopping) => {
                    core.stop_pending = true;
                    let previous = core.current.replace(stopping);
                    if previous != Some(stopping) {
                        core.ticks_in_state = 0;
                    }
                    Some((previous, stopping))
                }
                None => None,
            }
        };
        if let Some((previous, stopping)) = entered {
            if previous != Some(stopping) {
                self.log_transition(previous, stopping);
            }
            // Errs only if the loop already exited, which the join below reports.
            let _ = stopped.wait_for(|done| *done).await;
        }

        let _ = quit.send(());
        let result = match task.await {
            Ok(result) => result,
            Err(e) => {
                warn!(machine = %self.name(), error = %e, "tick loop did not exit cleanly");
                Err(FsmError::LoopAborted(self.name().to_string()))
            }
        };
        self.shared.core.lock().stop_pending = false;
        info!(machine = %self.name(), "state machine stopped");
        result
    }

    /// Suspends ticking without losing the current state or tick counters.
    pub fn pause(&self) {
        if let Some(run) = self.shared.run.lock().as_ref() {
            run.paused.send_replace(true);
        }
    }

    /// Resumes ticking after [`pause`](Self::pause).
    pub fn resume(&self) {
        if let Some(run) = self.shared.run.lock().as_ref() {
            run.paused.send_replace(false);
        }
    }

    /// Whether the tick loop is running.
    pub fn is_running(&self) -> bool {
        self.shared.run.lock().is_some()
    }

    /// Runs one tick by hand: advances the current state's tick counter and
    /// fires its action if due.
    ///
    /// Returns the state whose action fired, if any. Serialized with the
    /// tick loop, so it's safe (if rarely useful) while the machine runs.
    pub async fn trigger(&self) -> Result<Option<K>, FsmError> {
        let (fired, result) = self.step().await;
        result.map(|()| fired)
    }

    async fn step(&self) -> (Option<K>, Result<(), FsmError>) {
        let _serialized = self.shared.step.lock().await;

        let due = {
            let mut core = self.shared.core.lock();
            let Some(current) = core.current else {
                return (None, Ok(()));
            };
            core.ticks_in_state += 1;
            let tick = core.ticks_in_state;
            match core.states.get(&current) {
                Some(state) if state.is_due(tick) => Some((current, tick, Arc::clone(&state.action))),
                _ => None,
            }
        };
        let Some((state, tick, action)) = due else {
            return (None, Ok(()));
        };

        trace!(machine = %self.name(), %state, tick, "firing action");
        let ctx = ActionContext {
            machine: self.clone(),
            state,
            tick,
        };
        let result = action(ctx).await.map_err(|source| FsmError::Action {
            state: state.to_string(),
            source,
        });
        (Some(state), result)
    }

    fn ensure_stopped(&self) -> Result<(), FsmError> {
        if self.is_running() {
            return Err(FsmError::AlreadyRunning(self.name().to_string()));
        }
        Ok(())
    }

    fn is_stopping_state(&self, name: K) -> bool {
        self.shared.core.lock().stopping == Some(name)
    }

    fn log_transition(&self, from: Option<K>, to: K) {
        let from = from.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string());
        if self.shared.trace.load(Ordering::Relaxed) {
            info!(machine = %self.name(), %from, %to, "state transition");
        } else {
            debug!(machine = %self.name(), %from, %to, "state transition");
        }
    }
}

async fn tick_loop<K: StateKey>(
    machine: StateMachine<K>,
    mut ticker: Ticker,
    mut quit: oneshot::Receiver<()>,
    mut paused: watch::Receiver<bool>,
    stopped: watch::Sender<bool>,
) -> Result<(), FsmError> {
    loop {
        tokio::select! {
            biased;
            _ = &mut quit => break,
            changed = paused.changed() => {
                if changed.is_err() {
                    break;
                }
                if *paused.borrow_and_update() {
                    ticker.pause();
                } else {
                    ticker.resume();
                }
            }
            info = ticker.wait_for_tick() => {
                if info.ticks_skipped > 0 {
                    warn!(
                        machine = %machine.name(),
                        tick = info.tick,
                        skipped = info.ticks_skipped,
                        "tick overrun, skipping ahead"
                    );
                }
                let (fired, result) = machine.step().await;
                ticker.record_tick_end();

                if let Some(state) = fired {
                    if machine.is_stopping_state(state) {
                        stopped.send_replace(true);
                    }
                }
                if let Err(e) = result {
                    if machine.shared.config.bail_on_error {
                        warn!(machine = %machine.name(), error = %e, "action failed, stopping tick loop");
                        return Err(e);
                    }
                    debug!(machine = %machine.name(), error = %e, "action failed");
                }
            }
        }
    }
    debug!(machine = %machine.name(), ticks = ticker.tick_count(), "tick loop exited");
    Ok(())
}
