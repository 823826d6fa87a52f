//! Integration tests for the state machine engine.
//!
//! Tick-loop tests run on a paused Tokio clock, so sleeping in the test
//! advances time instantly and deterministically.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tether_fsm::{BoxError, FsmError, MachineConfig, State, StateMachine};

// =========================================================================
// Helpers
// =========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Step {
    A,
    B,
    Running,
    Stopping,
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

const PERIOD: Duration = Duration::from_millis(10);

fn config() -> MachineConfig {
    MachineConfig::new("test", PERIOD)
}

/// A machine with a counting `Running` state and a counting `Stopping` state.
fn counting_machine(runs: Arc<AtomicU64>, stops: Arc<AtomicU64>) -> StateMachine<Step> {
    let m = StateMachine::new(config());
    m.register_states(
        vec![
            State::new(Step::Running, move |_| {
                let runs = Arc::clone(&runs);
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
            State::new(Step::Stopping, move |_| {
                let stops = Arc::clone(&stops);
                async move {
                    stops.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        ],
        Step::Running,
        Some(Step::Stopping),
    )
    .expect("valid registration");
    m
}

// =========================================================================
// Setup errors
// =========================================================================

#[test]
fn test_startup_without_states_fails() {
    let m = StateMachine::<Step>::new(config());
    assert!(matches!(m.startup(), Err(FsmError::NoStates(_))));
}

#[test]
fn test_startup_without_starting_state_fails() {
    let m = StateMachine::<Step>::new(config());
    m.register_state(State::idle(Step::A)).unwrap();
    m.register_state(State::idle(Step::B)).unwrap();
    assert!(matches!(m.startup(), Err(FsmError::NoStartingState(_))));
    assert!(!m.is_running());
}

#[test]
fn test_register_duplicate_state_fails() {
    let m = StateMachine::<Step>::new(config());
    m.register_state(State::idle(Step::A)).unwrap();
    assert!(matches!(
        m.register_state(State::idle(Step::A)),
        Err(FsmError::DuplicateState(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_register_while_running_fails() {
    let m = counting_machine(Arc::default(), Arc::default());
    m.startup().unwrap();
    assert!(matches!(
        m.register_state(State::idle(Step::A)),
        Err(FsmError::AlreadyRunning(_))
    ));
    m.shutdown().await.unwrap();
}

// =========================================================================
// Transitions and tick counting
// =========================================================================

#[test]
fn test_move_to_unregistered_state_changes_nothing() {
    let m = StateMachine::<Step>::new(config());
    m.register_states(vec![State::idle(Step::A)], Step::A, None).unwrap();
    assert!(m.move_to_state(Step::A));

    assert!(!m.move_to_state(Step::B));
    assert_eq!(m.current_state(), Some(Step::A));
}

#[tokio::test]
async fn test_reentering_state_resets_tick_counter() {
    let seen: Arc<Mutex<Vec<(Step, u64)>>> = Arc::default();
    let m = StateMachine::new(config());

    let seen_a = Arc::clone(&seen);
    let seen_b = Arc::clone(&seen);
    m.register_states(
        vec![
            State::new(Step::A, move |ctx| {
                seen_a.lock().push((ctx.state, ctx.tick));
                ctx.machine.move_to_state(Step::B);
                async { Ok(()) }
            }),
            State::new(Step::B, move |ctx| {
                seen_b.lock().push((ctx.state, ctx.tick));
                ctx.machine.move_to_state(Step::A);
                async { Ok(()) }
            }),
        ],
        Step::A,
        None,
    )
    .unwrap();
    assert!(m.move_to_state(Step::A));

    for _ in 0..3 {
        m.trigger().await.unwrap();
    }

    assert_eq!(*seen.lock(), vec![(Step::A, 1), (Step::B, 1), (Step::A, 1)]);
}

#[tokio::test]
async fn test_tick_skip_counts_from_state_entry() {
    let fired = Arc::new(AtomicU64::new(0));
    let m = StateMachine::new(config());
    let counter = Arc::clone(&fired);
    m.register_states(
        vec![
            State::new(Step::A, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .with_ticks(3),
            State::idle(Step::B),
        ],
        Step::A,
        None,
    )
    .unwrap();
    m.move_to_state(Step::A);

    // Two ticks in, then leave and come back: the count starts over.
    assert_eq!(m.trigger().await.unwrap(), None);
    assert_eq!(m.trigger().await.unwrap(), None);
    m.move_to_state(Step::B);
    m.move_to_state(Step::A);
    assert_eq!(m.ticks_in_state(), 0);

    assert_eq!(m.trigger().await.unwrap(), None);
    assert_eq!(m.trigger().await.unwrap(), None);
    assert_eq!(m.trigger().await.unwrap(), Some(Step::A));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_trigger_reports_action_error() {
    let m = StateMachine::new(config());
    m.register_states(
        vec![State::new(Step::A, |_| async {
            Err::<(), BoxError>("boom".into())
        })],
        Step::A,
        None,
    )
    .unwrap();
    m.move_to_state(Step::A);

    let err = m.trigger().await.unwrap_err();
    assert!(matches!(err, FsmError::Action { ref state, .. } if state == "A"));
}

// =========================================================================
// Tick loop lifecycle
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_startup_enters_starting_state_and_ticks() {
    let runs = Arc::new(AtomicU64::new(0));
    let m = counting_machine(Arc::clone(&runs), Arc::default());

    m.startup().unwrap();
    assert_eq!(m.current_state(), Some(Step::Running));

    tokio::time::sleep(PERIOD * 5 + PERIOD / 2).await;
    assert_eq!(runs.load(Ordering::SeqCst), 5);

    m.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_startup_twice_fails() {
    let m = counting_machine(Arc::default(), Arc::default());
    m.startup().unwrap();
    assert!(matches!(m.startup(), Err(FsmError::AlreadyRunning(_))));
    m.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_runs_stopping_action_once() {
    let stops = Arc::new(AtomicU64::new(0));
    let m = counting_machine(Arc::default(), Arc::clone(&stops));
    m.startup().unwrap();
    tokio::time::sleep(PERIOD * 2).await;

    m.shutdown().await.unwrap();

    assert_eq!(stops.load(Ordering::SeqCst), 1);
    assert_eq!(m.current_state(), Some(Step::Stopping));
    assert!(!m.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_double_shutdown_then_startup_resumes_ticking() {
    let runs = Arc::new(AtomicU64::new(0));
    let stops = Arc::new(AtomicU64::new(0));
    let m = counting_machine(Arc::clone(&runs), Arc::clone(&stops));

    m.startup().unwrap();
    tokio::time::sleep(PERIOD * 3).await;
    m.shutdown().await.unwrap();
    m.shutdown().await.unwrap();
    assert_eq!(stops.load(Ordering::SeqCst), 1);

    let before = runs.load(Ordering::SeqCst);
    m.startup().unwrap();
    assert_eq!(m.current_state(), Some(Step::Running));
    tokio::time::sleep(PERIOD * 3 + PERIOD / 2).await;
    assert_eq!(runs.load(Ordering::SeqCst), before + 3);

    m.shutdown().await.unwrap();
    assert_eq!(stops.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_during_slow_action_is_not_overridden() {
    let stops = Arc::new(AtomicU64::new(0));
    let counted = Arc::clone(&stops);
    let m = StateMachine::new(config());
    m.register_states(
        vec![
            State::new(Step::A, |ctx| async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                ctx.machine.move_to_state(Step::B);
                Ok(())
            }),
            State::idle(Step::B),
            State::new(Step::Stopping, move |_| {
                let stops = Arc::clone(&counted);
                async move {
                    stops.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        ],
        Step::A,
        Some(Step::Stopping),
    )
    .unwrap();

    m.startup().unwrap();
    // First tick lands at 10ms; A is now mid-sleep.
    tokio::time::sleep(Duration::from_millis(15)).await;

    tokio::time::timeout(Duration::from_secs(60), m.shutdown())
        .await
        .expect("shutdown finished")
        .unwrap();

    assert_eq!(stops.load(Ordering::SeqCst), 1);
    assert_eq!(m.current_state(), Some(Step::Stopping));
    // Once stopped, transitions are allowed again.
    assert!(m.move_to_state(Step::B));
}

#[tokio::test(start_paused = true)]
async fn test_move_away_from_stopping_is_rejected_while_shutting_down() {
    let m = StateMachine::new(config());
    let gate = Arc::new(tokio::sync::Notify::new());
    let released = Arc::clone(&gate);
    m.register_states(
        vec![
            State::idle(Step::Running),
            State::new(Step::Stopping, move |ctx| {
                let released = Arc::clone(&released);
                async move {
                    // Someone else tries to restart the machine mid-stop.
                    assert!(!ctx.machine.move_to_state(Step::Running));
                    released.notify_one();
                    Ok(())
                }
            }),
        ],
        Step::Running,
        Some(Step::Stopping),
    )
    .unwrap();
    m.startup().unwrap();

    m.shutdown().await.unwrap();
    gate.notified().await;

    assert_eq!(m.current_state(), Some(Step::Stopping));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_on_never_started_machine_is_noop() {
    let m = counting_machine(Arc::default(), Arc::default());
    m.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_pause_and_resume_keep_state() {
    let runs = Arc::new(AtomicU64::new(0));
    let m = counting_machine(Arc::clone(&runs), Arc::default());
    m.startup().unwrap();
    tokio::time::sleep(PERIOD * 2 + PERIOD / 2).await;

    m.pause();
    let paused_at = runs.load(Ordering::SeqCst);
    tokio::time::sleep(PERIOD * 50).await;
    assert_eq!(runs.load(Ordering::SeqCst), paused_at);
    assert_eq!(m.current_state(), Some(Step::Running));

    m.resume();
    tokio::time::sleep(PERIOD * 2 + PERIOD / 2).await;
    assert_eq!(runs.load(Ordering::SeqCst), paused_at + 2);

    m.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_while_paused_still_stops() {
    let stops = Arc::new(AtomicU64::new(0));
    let m = counting_machine(Arc::default(), Arc::clone(&stops));
    m.startup().unwrap();
    m.pause();

    m.shutdown().await.unwrap();
    assert_eq!(stops.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failing_action_is_retried_next_tick() {
    let attempts = Arc::new(AtomicU64::new(0));
    let m = StateMachine::new(config());
    let counter = Arc::clone(&attempts);
    m.register_states(
        vec![State::new(Step::A, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), BoxError>("transient".into()) }
        })],
        Step::A,
        None,
    )
    .unwrap();

    m.startup().unwrap();
    tokio::time::sleep(PERIOD * 4 + PERIOD / 2).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 4);
    m.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_bail_on_error_stops_loop() {
    let attempts = Arc::new(AtomicU64::new(0));
    let m = StateMachine::new(MachineConfig {
        bail_on_error: true,
        ..config()
    });
    let counter = Arc::clone(&attempts);
    m.register_states(
        vec![State::new(Step::A, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), BoxError>("fatal".into()) }
        })],
        Step::A,
        None,
    )
    .unwrap();

    m.startup().unwrap();
    tokio::time::sleep(PERIOD * 4 + PERIOD / 2).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 1);

    let result = m.shutdown().await;
    assert!(matches!(result, Err(FsmError::Action { .. })));
    // The machine is stopped and a second shutdown is a no-op.
    m.shutdown().await.unwrap();
}
