use cqloop::{Engine, yield_now};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

fn fail(message: &'static str) -> u32 {
    panic!("{message}")
}

#[test]
fn block_on_returns_the_output() {
    let engine = Engine::new();
    let output = engine.block_on(async { 40 + 2 });

    assert_eq!(output.unwrap(), 42);
    assert_eq!(engine.outstanding_work(), 0);
}

#[test]
fn spawned_task_can_be_joined() {
    let engine = Engine::new();
    let executor = engine.executor();

    let output = engine.block_on(async move {
        let handle = executor.spawn(async {
            yield_now().await;
            21
        });

        handle.await.unwrap() * 2
    });

    assert_eq!(output.unwrap(), 42);
}

#[test]
fn run_waits_for_spawned_tasks() {
    let engine = Engine::new();
    let done = Arc::new(AtomicUsize::new(0));

    for _ in 0..4 {
        let done = done.clone();
        let handle = engine.spawn(async move {
            yield_now().await;
            done.fetch_add(1, Ordering::SeqCst);
        });

        // Dropping the handle detaches the task.
        drop(handle);
    }

    assert_eq!(engine.outstanding_work(), 4);
    assert!(engine.run());
    assert_eq!(done.load(Ordering::SeqCst), 4);
}

#[test]
fn yielding_tasks_interleave() {
    let engine = Engine::new();
    let trace = Arc::new(Mutex::new(Vec::new()));

    for name in ["a", "b"] {
        let trace = trace.clone();
        engine.spawn(async move {
            trace.lock().unwrap().push(format!("{name}0"));
            yield_now().await;
            trace.lock().unwrap().push(format!("{name}1"));
        });
    }

    assert!(engine.run());
    assert_eq!(*trace.lock().unwrap(), vec!["a0", "b0", "a1", "b1"]);
}

#[test]
fn panicking_task_reports_the_payload() {
    let engine = Engine::new();

    let outcome = engine.block_on(async { fail("task failure") });

    let error = outcome.unwrap_err();
    assert!(error.is_panic());
    assert!(!error.is_cancelled());

    let payload = error.into_panic().expect("panicked task carries a payload");
    assert_eq!(payload.downcast_ref::<String>().map(String::as_str), Some("task failure"));

    // The engine keeps working afterwards.
    assert_eq!(engine.block_on(async { 1 }).unwrap(), 1);
}

#[test]
fn aborted_task_never_runs() {
    let engine = Engine::new();
    let ran = Arc::new(AtomicBool::new(false));

    let handle = {
        let ran = ran.clone();
        engine.spawn(async move {
            ran.store(true, Ordering::SeqCst);
        })
    };

    handle.abort();
    assert!(handle.is_finished());

    let outcome = engine.block_on(handle).unwrap();
    assert!(outcome.unwrap_err().is_cancelled());
    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(engine.outstanding_work(), 0);
}

#[test]
fn aborting_a_pending_task_releases_the_loop() {
    let engine = Engine::new();
    let executor = engine.executor();

    let handle = engine.spawn(std::future::pending::<()>());

    engine.execute(move || {
        assert!(executor.running_in_this_thread());
    });

    // The pending task keeps work outstanding until it is aborted.
    assert!(engine.poll());
    assert_eq!(engine.outstanding_work(), 1);
    assert!(!handle.is_finished());

    handle.abort();
    assert!(handle.is_finished());
    assert_eq!(engine.outstanding_work(), 0);
}

#[test]
fn abort_after_completion_keeps_the_output() {
    let engine = Engine::new();
    let handle = engine.spawn(async { 5 });

    assert!(engine.run());
    assert!(handle.is_finished());

    handle.abort();

    let output = engine.block_on(handle).unwrap();
    assert_eq!(output.unwrap(), 5);
}

#[test]
fn run_while_stops_on_the_condition() {
    let engine = Engine::new();
    let ticks = Arc::new(AtomicUsize::new(0));

    let handle = {
        let ticks = ticks.clone();
        engine.spawn(async move {
            for _ in 0..usize::MAX {
                ticks.fetch_add(1, Ordering::SeqCst);
                yield_now().await;
            }
        })
    };

    let observed = ticks.clone();
    assert!(engine.run_while(|| observed.load(Ordering::SeqCst) < 10));
    assert!(ticks.load(Ordering::SeqCst) >= 10);
    assert!(!handle.is_finished());

    // Teardown cancels the task.
    drop(engine);
    assert!(handle.is_finished());
}

#[test]
fn joining_a_panicked_task_from_another_task() {
    let engine = Engine::new();
    let executor = engine.executor();

    let output = engine.block_on(async move {
        let failing = executor.spawn(async {
            yield_now().await;
            fail("inner failure")
        });

        failing.await.is_err()
    });

    assert!(output.unwrap());
}
