use cqloop::source::{AlarmKey, CompletionQueue, CompletionSource, Deadline, NextEvent, Tag};
use cqloop::{Engine, Error, OperationResult};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Increments a counter when dropped.
struct DropCounter(Arc<AtomicUsize>);

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// A completion queue that counts the wake-up alarms armed on it.
#[derive(Default)]
struct CountingSource {
    inner: CompletionQueue,
    wake_alarms: AtomicUsize,
}

impl CompletionSource for CountingSource {
    fn next(&self, deadline: Deadline) -> NextEvent {
        self.inner.next(deadline)
    }

    fn set_alarm(&self, deadline: Deadline, tag: Tag) -> AlarmKey {
        if tag == Tag::WAKE {
            self.wake_alarms.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.set_alarm(deadline, tag)
    }

    fn cancel_alarm(&self, key: AlarmKey) -> bool {
        self.inner.cancel_alarm(key)
    }

    fn post(&self, tag: Tag, ok: bool) {
        self.inner.post(tag, ok)
    }

    fn shutdown(&self) {
        self.inner.shutdown()
    }
}

#[test]
fn teardown_completes_pending_external_operations() {
    let engine = Engine::new();
    let source = engine.completion_source().clone();
    let results = Arc::new(Mutex::new(Vec::new()));
    let drops = Arc::new(AtomicUsize::new(0));

    for _ in 0..2 {
        let source = source.clone();
        let results = results.clone();
        let counter = DropCounter(drops.clone());

        engine
            .register_external_completion(
                move |tag| {
                    source.set_alarm(Deadline::after(Duration::from_secs(3600)), tag);
                },
                move |result| {
                    let _counter = counter;
                    results.lock().unwrap().push(result);
                },
            )
            .unwrap();
    }

    assert_eq!(engine.outstanding_work(), 2);
    drop(engine);

    assert_eq!(
        *results.lock().unwrap(),
        vec![OperationResult::ShutdownNotOk, OperationResult::ShutdownNotOk]
    );
    assert_eq!(drops.load(Ordering::SeqCst), 2);
}

#[test]
fn teardown_drops_queued_work_without_running_it() {
    let engine = Engine::new();
    let ran = Arc::new(AtomicBool::new(false));
    let drops = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        let ran = ran.clone();
        let counter = DropCounter(drops.clone());

        engine.execute(move || {
            let _counter = counter;
            ran.store(true, Ordering::SeqCst);
        });
    }

    drop(engine);

    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(drops.load(Ordering::SeqCst), 3);
}

#[test]
fn successful_events_during_teardown_report_shutdown_ok() {
    let engine = Engine::new();
    let source = engine.completion_source().clone();
    let result = Arc::new(Mutex::new(None));

    {
        let result = result.clone();
        engine
            .register_external_completion(
                move |tag| source.post(tag, true),
                move |outcome| *result.lock().unwrap() = Some(outcome),
            )
            .unwrap();
    }

    drop(engine);
    assert_eq!(*result.lock().unwrap(), Some(OperationResult::ShutdownOk));
}

#[test]
fn executor_outliving_the_engine_rejects_work() {
    let engine = Engine::new();
    let executor = engine.executor();
    drop(engine);

    let drops = Arc::new(AtomicUsize::new(0));
    let counter = DropCounter(drops.clone());
    executor.execute(move || {
        let _counter = counter;
        panic!("must not run after teardown");
    });
    assert_eq!(drops.load(Ordering::SeqCst), 1);

    let initiated = Arc::new(AtomicBool::new(false));
    let flag = initiated.clone();
    let registered = executor.register_external_completion(
        move |_| flag.store(true, Ordering::SeqCst),
        |_| panic!("must not complete after teardown"),
    );

    assert_eq!(registered, Err(Error::Shutdown));
    assert!(!initiated.load(Ordering::SeqCst));

    let handle = executor.spawn(async { 1 });
    assert!(handle.is_finished());
}

#[test]
fn handlers_cannot_register_new_work_while_draining() {
    let engine = Engine::new();
    let executor = engine.executor();
    let source = engine.completion_source().clone();
    let rejected = Arc::new(Mutex::new(None));

    {
        let rejected = rejected.clone();
        engine
            .register_external_completion(
                move |tag| {
                    source.set_alarm(Deadline::Forever, tag);
                },
                move |result| {
                    assert!(result.is_shutdown());

                    let source = executor.completion_source().clone();
                    let outcome = executor.register_external_completion(
                        move |tag| source.post(tag, true),
                        |_| {},
                    );
                    *rejected.lock().unwrap() = Some(outcome);
                },
            )
            .unwrap();
    }

    drop(engine);
    assert_eq!(*rejected.lock().unwrap(), Some(Err(Error::Shutdown)));
}

#[test]
fn concurrent_stops_arm_at_most_one_wake_up() {
    let source = Arc::new(CountingSource::default());
    let engine = Engine::builder().completion_source(source.clone()).build();

    engine.work_started();

    thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| engine.stop());
        }
    });

    assert!(engine.is_stopped());
    assert_eq!(source.wake_alarms.load(Ordering::SeqCst), 1);

    engine.stop();
    assert_eq!(source.wake_alarms.load(Ordering::SeqCst), 1);

    engine.work_finished();
}

#[test]
fn stop_from_another_thread_unblocks_run() {
    let engine = Engine::new();
    engine.work_started();

    thread::scope(|s| {
        s.spawn(|| {
            thread::sleep(Duration::from_millis(20));
            engine.stop();
            engine.stop();
        });

        engine.run();
    });

    assert!(engine.is_stopped());
    assert_eq!(engine.outstanding_work(), 1);
    engine.work_finished();
}

#[test]
fn engine_drop_shuts_the_source_down() {
    let source = Arc::new(CompletionQueue::new());
    let engine = Engine::builder().completion_source(source.clone()).build();

    engine.work_started();
    drop(engine);

    assert!(source.is_shutdown());
    assert_eq!(source.armed_alarms(), 0);
}
