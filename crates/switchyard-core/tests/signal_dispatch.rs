//! End-to-end behaviour of signals, dispatchers and the event bus.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;
use switchyard_core::{
    ConnectionType, DispatchError, DispatchQueue, Dispatcher, EventBus, LoopDispatcher, Signal,
    SlotError, SlotFailure, Subscriber, Task, WorkerDispatcher,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn explode(_: &()) -> i32 {
    panic!("slot failed on purpose");
}

/// Collect the failures reported on `signal` as display strings.
fn capture_failures(signal: &Signal<SlotFailure>) -> Arc<Mutex<Vec<String>>> {
    let failures = Arc::new(Mutex::new(Vec::new()));
    let failures_clone = failures.clone();
    signal.connect(move |failure: &SlotFailure| {
        failures_clone.lock().push(failure.error().to_string());
    });
    failures
}

#[test]
fn connect_then_disconnect_restores_count() {
    let signal = Signal::<i32>::new();
    let before = signal.connection_count();

    let id = signal.connect(|_| {});
    assert_eq!(signal.connection_count(), before + 1);

    assert!(signal.disconnect(id));
    assert_eq!(signal.connection_count(), before);
}

#[test]
fn direct_slots_run_in_connection_order() {
    let signal = Signal::<i32>::new();
    let log = Arc::new(Mutex::new(Vec::new()));

    for _ in 0..2 {
        let log = log.clone();
        signal.connect_with_type(move |&value| log.lock().push(value), ConnectionType::Direct);
    }

    assert_eq!(signal.emit(5).unwrap(), None);
    assert_eq!(*log.lock(), vec![5, 5]);
}

#[test]
fn queued_calls_drain_in_fifo_order() {
    init_tracing();
    let dispatcher = Arc::new(LoopDispatcher::new());
    let signal = Signal::<()>::new();
    let log = Arc::new(Mutex::new(Vec::new()));

    for label in ["A", "B", "C"] {
        let log = log.clone();
        signal.connect_to(move |_| log.lock().push(label), dispatcher.clone(), ConnectionType::Queued);
    }

    signal.emit(()).unwrap();
    assert!(log.lock().is_empty());
    assert_eq!(dispatcher.queue().pending_count(), 3);

    assert!(dispatcher.pump_one());
    assert!(dispatcher.pump_one());
    assert!(dispatcher.pump_one());
    assert!(!dispatcher.pump_one());
    assert_eq!(*log.lock(), vec!["A", "B", "C"]);
}

#[test]
fn blocking_queued_returns_slot_value() {
    init_tracing();
    let worker = Arc::new(WorkerDispatcher::new().unwrap());
    let signal = Signal::<(), i32>::returning();

    let ran_on_worker = Arc::new(AtomicBool::new(false));
    let ran_clone = ran_on_worker.clone();
    let probe = worker.clone();
    signal.connect_to(
        move |_| {
            ran_clone.store(probe.is_current_dispatch_thread(), Ordering::SeqCst);
            42
        },
        worker.clone(),
        ConnectionType::BlockingQueued,
    );

    assert_eq!(signal.emit(()).unwrap(), Some(42));
    assert!(ran_on_worker.load(Ordering::SeqCst));
    worker.shutdown_and_join();
}

#[test]
fn queued_on_returning_signal_blocks_until_slot_ran() {
    let worker = Arc::new(WorkerDispatcher::new().unwrap());
    let signal = Signal::<u64, u64>::returning();

    signal.connect_to(
        |&millis| {
            thread::sleep(Duration::from_millis(millis));
            millis * 2
        },
        worker.clone(),
        ConnectionType::Queued,
    );

    assert_eq!(signal.emit(20).unwrap(), Some(40));
    assert_eq!(worker.pending_calls(), 0);
    worker.shutdown_and_join();
}

#[test]
fn auto_is_direct_on_dispatch_thread_and_queued_elsewhere() {
    let dispatcher = Arc::new(LoopDispatcher::new());
    let signal = Arc::new(Signal::<&'static str>::new());
    let log = Arc::new(Mutex::new(Vec::new()));

    let log_clone = log.clone();
    signal.connect_to(move |&origin| log_clone.lock().push(origin), dispatcher.clone(), ConnectionType::Auto);

    signal.emit("owner").unwrap();
    assert_eq!(*log.lock(), vec!["owner"]);
    assert_eq!(dispatcher.queue().pending_count(), 0);

    let remote = signal.clone();
    thread::spawn(move || remote.emit("other").unwrap()).join().unwrap();
    assert_eq!(*log.lock(), vec!["owner"]);
    assert_eq!(dispatcher.queue().pending_count(), 1);

    dispatcher.pump();
    assert_eq!(*log.lock(), vec!["owner", "other"]);
}

#[test]
fn register_twice_delivers_once() {
    let bus = EventBus::new();
    let count = Arc::new(AtomicUsize::new(0));

    let count_clone = count.clone();
    let subscriber = Subscriber::builder()
        .on::<u32>(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        })
        .build();

    bus.register(&subscriber);
    bus.register(&subscriber);
    bus.post(1u32).unwrap();

    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn failing_subscriber_does_not_block_others() {
    init_tracing();
    let bus = EventBus::new();
    let failures = capture_failures(bus.on_exception());
    let delivered = Arc::new(AtomicBool::new(false));

    let thrower = Subscriber::builder()
        .name("thrower")
        .try_on::<String>(|_| Err(SlotError::msg("cannot handle")))
        .build();
    let delivered_clone = delivered.clone();
    let listener = Subscriber::builder()
        .name("listener")
        .on::<String>(move |_| delivered_clone.store(true, Ordering::SeqCst))
        .build();

    bus.register(&thrower);
    bus.register(&listener);
    bus.post("hello".to_string()).unwrap();

    assert!(delivered.load(Ordering::SeqCst));
    assert_eq!(*failures.lock(), vec!["cannot handle"]);
}

#[test]
fn panicking_subscriber_on_worker_is_reported_once() {
    let worker = Arc::new(WorkerDispatcher::new().unwrap());
    let bus = EventBus::new();
    let failures = capture_failures(bus.on_exception());
    let delivered = Arc::new(AtomicUsize::new(0));

    let thrower = Subscriber::builder()
        .on::<u8>(|_| panic!("handler panicked"))
        .build();
    let delivered_clone = delivered.clone();
    let listener = Subscriber::builder()
        .on::<u8>(move |_| {
            delivered_clone.fetch_add(1, Ordering::SeqCst);
        })
        .build();

    bus.register_on(&thrower, worker.clone(), ConnectionType::Queued);
    bus.register_on(&listener, worker.clone(), ConnectionType::Queued);
    bus.post(7u8).unwrap();
    worker.shutdown_and_join();

    assert_eq!(delivered.load(Ordering::SeqCst), 1);
    let failures = failures.lock();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].contains("handler panicked"));
}

#[test]
fn disconnect_while_queued_skips_the_call() {
    let dispatcher = Arc::new(LoopDispatcher::new());
    let signal = Signal::<i32>::new();
    let log = Arc::new(Mutex::new(Vec::new()));

    let log_clone = log.clone();
    let id = signal.connect_to(move |&value| log_clone.lock().push(value), dispatcher.clone(), ConnectionType::Queued);

    signal.emit(1).unwrap();
    assert!(signal.disconnect(id));

    // The pump cycle still happens, but the call is skipped.
    assert_eq!(dispatcher.pump(), 1);
    assert!(log.lock().is_empty());
}

#[test]
fn shut_down_dispatcher_rejects_work() {
    let worker = Arc::new(WorkerDispatcher::new().unwrap());
    let signal = Signal::<i32>::new();
    signal.connect_to(|_| {}, worker.clone(), ConnectionType::Queued);

    let bus = EventBus::new();
    let subscriber = Subscriber::builder().on::<i32>(|_| {}).build();
    bus.register_on(&subscriber, worker.clone(), ConnectionType::Queued);

    worker.shutdown_and_join();

    assert!(matches!(worker.invoke_later(Box::new(|| {})), Err(DispatchError::ShutDown)));
    assert!(matches!(signal.emit(1), Err(DispatchError::ShutDown)));
    assert!(matches!(bus.post(1i32), Err(DispatchError::ShutDown)));
}

#[test]
fn blocking_emit_from_own_dispatch_thread_does_not_deadlock() {
    let worker = Arc::new(WorkerDispatcher::new().unwrap());
    let signal = Arc::new(Signal::<(), i32>::returning());
    signal.connect_to(|_| 7, worker.clone(), ConnectionType::BlockingQueued);

    let (tx, rx) = crossbeam_channel::bounded(1);
    let inner = signal.clone();
    worker
        .invoke_later(Box::new(move || {
            let _ = tx.send(inner.emit(()));
        }))
        .unwrap();

    let result = rx.recv_timeout(Duration::from_secs(5)).expect("emit on the worker deadlocked");
    assert_eq!(result.unwrap(), Some(7));
    worker.shutdown_and_join();
}

#[test]
fn failure_in_blocking_call_releases_emitter() {
    let worker = Arc::new(WorkerDispatcher::new().unwrap());
    let failures = capture_failures(worker.on_exception());

    let signal = Signal::<(), i32>::returning();
    signal.connect_to(explode, worker.clone(), ConnectionType::BlockingQueued);

    assert_eq!(signal.emit(()).unwrap(), None);
    worker.shutdown_and_join();

    let failures = failures.lock();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].contains("slot failed on purpose"));
}

#[test]
fn concurrent_blocking_emitters_each_get_their_own_value() {
    let worker = Arc::new(WorkerDispatcher::new().unwrap());
    let signal = Arc::new(Signal::<u64, u64>::returning());

    signal.connect_to(
        |&n| {
            thread::sleep(Duration::from_millis(n % 3));
            n * 10
        },
        worker.clone(),
        ConnectionType::BlockingQueued,
    );

    let emitters: Vec<_> = (0..8u64)
        .map(|n| {
            let signal = signal.clone();
            thread::spawn(move || (n, signal.emit(n).unwrap()))
        })
        .collect();

    for emitter in emitters {
        let (n, value) = emitter.join().unwrap();
        assert_eq!(value, Some(n * 10));
    }
    worker.shutdown_and_join();
}

#[test]
fn loop_dispatcher_shutdown_releases_blocked_emitter() {
    let dispatcher = Arc::new(LoopDispatcher::new());
    let signal = Arc::new(Signal::<(), i32>::returning());
    signal.connect_to(|_| 1, dispatcher.clone(), ConnectionType::BlockingQueued);

    let remote = signal.clone();
    let emitter = thread::spawn(move || remote.emit(()));

    // Wait for the pump task to be scheduled, then drop everything.
    while dispatcher.pending_tasks() == 0 {
        thread::sleep(Duration::from_millis(1));
    }
    dispatcher.shutdown();

    assert_eq!(emitter.join().unwrap().unwrap(), None);
}

type BeforeRefusal = Box<dyn FnOnce(&ScriptedDispatcher) + Send>;

/// A dispatcher that holds tasks until told to run them, and can refuse one
/// pump after letting other work through first.
#[derive(Default)]
struct ScriptedDispatcher {
    tasks: Mutex<Vec<Task>>,
    refuse_next: Mutex<Option<BeforeRefusal>>,
    queue: DispatchQueue,
}

impl ScriptedDispatcher {
    fn run_accepted(&self) {
        let tasks: Vec<Task> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task();
        }
    }
}

impl Dispatcher for ScriptedDispatcher {
    fn is_dispatch_thread(&self, _thread: ThreadId) -> bool {
        false
    }

    fn invoke_later(&self, task: Task) -> Result<(), DispatchError> {
        let refusal = self.refuse_next.lock().take();
        match refusal {
            Some(before) => {
                before(self);
                Err(DispatchError::QueueFull)
            }
            None => {
                self.tasks.lock().push(task);
                Ok(())
            }
        }
    }

    fn queue(&self) -> &DispatchQueue {
        &self.queue
    }
}

#[test]
fn refused_pump_does_not_run_or_strand_other_calls() {
    let dispatcher = Arc::new(ScriptedDispatcher::default());
    let log = Arc::new(Mutex::new(Vec::new()));

    let refused = Signal::<()>::new();
    let log_clone = log.clone();
    refused.connect_to(move |_| log_clone.lock().push("A"), dispatcher.clone(), ConnectionType::Queued);

    let accepted = Arc::new(Signal::<()>::new());
    let log_clone = log.clone();
    accepted.connect_to(move |_| log_clone.lock().push("B"), dispatcher.clone(), ConnectionType::Queued);

    // While A's pump is being refused, B is queued and its pump runs.
    let other = accepted.clone();
    *dispatcher.refuse_next.lock() = Some(Box::new(move |dispatcher: &ScriptedDispatcher| {
        other.emit(()).unwrap();
        dispatcher.run_accepted();
    }));

    assert!(matches!(refused.emit(()), Err(DispatchError::QueueFull)));
    assert_eq!(*log.lock(), vec!["B"]);
    assert_eq!(dispatcher.queue().pending_count(), 0);
    assert!(dispatcher.tasks.lock().is_empty());
}
