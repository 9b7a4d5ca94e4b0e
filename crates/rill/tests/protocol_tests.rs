//! Protocol-level properties observed through whole pipelines.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rill::prelude::*;
use rill_test_utils::{CollectingSubscriber, CountingDispatcher, ManualProducer};

fn wait_until(timeout: Duration, done: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while !done() {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    true
}

#[test]
fn emission_never_exceeds_requested_demand() {
    let env = Environment::with_defaults();
    let sink = CollectingSubscriber::with_demand(4);
    streams::range(&env, 0, 10_000)
        .map(|v| v * 2)
        .filter(|v| v % 4 == 0)
        .subscribe(sink.clone_as_subscriber());

    assert_eq!(sink.value_count(), 4);
    sink.request(3);
    assert_eq!(sink.value_count(), 7);
    env.shutdown(Duration::from_secs(2));
}

#[test]
fn exactly_one_terminal_per_edge() {
    let env = Environment::with_defaults();
    let (broadcaster, stream) = streams::broadcast::<i32>(&env);
    let sink = CollectingSubscriber::unbounded();
    stream.map(|v| v + 1).subscribe(sink.clone_as_subscriber());

    broadcaster.broadcast_next(1);
    broadcaster.broadcast_complete();
    // A non-conformant producer keeps pushing; nothing more may be
    // observed downstream.
    broadcaster.broadcast_next(2);
    broadcaster.broadcast_error(StreamError::IllegalArgument("late".into()));
    broadcaster.broadcast_complete();

    assert_eq!(sink.values(), vec![2]);
    assert_eq!(sink.completions(), 1);
    assert!(sink.errors().is_empty());
    env.shutdown(Duration::from_secs(2));
}

#[test]
fn no_next_after_terminal_across_a_boundary() {
    let env = Environment::with_defaults();
    let pool = env.dispatcher("work").expect("work pool registered");
    let (broadcaster, stream) = streams::broadcast::<i32>(&env);
    let sink = CollectingSubscriber::unbounded();
    stream
        .dispatch_on(pool)
        .subscribe(sink.clone_as_subscriber());

    for i in 0..100 {
        broadcaster.broadcast_next(i);
    }
    broadcaster.broadcast_complete();

    assert!(sink.await_terminal(Duration::from_secs(10)));
    // The terminal was enqueued behind all 100 values on the same
    // dispatcher, so every value precedes it.
    assert_eq!(sink.value_count(), 100);
    env.shutdown(Duration::from_secs(5));
}

#[test]
fn cancellation_stops_delivery_promptly() {
    let env = Environment::with_defaults();
    let count = Arc::new(AtomicUsize::new(0));
    let count_in = Arc::clone(&count);

    let (broadcaster, stream) = streams::broadcast::<i32>(&env);
    let control = stream.consume(move |_v| {
        count_in.fetch_add(1, Ordering::AcqRel);
    });

    broadcaster.broadcast_next(1);
    broadcaster.broadcast_next(2);
    control.cancel();
    let seen_at_cancel = count.load(Ordering::Acquire);
    broadcaster.broadcast_next(3);
    broadcaster.broadcast_next(4);

    // At most one additional in-flight delivery after cancel.
    assert!(count.load(Ordering::Acquire) <= seen_at_cancel + 1);
    env.shutdown(Duration::from_secs(2));
}

#[test]
fn ordered_boundary_preserves_per_edge_order() {
    let env = Environment::with_defaults();
    let shared = env.dispatcher("shared").expect("shared registered");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_in = Arc::clone(&seen);

    let sink = CollectingSubscriber::unbounded();
    streams::range(&env, 0, 1_000)
        .dispatch_on(shared)
        .observe(move |v| seen_in.lock().unwrap().push(*v))
        .subscribe(sink.clone_as_subscriber());

    assert!(sink.await_terminal(Duration::from_secs(10)));
    assert_eq!(*seen.lock().unwrap(), (0..1_000).collect::<Vec<_>>());
    env.shutdown(Duration::from_secs(5));
}

#[test]
fn moving_window_snapshots_the_most_recent_backlog() {
    let mut config = EnvironmentConfig::default();
    config.timer_resolution = Duration::from_millis(5);
    let env = Environment::new(config).expect("config valid");

    let (broadcaster, stream) = streams::broadcast::<i64>(&env);
    let windows = Arc::new(Mutex::new(Vec::new()));
    let windows_in = Arc::clone(&windows);
    stream
        .moving_window(Duration::from_millis(40), Duration::ZERO, 5)
        .consume(move |w| windows_in.lock().unwrap().push(w));

    for v in 0..20 {
        broadcaster.broadcast_next(v);
    }
    assert!(wait_until(Duration::from_secs(5), || !windows
        .lock()
        .unwrap()
        .is_empty()));

    let first = windows.lock().unwrap()[0].clone();
    assert_eq!(first.len(), 5);
    // The snapshot is the five most recent arrivals, in arrival order.
    assert_eq!(first, vec![15, 16, 17, 18, 19]);
    env.shutdown(Duration::from_secs(2));
}

#[test]
fn filter_re_credits_dropped_values_upstream() {
    let env = Environment::with_defaults();
    let producer = ManualProducer::<i64>::new();
    let sink = CollectingSubscriber::with_demand(2);
    Stream::from_publisher(&env, Arc::clone(&producer) as Arc<dyn Publisher<i64>>)
        .filter(|v| v % 2 == 0)
        .subscribe(sink.clone_as_subscriber());

    // The downstream demand of 2 is forwarded as-is.
    assert_eq!(producer.requested(), 2);

    // A discarded value costs the downstream nothing; the operator
    // replaces the spent credit upstream.
    producer.next(1);
    assert_eq!(producer.requested(), 3);

    producer.next(2);
    producer.next(4);
    assert_eq!(sink.values(), vec![2, 4]);

    // No credit left: the value parks until the next request.
    producer.next(6);
    assert_eq!(sink.values(), vec![2, 4]);
    sink.request(1);
    assert_eq!(sink.values(), vec![2, 4, 6]);
    assert_eq!(producer.requested(), 4);

    producer.complete();
    assert_eq!(sink.completions(), 1);
    env.shutdown(Duration::from_secs(2));
}

#[test]
fn boundary_submits_one_task_per_value() {
    let env = Environment::with_defaults();
    let counting = CountingDispatcher::wrap(env.dispatcher("shared").expect("shared registered"));
    let sink = CollectingSubscriber::unbounded();
    streams::range(&env, 0, 50)
        .dispatch_on(Arc::clone(&counting) as Arc<dyn Dispatcher>)
        .subscribe(sink.clone_as_subscriber());

    assert!(sink.await_terminal(Duration::from_secs(10)));
    assert_eq!(sink.value_count(), 50);
    // Every value crossed as its own task; the terminal flushes after
    // the last in-flight task rather than as a submission of its own.
    assert_eq!(counting.submissions(), 50);
    env.shutdown(Duration::from_secs(5));
}

#[test]
fn overflow_policy_surfaces_as_an_error() {
    let env = Environment::with_defaults();
    let broadcaster = rill::operators::Broadcaster::<i32>::with_capacity(
        8,
        rill::core::OverflowAction::Error,
    );
    let sink = CollectingSubscriber::manual();
    let stream = Stream::from_publisher(
        &env,
        Arc::clone(&broadcaster) as Arc<dyn Publisher<i32>>,
    );
    stream.subscribe(sink.clone_as_subscriber());

    // No demand: the edge queue fills and then overflows.
    for i in 0..100 {
        broadcaster.broadcast_next(i);
    }
    let errors = sink.errors();
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], StreamError::Overflow { .. }));
    env.shutdown(Duration::from_secs(2));
}
