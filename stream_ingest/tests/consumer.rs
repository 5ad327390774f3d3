use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use pretty_assertions::assert_eq;
use stream_ingest::{PoolStats, StreamConsumer, TriggerOutcome};
use stream_ingest_test_helpers::{
    RecordingSession, ScriptedReader, ScriptedReaderFactory, checkpoint, event, pool_config,
    transport_error,
};

fn new_consumer(max_leases: usize) -> (StreamConsumer, Arc<ScriptedReaderFactory>) {
    let factory = ScriptedReaderFactory::new();
    let consumer = StreamConsumer::new(pool_config(max_leases), Arc::clone(&factory) as _);
    (consumer, factory)
}

/// Poll `condition` until it holds, panicking after a few seconds.
fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for condition");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test_log::test]
fn starts_unscheduled() {
    let (consumer, factory) = new_consumer(1);
    assert!(!consumer.is_scheduled());
    assert!(consumer.pool_stats().is_none());

    // an unscheduled trigger leases a reader and hands it straight back
    let reader = ScriptedReader::new([event("a", "seg-0@0")]);
    factory.push_reader(Arc::clone(&reader));
    let session = RecordingSession::new();
    assert_eq!(
        consumer.on_trigger(session.clone()),
        TriggerOutcome::Processed
    );
    assert_eq!(reader.reads(), 0);
    assert_eq!(
        consumer.pool_stats(),
        Some(PoolStats {
            idle: 1,
            leased: 0,
            created: 1,
            discarded: 0,
        })
    );
}

#[test_log::test]
fn final_checkpoint_ends_the_trigger() {
    let (consumer, factory) = new_consumer(1);
    let reader = ScriptedReader::new([
        event("a", "seg-0@0"),
        event("b", "seg-0@1"),
        checkpoint("cp-1"),
        event("c", "seg-0@2"),
        checkpoint("final-cp-2"),
    ]);
    factory.push_reader(Arc::clone(&reader));
    consumer.on_scheduled();

    let session = RecordingSession::new();
    assert_eq!(consumer.on_trigger(session.clone()), TriggerOutcome::Yield);
    assert_eq!(session.committed_payloads(), vec!["a", "b", "c"]);
    assert_eq!(session.commits(), 2);
    assert!(reader.is_closed());
    assert_eq!(consumer.pool_stats().unwrap().discarded, 1);

    // the next trigger gets a fresh reader
    let next = RecordingSession::new();
    let trigger = std::thread::scope(|s| {
        let handle = s.spawn(|| consumer.on_trigger(next.clone()));
        wait_for(|| factory.created_count() == 2);
        consumer.on_unscheduled();
        handle.join().unwrap()
    });
    assert_eq!(trigger, TriggerOutcome::Processed);
    assert_ne!(factory.created()[1].0, factory.created()[0].0);
}

#[test_log::test]
fn unscheduling_stops_between_reads() {
    let (consumer, factory) = new_consumer(1);
    let reader = ScriptedReader::new([
        event("a", "seg-0@0"),
        event("b", "seg-0@1"),
        checkpoint("cp-1"),
    ]);
    factory.push_reader(Arc::clone(&reader));
    consumer.on_scheduled();
    let session = RecordingSession::new();

    let outcome = std::thread::scope(|s| {
        let handle = s.spawn(|| consumer.on_trigger(session.clone()));
        // the script is exhausted after the checkpoint, reads then time out
        wait_for(|| session.commits() == 1 && reader.remaining() == 0);
        consumer.on_unscheduled();
        handle.join().unwrap()
    });

    assert_eq!(outcome, TriggerOutcome::Processed);
    assert_eq!(session.committed_payloads(), vec!["a", "b"]);
    assert_eq!(session.rollbacks(), 0);
    // nothing was pending, so the reader goes back to the pool
    assert!(!reader.is_closed());
    assert_eq!(consumer.pool_stats().unwrap().idle, 1);
}

#[test_log::test]
fn unscheduling_with_pending_records_discards_the_reader() {
    let (consumer, factory) = new_consumer(1);
    let reader = ScriptedReader::new([
        event("a", "seg-0@0"),
        checkpoint("cp-1"),
        event("b", "seg-0@1"),
    ]);
    factory.push_reader(Arc::clone(&reader));
    consumer.on_scheduled();
    let session = RecordingSession::new();

    let outcome = std::thread::scope(|s| {
        let handle = s.spawn(|| consumer.on_trigger(session.clone()));
        wait_for(|| session.commits() == 1 && session.pending() == 1);
        consumer.on_unscheduled();
        handle.join().unwrap()
    });

    assert_eq!(outcome, TriggerOutcome::Processed);
    assert_eq!(session.committed_payloads(), vec!["a"]);
    assert_eq!(session.rolled_back_records(), 1);
    assert!(reader.is_closed());
    assert_eq!(consumer.pool_stats().unwrap().discarded, 1);
}

#[test_log::test]
fn read_errors_are_logged_and_yield() {
    let (consumer, factory) = new_consumer(1);
    let reader = ScriptedReader::new([
        event("a", "seg-0@0"),
        transport_error("connection reset"),
    ]);
    factory.push_reader(Arc::clone(&reader));
    consumer.on_scheduled();

    let session = RecordingSession::new();
    assert_eq!(consumer.on_trigger(session.clone()), TriggerOutcome::Yield);
    assert!(session.committed().is_empty());
    assert_eq!(session.rolled_back_records(), 1);
    assert!(reader.is_closed());
    assert_eq!(
        consumer.pool_stats(),
        Some(PoolStats {
            idle: 0,
            leased: 0,
            created: 1,
            discarded: 1,
        })
    );
}

#[test_log::test]
fn configuration_errors_yield_on_every_trigger() {
    let (consumer, factory) = new_consumer(1);
    factory.set_stream_missing(true);
    consumer.on_scheduled();

    for _ in 0..3 {
        assert_eq!(
            consumer.on_trigger(RecordingSession::new()),
            TriggerOutcome::Yield
        );
    }
    assert_eq!(factory.attempts(), 3);

    // fixing the problem lets the next trigger through
    factory.set_stream_missing(false);
    factory.push_reader(ScriptedReader::new([checkpoint("final-cp-1")]));
    assert_eq!(
        consumer.on_trigger(RecordingSession::new()),
        TriggerOutcome::Yield
    );
    assert_eq!(factory.created_count(), 1);
}

#[test_log::test]
fn no_lease_available_yields() {
    let (consumer, factory) = new_consumer(1);
    consumer.on_scheduled();
    let session = RecordingSession::new();

    std::thread::scope(|s| {
        let handle = s.spawn(|| consumer.on_trigger(session.clone()));
        wait_for(|| factory.created_count() == 1);
        assert_eq!(
            consumer.on_trigger(RecordingSession::new()),
            TriggerOutcome::Yield
        );
        consumer.on_unscheduled();
        assert_eq!(handle.join().unwrap(), TriggerOutcome::Processed);
    });
    assert_eq!(factory.created_count(), 1);
}

#[test_log::test]
fn stopping_closes_the_pool() {
    let (consumer, factory) = new_consumer(2);
    consumer.on_trigger(RecordingSession::new());
    assert_eq!(consumer.pool_stats().unwrap().idle, 1);

    consumer.on_stopped();
    assert!(consumer.pool_stats().is_none());
    assert!(factory.created()[0].1.is_closed());

    // a later trigger builds a new pool with new readers
    consumer.on_trigger(RecordingSession::new());
    assert_eq!(factory.created_count(), 2);
    assert_eq!(consumer.pool_stats().unwrap().created, 1);
    consumer.on_stopped();
    consumer.on_stopped();
}

#[test_log::test]
fn rescheduling_after_unschedule() {
    let (consumer, _factory) = new_consumer(1);
    consumer.on_scheduled();
    assert!(consumer.is_scheduled());
    consumer.on_unscheduled();
    assert!(!consumer.is_scheduled());
    consumer.on_scheduled();
    assert!(consumer.is_scheduled());
}
