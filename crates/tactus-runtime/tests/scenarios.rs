//! End-to-end scheduler scenarios: microstep chains, spacing policies,
//! level barriers, physical actions, deadlines, and stop handling.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tactus_runtime::{
    DropReason, FederationAdapter, FederationError, GraphBuilder, ManualClock, NoFederation,
    Runtime, RuntimeConfig, ScheduleResult, SpacingPolicy, Tag,
};

const MS: i64 = 1_000_000;

type Log = Arc<Mutex<Vec<(String, Tag)>>>;

fn new_log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

fn record(log: &Log, name: &str, tag: Tag) {
    log.lock().unwrap().push((name.to_string(), tag));
}

fn entries(log: &Log) -> Vec<(String, Tag)> {
    log.lock().unwrap().clone()
}

fn fast_config(workers: usize) -> RuntimeConfig {
    RuntimeConfig {
        fast: true,
        workers,
        ..RuntimeConfig::default()
    }
}

/// S1: a zero-delay logical action self-scheduled from (0,0) fires at
/// (0,1) and (0,2), then execution stops when not rescheduled.
#[test]
fn zero_delay_microstep_chain() {
    let log = new_log();
    let mut g = GraphBuilder::new();
    let reactor = g.add_reactor("chain", ());
    let action = g.add_logical_action(reactor, "step", 0, 0);

    let kick = g.add_reaction(reactor, "kick", {
        move |ctx| {
            ctx.schedule(action, 0).unwrap();
        }
    });
    g.on_startup(kick);

    let stepper = g.add_reaction(reactor, "stepper", {
        let log = log.clone();
        move |ctx| {
            record(&log, "step", ctx.tag());
            if ctx.tag().microstep < 2 {
                ctx.schedule(action, 0).unwrap();
            }
        }
    });
    g.trigger_reaction(action, stepper);

    let mut runtime = Runtime::new(g.build().unwrap(), fast_config(1));
    runtime.run().unwrap();

    let fired: Vec<Tag> = entries(&log).into_iter().map(|(_, t)| t).collect();
    assert_eq!(fired, vec![Tag::new(0, 1), Tag::new(0, 2)]);
}

/// S2: with a 1 ms minimum spacing and the drop policy, the second
/// same-reaction schedule is dropped.
#[test]
fn min_spacing_drop_policy() {
    let log = new_log();
    let results = Arc::new(Mutex::new(Vec::new()));
    let mut g = GraphBuilder::new();
    let reactor = g.add_reactor("mit", ());
    let action = g.add_logical_action(reactor, "burst", 0, 0);
    g.set_min_spacing(action, MS, SpacingPolicy::Drop);
    let tick = g.add_timer(reactor, "tick", 10 * MS, 0);

    let caller = g.add_reaction(reactor, "caller", {
        let results = results.clone();
        move |ctx| {
            let mut out = results.lock().unwrap();
            out.push(ctx.schedule(action, 0).unwrap());
            out.push(ctx.schedule(action, 0).unwrap());
        }
    });
    g.trigger_reaction(tick, caller);

    let sink = g.add_reaction(reactor, "sink", {
        let log = log.clone();
        move |ctx| record(&log, "burst", ctx.tag())
    });
    g.trigger_reaction(action, sink);

    let mut runtime = Runtime::new(g.build().unwrap(), fast_config(1));
    runtime.run().unwrap();

    let results = results.lock().unwrap();
    assert!(results[0].is_scheduled());
    assert_eq!(results[1], ScheduleResult::Dropped(DropReason::MinSpacing));

    let fired: Vec<Tag> = entries(&log).into_iter().map(|(_, t)| t).collect();
    assert_eq!(fired, vec![Tag::new(10 * MS, 1)]);
}

/// S3: same as S2 with the defer policy; the second event lands at the
/// earliest admissible tag (11 ms, 0).
#[test]
fn min_spacing_defer_policy() {
    let log = new_log();
    let mut g = GraphBuilder::new();
    let reactor = g.add_reactor("mit", ());
    let action = g.add_logical_action(reactor, "burst", 0, 0);
    g.set_min_spacing(action, MS, SpacingPolicy::Defer);
    let tick = g.add_timer(reactor, "tick", 10 * MS, 0);

    let caller = g.add_reaction(reactor, "caller", {
        move |ctx| {
            assert!(ctx.schedule(action, 0).unwrap().is_scheduled());
            assert!(ctx.schedule(action, 0).unwrap().is_scheduled());
        }
    });
    g.trigger_reaction(tick, caller);

    let sink = g.add_reaction(reactor, "sink", {
        let log = log.clone();
        move |ctx| record(&log, "burst", ctx.tag())
    });
    g.trigger_reaction(action, sink);

    let mut runtime = Runtime::new(g.build().unwrap(), fast_config(1));
    runtime.run().unwrap();

    let fired: Vec<Tag> = entries(&log).into_iter().map(|(_, t)| t).collect();
    assert_eq!(fired, vec![Tag::new(10 * MS, 1), Tag::new(11 * MS, 0)]);
}

/// Defer keeps the scheduled-tag sequence monotonically non-decreasing
/// with consecutive gaps of at least the minimum spacing.
#[test]
fn min_spacing_defer_is_monotone() {
    let log = new_log();
    let mut g = GraphBuilder::new();
    let reactor = g.add_reactor("mit", ());
    let action = g.add_logical_action(reactor, "burst", 0, 0);
    g.set_min_spacing(action, MS, SpacingPolicy::Defer);
    let tick = g.add_timer(reactor, "tick", 10 * MS, 0);

    let caller = g.add_reaction(reactor, "caller", move |ctx| {
        for _ in 0..5 {
            assert!(ctx.schedule(action, 0).unwrap().is_scheduled());
        }
    });
    g.trigger_reaction(tick, caller);

    let sink = g.add_reaction(reactor, "sink", {
        let log = log.clone();
        move |ctx| record(&log, "burst", ctx.tag())
    });
    g.trigger_reaction(action, sink);

    let mut runtime = Runtime::new(g.build().unwrap(), fast_config(1));
    runtime.run().unwrap();

    let fired: Vec<Tag> = entries(&log).into_iter().map(|(_, t)| t).collect();
    assert_eq!(fired.len(), 5);
    for pair in fired.windows(2) {
        assert!(pair[1] > pair[0]);
        assert!(pair[1].time - pair[0].time >= MS || pair[0].time == pair[1].time);
    }
    // After the first (same-instant) firing, gaps are exactly the MIT.
    for pair in fired[1..].windows(2) {
        assert_eq!(pair[1].time - pair[0].time, MS);
    }
}

/// The replace policy withdraws the queued event in favor of the new
/// one at the earliest admissible tag.
#[test]
fn min_spacing_replace_policy() {
    let log = new_log();
    let mut g = GraphBuilder::new();
    let reactor = g.add_reactor("mit", ());
    let action = g.add_logical_action(reactor, "burst", 0, 0);
    g.set_min_spacing(action, MS, SpacingPolicy::Replace);
    let tick = g.add_timer(reactor, "tick", 10 * MS, 0);

    let caller = g.add_reaction(reactor, "caller", move |ctx| {
        assert!(ctx.schedule(action, 0).unwrap().is_scheduled());
        assert!(ctx.schedule(action, 0).unwrap().is_scheduled());
    });
    g.trigger_reaction(tick, caller);

    let sink = g.add_reaction(reactor, "sink", {
        let log = log.clone();
        move |ctx| record(&log, "burst", ctx.tag())
    });
    g.trigger_reaction(action, sink);

    let mut runtime = Runtime::new(g.build().unwrap(), fast_config(1));
    runtime.run().unwrap();

    // The first event was replaced; only the deferred one fires.
    let fired: Vec<Tag> = entries(&log).into_iter().map(|(_, t)| t).collect();
    assert_eq!(fired, vec![Tag::new(11 * MS, 0)]);
}

/// S4: a level-0 producer completes before the level-1 consumer starts,
/// even with multiple workers.
#[test]
fn level_barrier_orders_dependent_reactions() {
    let log = new_log();
    let mut g = GraphBuilder::new();
    let producer = g.add_reactor("producer", ());
    let consumer = g.add_reactor("consumer", ());
    let tick = g.add_timer(producer, "tick", 5, 0);
    let out = g.add_port(producer, "out", 8);

    let r1 = g.add_reaction(producer, "emit", {
        let log = log.clone();
        move |ctx| {
            record(&log, "r1", ctx.tag());
            ctx.set_value(out, &7i64.to_le_bytes()).unwrap();
        }
    });
    g.trigger_reaction(tick, r1);
    g.reaction_writes(r1, out);

    let r2 = g.add_reaction(consumer, "absorb", {
        let log = log.clone();
        move |ctx| {
            assert!(ctx.port_is_present(out));
            let bytes = ctx.port_value(out).unwrap();
            assert_eq!(i64::from_le_bytes(bytes.as_ref().try_into().unwrap()), 7);
            record(&log, "r2", ctx.tag());
        }
    });
    g.connect(out, r2);

    let mut runtime = Runtime::new(g.build().unwrap(), fast_config(4));
    let report = runtime.run().unwrap();

    let order: Vec<String> = entries(&log).into_iter().map(|(n, _)| n).collect();
    assert_eq!(order, vec!["r1", "r2"]);
    assert_eq!(report.live_tokens, 0);
}

/// Levels serialize within every tag across a longer multi-worker run.
#[test]
fn levels_serialize_across_tags() {
    let log = new_log();
    let mut g = GraphBuilder::new();
    let src = g.add_reactor("src", ());
    let mid = g.add_reactor("mid", ());
    let dst = g.add_reactor("dst", ());
    let tick = g.add_timer(src, "tick", 0, MS);
    let p1 = g.add_port(src, "p1", 8);
    let p2 = g.add_port(mid, "p2", 8);

    let names = ["a", "b", "c"];
    let a = g.add_reaction(src, "a", {
        let log = log.clone();
        move |ctx| {
            record(&log, "a", ctx.tag());
            ctx.set_value(p1, &ctx.tag().time.to_le_bytes()).unwrap();
        }
    });
    g.trigger_reaction(tick, a);
    g.reaction_writes(a, p1);

    let b = g.add_reaction(mid, "b", {
        let log = log.clone();
        move |ctx| {
            record(&log, "b", ctx.tag());
            let bytes = ctx.port_value(p1).unwrap();
            ctx.set_value(p2, &bytes).unwrap();
        }
    });
    g.connect(p1, b);
    g.reaction_writes(b, p2);

    let c = g.add_reaction(dst, "c", {
        let log = log.clone();
        move |ctx| record(&log, "c", ctx.tag())
    });
    g.connect(p2, c);

    let config = RuntimeConfig {
        timeout: Some(4 * MS),
        ..fast_config(4)
    };
    let mut runtime = Runtime::new(g.build().unwrap(), config);
    let report = runtime.run().unwrap();
    assert_eq!(report.live_tokens, 0);

    let log = entries(&log);
    // Five timer firings (0..=4 ms); within each tag the pipeline runs
    // a then b then c, and tags never interleave.
    assert_eq!(log.len(), 15);
    for (i, chunk) in log.chunks(3).enumerate() {
        let tag = Tag::new(i as i64 * MS, 0);
        for (j, (name, at)) in chunk.iter().enumerate() {
            assert_eq!((name.as_str(), *at), (names[j], tag));
        }
    }
}

/// S5: a physical action is stamped with the later of clock and logical
/// time, plus its minimum delay.
#[test]
fn physical_action_bounded_by_clock() {
    let log = new_log();
    let clock = Arc::new(ManualClock::new(0));
    let mut g = GraphBuilder::new();
    let reactor = g.add_reactor("phys", ());
    let action = g.add_physical_action(reactor, "sensor", 10 * MS, 0);
    let tick = g.add_timer(reactor, "tick", 50 * MS, 0);

    let caller = g.add_reaction(reactor, "caller", {
        let clock = clock.clone();
        move |ctx| {
            clock.set(100 * MS);
            assert!(ctx.schedule(action, 0).unwrap().is_scheduled());
        }
    });
    g.trigger_reaction(tick, caller);

    let sink = g.add_reaction(reactor, "sink", {
        let log = log.clone();
        move |ctx| record(&log, "sensor", ctx.tag())
    });
    g.trigger_reaction(action, sink);

    let mut runtime =
        Runtime::with_clock(g.build().unwrap(), fast_config(1), Box::new(clock.clone()));
    runtime.run().unwrap();

    let fired: Vec<Tag> = entries(&log).into_iter().map(|(_, t)| t).collect();
    assert_eq!(fired, vec![Tag::new(110 * MS, 0)]);
}

/// S6: with a 1 s timeout, schedules landing past the stop tag are
/// dropped and execution ends at the stop tag.
#[test]
fn timeout_bounds_execution() {
    let log = new_log();
    let results = Arc::new(Mutex::new(Vec::new()));
    let second = 1_000 * MS;
    let mut g = GraphBuilder::new();
    let reactor = g.add_reactor("bounded", ());
    let action = g.add_logical_action(reactor, "late", 0, 0);
    let tick = g.add_timer(reactor, "tick", 0, 300 * MS);

    let caller = g.add_reaction(reactor, "caller", {
        let log = log.clone();
        let results = results.clone();
        move |ctx| {
            record(&log, "tick", ctx.tag());
            if ctx.tag().time == 900 * MS {
                results
                    .lock()
                    .unwrap()
                    .push(ctx.schedule(action, 200 * MS).unwrap());
            }
        }
    });
    g.trigger_reaction(tick, caller);

    let sink = g.add_reaction(reactor, "sink", |_| {
        panic!("no event past the stop tag may fire");
    });
    g.trigger_reaction(action, sink);

    let done = g.add_reaction(reactor, "done", {
        let log = log.clone();
        move |ctx| record(&log, "shutdown", ctx.tag())
    });
    g.on_shutdown(done);

    let config = RuntimeConfig {
        timeout: Some(second),
        ..fast_config(1)
    };
    let mut runtime = Runtime::new(g.build().unwrap(), config);
    let report = runtime.run().unwrap();

    assert_eq!(
        results.lock().unwrap()[0],
        ScheduleResult::Dropped(DropReason::BeyondStopTag)
    );
    assert_eq!(report.final_tag, Tag::new(second, 0));
    let log = entries(&log);
    // Timer fires at 0, 300, 600, 900 ms; shutdown at the stop tag.
    assert_eq!(log.len(), 5);
    assert_eq!(log[4], ("shutdown".to_string(), Tag::new(second, 0)));
}

/// A stop requested at (0,0) lets the current tag finish, fires
/// shutdown one microstep later, and nothing else runs.
#[test]
fn request_stop_is_cooperative() {
    let log = new_log();
    let mut g = GraphBuilder::new();
    let reactor = g.add_reactor("stopper", ());
    let tick = g.add_timer(reactor, "tick", 0, 10 * MS);

    let first = g.add_reaction(reactor, "first", {
        let log = log.clone();
        move |ctx| {
            record(&log, "tick", ctx.tag());
            if ctx.tag().time == 0 {
                ctx.request_stop();
            }
        }
    });
    g.trigger_reaction(tick, first);

    let done = g.add_reaction(reactor, "done", {
        let log = log.clone();
        move |ctx| record(&log, "shutdown", ctx.tag())
    });
    g.on_shutdown(done);

    let mut runtime = Runtime::new(g.build().unwrap(), fast_config(2));
    let report = runtime.run().unwrap();

    let log = entries(&log);
    assert_eq!(log.len(), 2);
    assert_eq!(log[0], ("tick".to_string(), Tag::new(0, 0)));
    assert_eq!(log[1], ("shutdown".to_string(), Tag::new(0, 1)));
    assert_eq!(report.final_tag, Tag::new(0, 1));
}

/// Two schedules resolving to the identical tag for one trigger chain
/// behind each other, one microstep apart, in call order.
#[test]
fn same_tag_schedules_chain_by_microstep() {
    let log = new_log();
    let mut g = GraphBuilder::new();
    let reactor = g.add_reactor("race", ());
    // No minimum spacing: both calls reach the same-tag race directly.
    let action = g.add_logical_action(reactor, "burst", 0, 8);

    let caller = g.add_reaction(reactor, "caller", move |ctx| {
        let first = ctx.schedule_int(action, 0, 1).unwrap();
        let second = ctx.schedule_int(action, 0, 2).unwrap();
        let (a, b) = (first.handle().unwrap(), second.handle().unwrap());
        assert_ne!(a, b);
    });
    g.on_startup(caller);

    let sink = g.add_reaction(reactor, "sink", {
        let log = log.clone();
        move |ctx| {
            let bytes = ctx.action_value(action).unwrap();
            let n = i64::from_le_bytes(bytes.as_ref().try_into().unwrap());
            record(&log, &n.to_string(), ctx.tag());
        }
    });
    g.trigger_reaction(action, sink);

    let mut runtime = Runtime::new(g.build().unwrap(), fast_config(1));
    let report = runtime.run().unwrap();

    let log = entries(&log);
    assert_eq!(
        log,
        vec![
            ("1".to_string(), Tag::new(0, 1)),
            ("2".to_string(), Tag::new(0, 2)),
        ]
    );
    assert_eq!(report.live_tokens, 0);
}

/// A token taken from one action's firing can be forwarded to another
/// action with `schedule_token`; the queued event holds its own
/// reference, so the payload outlives the source presence and the pool
/// still drains.
#[test]
fn schedule_token_forwards_payload() {
    let log = new_log();
    let payload = *b"forwarded";
    let mut g = GraphBuilder::new();
    let reactor = g.add_reactor("relay", ());
    let source = g.add_logical_action(reactor, "source", 0, 1);
    let relayed = g.add_logical_action(reactor, "relayed", 0, 1);

    let kick = g.add_reaction(reactor, "kick", move |ctx| {
        assert!(ctx
            .schedule_copy(source, 0, &payload, payload.len())
            .unwrap()
            .is_scheduled());
    });
    g.on_startup(kick);

    let forward = g.add_reaction(reactor, "forward", move |ctx| {
        let token = ctx.action_token(source).unwrap();
        assert!(ctx.schedule_token(relayed, 0, token).unwrap().is_scheduled());
    });
    g.trigger_reaction(source, forward);

    let sink = g.add_reaction(reactor, "sink", {
        let log = log.clone();
        move |ctx| {
            // The source presence was released one tag ago; the event's
            // own reference kept the payload alive.
            assert!(!ctx.action_is_present(source));
            assert_eq!(ctx.action_value(relayed).unwrap().as_ref(), &payload);
            record(&log, "sink", ctx.tag());
        }
    });
    g.trigger_reaction(relayed, sink);

    let mut runtime = Runtime::new(g.build().unwrap(), fast_config(1));
    let report = runtime.run().unwrap();

    let log = entries(&log);
    assert_eq!(log, vec![("sink".to_string(), Tag::new(0, 2))]);
    assert_eq!(report.live_tokens, 0);
}

/// Records every coordination exchange and grants a fixed stop tag.
#[derive(Clone)]
struct RecordingAdapter {
    notified: Arc<Mutex<Vec<Tag>>>,
    stop_requests: Arc<Mutex<Vec<Tag>>>,
    stop_grant: Tag,
}

impl RecordingAdapter {
    fn new(stop_grant: Tag) -> Self {
        RecordingAdapter {
            notified: Arc::new(Mutex::new(Vec::new())),
            stop_requests: Arc::new(Mutex::new(Vec::new())),
            stop_grant,
        }
    }
}

impl FederationAdapter for RecordingAdapter {
    fn notify_next_event(&self, tag: Tag) {
        self.notified.lock().unwrap().push(tag);
    }

    fn wait_for_tag(&self, tag: Tag) -> Result<Tag, FederationError> {
        Ok(tag)
    }

    fn send_stop_request(&self, tag: Tag) {
        self.stop_requests.lock().unwrap().push(tag);
    }

    fn await_stop_granted(&self) -> Result<Tag, FederationError> {
        Ok(self.stop_grant)
    }
}

/// Federated advancement asks the adapter before every tag, and a stop
/// request is negotiated into the coordinated stop tag.
#[test]
fn federated_advancement_consults_adapter() {
    let log = new_log();
    let adapter = RecordingAdapter::new(Tag::new(4 * MS, 0));
    let mut g = GraphBuilder::new();
    let reactor = g.add_reactor("fed", ());
    let tick = g.add_timer(reactor, "tick", 0, MS);

    let step = g.add_reaction(reactor, "step", {
        let log = log.clone();
        move |ctx| {
            record(&log, "tick", ctx.tag());
            if ctx.tag().time == 2 * MS {
                ctx.request_stop();
            }
        }
    });
    g.trigger_reaction(tick, step);

    let done = g.add_reaction(reactor, "done", {
        let log = log.clone();
        move |ctx| record(&log, "shutdown", ctx.tag())
    });
    g.on_shutdown(done);

    let mut runtime = Runtime::with_federation(
        g.build().unwrap(),
        fast_config(1),
        Box::new(ManualClock::new(0)),
        Box::new(adapter.clone()),
    );
    let report = runtime.run().unwrap();

    // The stop requested at (2 ms, 0) was negotiated out to the grant.
    assert_eq!(
        adapter.stop_requests.lock().unwrap().as_slice(),
        &[Tag::new(2 * MS, 1)]
    );
    assert_eq!(report.final_tag, Tag::new(4 * MS, 0));

    // Every advancement was announced, starting from the first tag.
    let notified = adapter.notified.lock().unwrap();
    assert_eq!(notified[0], Tag::new(0, 0));
    assert!(notified.len() >= 5);

    let log = entries(&log);
    let ticks: Vec<Tag> = log
        .iter()
        .filter(|(n, _)| n == "tick")
        .map(|(_, t)| *t)
        .collect();
    assert_eq!(
        ticks,
        (0..=4).map(|i| Tag::new(i * MS, 0)).collect::<Vec<_>>()
    );
    assert_eq!(*log.last().unwrap(), ("shutdown".to_string(), Tag::new(4 * MS, 0)));
}

/// The default adapter grants everything immediately: a run under
/// `NoFederation` behaves exactly like a non-federated one.
#[test]
fn no_federation_adapter_grants_everything() {
    let log = new_log();
    let mut g = GraphBuilder::new();
    let reactor = g.add_reactor("solo", ());
    let tick = g.add_timer(reactor, "tick", 0, MS);

    let step = g.add_reaction(reactor, "step", {
        let log = log.clone();
        move |ctx| {
            record(&log, "tick", ctx.tag());
            if ctx.tag().time == MS {
                ctx.request_stop();
            }
        }
    });
    g.trigger_reaction(tick, step);

    let mut runtime = Runtime::with_federation(
        g.build().unwrap(),
        fast_config(1),
        Box::new(ManualClock::new(0)),
        Box::new(NoFederation),
    );
    let report = runtime.run().unwrap();

    // NoFederation grants no coordinated tag, so the local resolution
    // (one microstep past the current tag) wins.
    assert_eq!(report.final_tag, Tag::new(MS, 1));
    let fired: Vec<Tag> = entries(&log).into_iter().map(|(_, t)| t).collect();
    assert_eq!(fired, vec![Tag::new(0, 0), Tag::new(MS, 0)]);
}

/// Invariant 6: a payload scheduled with `schedule_copy` arrives
/// byte-equal in the triggered reaction.
#[test]
fn schedule_copy_round_trips_bytes() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let payload: [u8; 12] = [3, 1, 4, 1, 5, 9, 2, 6, 5, 3, 5, 8];
    let mut g = GraphBuilder::new();
    let reactor = g.add_reactor("bytes", ());
    let action = g.add_logical_action(reactor, "data", 0, 4);

    let sender = g.add_reaction(reactor, "sender", {
        move |ctx| {
            assert!(ctx
                .schedule_copy(action, 0, &payload, 3)
                .unwrap()
                .is_scheduled());
        }
    });
    g.on_startup(sender);

    let receiver = g.add_reaction(reactor, "receiver", {
        let seen = seen.clone();
        move |ctx| {
            assert!(ctx.action_is_present(action));
            seen.lock().unwrap().push(ctx.action_value(action).unwrap());
        }
    });
    g.trigger_reaction(action, receiver);

    let mut runtime = Runtime::new(g.build().unwrap(), fast_config(1));
    let report = runtime.run().unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].as_ref(), &payload);
    assert_eq!(report.live_tokens, 0);
}

/// Invariant 5: after a run to completion every token returns to the
/// pool, including port publishes with fan-out and user destructors.
#[test]
fn tokens_drain_after_run() {
    static DROPS: AtomicUsize = AtomicUsize::new(0);
    let mut g = GraphBuilder::new();
    let reactor = g.add_reactor("pool", ());
    let tick = g.add_timer(reactor, "tick", 0, MS);
    let out = g.add_port(reactor, "out", 8);
    g.set_port_destructor(out, Arc::new(|_| {
        DROPS.fetch_add(1, Ordering::SeqCst);
    }));
    let action = g.add_logical_action(reactor, "loopback", 0, 8);

    let emit = g.add_reaction(reactor, "emit", {
        move |ctx| {
            let now = ctx.tag().time;
            ctx.set_value(out, &now.to_le_bytes()).unwrap();
            let boxed: Box<[u8]> = Box::new(now.to_le_bytes());
            ctx.schedule_value(action, 0, boxed, 1).unwrap();
        }
    });
    g.trigger_reaction(tick, emit);
    g.reaction_writes(emit, out);

    let reader_a = g.add_reaction(reactor, "reader_a", move |ctx| {
        assert!(ctx.port_value(out).is_some());
    });
    let reader_b = g.add_reaction(reactor, "reader_b", move |ctx| {
        assert!(ctx.port_is_present(out));
    });
    g.connect(out, reader_a);
    g.connect(out, reader_b);

    let absorb = g.add_reaction(reactor, "absorb", move |ctx| {
        assert!(ctx.action_value(action).is_some());
    });
    g.trigger_reaction(action, absorb);

    let config = RuntimeConfig {
        timeout: Some(3 * MS),
        ..fast_config(2)
    };
    let mut runtime = Runtime::new(g.build().unwrap(), config);
    let report = runtime.run().unwrap();

    assert_eq!(report.live_tokens, 0);
    // One port publish per timer firing (0..=3 ms).
    assert_eq!(DROPS.load(Ordering::SeqCst), 4);
}

/// The remaining port capability surface: forwarding a token without
/// copying, allocate-and-fill, and payload-free presence.
#[test]
fn port_capability_surface() {
    let log = new_log();
    let payload = *b"zero-copy";
    let mut g = GraphBuilder::new();
    let reactor = g.add_reactor("ports", ());
    let action = g.add_logical_action(reactor, "data", 0, 1);
    let forwarded = g.add_port(reactor, "forwarded", 1);
    let filled = g.add_port(reactor, "filled", 1);
    let bare = g.add_port(reactor, "bare", 0);

    let kick = g.add_reaction(reactor, "kick", move |ctx| {
        assert!(ctx
            .schedule_copy(action, 0, &payload, payload.len())
            .unwrap()
            .is_scheduled());
    });
    g.on_startup(kick);

    let fan = g.add_reaction(reactor, "fan", move |ctx| {
        let token = ctx.action_token(action).unwrap();
        ctx.set_token(forwarded, token).unwrap();
        ctx.set_new(filled, 3, |buf| buf.copy_from_slice(b"abc")).unwrap();
        ctx.set_present(bare).unwrap();
    });
    g.trigger_reaction(action, fan);
    g.reaction_writes(fan, forwarded);
    g.reaction_writes(fan, filled);
    g.reaction_writes(fan, bare);

    let reader = g.add_reaction(reactor, "reader", {
        let log = log.clone();
        move |ctx| {
            assert_eq!(ctx.port_value(forwarded).unwrap().as_ref(), &payload);
            assert_eq!(ctx.port_value(filled).unwrap().as_ref(), b"abc");
            assert!(ctx.port_is_present(bare));
            assert!(ctx.port_value(bare).is_none());
            record(&log, "reader", ctx.tag());
        }
    });
    g.connect(forwarded, reader);
    g.connect(filled, reader);
    g.connect(bare, reader);

    let mut runtime = Runtime::new(g.build().unwrap(), fast_config(1));
    let report = runtime.run().unwrap();

    assert_eq!(entries(&log).len(), 1);
    assert_eq!(report.live_tokens, 0);
}

/// Deadline misses invoke the handler and report true; reactions
/// without a deadline never miss.
#[test]
fn deadline_miss_invokes_handler() {
    let missed = Arc::new(AtomicUsize::new(0));
    let clock = Arc::new(ManualClock::new(0));
    let mut g = GraphBuilder::new();
    let reactor = g.add_reactor("deadline", ());

    let hurried = g.add_reaction(reactor, "hurried", {
        let clock = clock.clone();
        move |ctx| {
            clock.set(50 * MS);
            assert!(ctx.check_deadline(true));
        }
    });
    g.on_startup(hurried);
    g.set_deadline(
        hurried,
        5 * MS,
        Some(Box::new({
            let missed = missed.clone();
            move |_ctx| {
                missed.fetch_add(1, Ordering::SeqCst);
            }
        })),
    );

    let relaxed = g.add_reaction(reactor, "relaxed", move |ctx| {
        assert!(!ctx.check_deadline(true));
    });
    g.on_startup(relaxed);

    let mut runtime =
        Runtime::with_clock(g.build().unwrap(), fast_config(1), Box::new(clock.clone()));
    runtime.run().unwrap();

    assert_eq!(missed.load(Ordering::SeqCst), 1);
}

/// Logical actions cannot be scheduled from outside a reaction.
#[test]
fn async_logical_schedule_is_rejected() {
    let mut g = GraphBuilder::new();
    let reactor = g.add_reactor("guarded", ());
    let logical = g.add_logical_action(reactor, "inner", 0, 0);
    let timer = g.add_timer(reactor, "tick", 0, 0);
    let noop = g.add_reaction(reactor, "noop", |_| {});
    g.trigger_reaction(timer, noop);

    let runtime = Runtime::new(g.build().unwrap(), fast_config(1));
    let handle = runtime.handle();

    assert!(matches!(
        handle.schedule(logical, 0),
        Err(tactus_runtime::Error::AsyncLogicalSchedule(_))
    ));
    assert!(matches!(
        handle.schedule(timer, 0),
        Err(tactus_runtime::Error::NotAnAction(_))
    ));
}

/// A physical action scheduled from another thread wakes the sleeping
/// scheduler; a stop request ends the run.
#[test]
fn external_physical_action_wakes_scheduler() {
    let log = new_log();
    let clock = Arc::new(ManualClock::new(1_000));
    let mut g = GraphBuilder::new();
    let reactor = g.add_reactor("external", ());
    let sensor = g.add_physical_action(reactor, "sensor", 0, 8);

    let sink = g.add_reaction(reactor, "sink", {
        let log = log.clone();
        move |ctx| {
            let bytes = ctx.action_value(sensor).unwrap();
            assert_eq!(i64::from_le_bytes(bytes.as_ref().try_into().unwrap()), 42);
            record(&log, "sensor", ctx.tag());
        }
    });
    g.trigger_reaction(sensor, sink);

    let mut runtime =
        Runtime::with_clock(g.build().unwrap(), fast_config(2), Box::new(clock.clone()));
    let handle = runtime.handle();

    let log_probe = log.clone();
    let feeder = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        assert!(handle.schedule_int(sensor, 0, 42).unwrap().is_scheduled());
        // Wait for the reaction before stopping so the event is not
        // cut off by the stop tag.
        for _ in 0..500 {
            if !log_probe.lock().unwrap().is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        handle.request_stop();
    });

    let report = runtime.run().unwrap();
    feeder.join().unwrap();

    let log = entries(&log);
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].1, Tag::new(1_000, 0));
    assert_eq!(report.live_tokens, 0);
}

/// The STP offset is visible and adjustable from reactions.
#[test]
fn stp_offset_round_trips() {
    let mut g = GraphBuilder::new();
    let reactor = g.add_reactor("stp", ());
    let probe = g.add_reaction(reactor, "probe", move |ctx| {
        assert_eq!(ctx.get_stp_offset(), 7);
        ctx.set_stp_offset(9);
        assert_eq!(ctx.get_stp_offset(), 9);
    });
    g.on_startup(probe);

    let config = RuntimeConfig {
        stp_offset: 7,
        ..fast_config(1)
    };
    let mut runtime = Runtime::new(g.build().unwrap(), config);
    runtime.run().unwrap();
    assert_eq!(runtime.stp_offset(), 9);
}

/// A configured trace path produces a well-formed binary trace.
#[test]
fn trace_file_is_written() {
    let path = std::env::temp_dir().join(format!("tactus-scenario-{}.lft", std::process::id()));
    let mut g = GraphBuilder::new();
    let reactor = g.add_reactor("traced", ());
    let tick = g.add_timer(reactor, "tick", 0, MS);
    let step = g.add_reaction(reactor, "step", |_| {});
    g.trigger_reaction(tick, step);

    let config = RuntimeConfig {
        timeout: Some(2 * MS),
        trace_path: Some(path.clone()),
        ..fast_config(1)
    };
    let mut runtime = Runtime::new(g.build().unwrap(), config);
    let user = runtime.register_user_trace_event("custom.marker");
    assert!(user > 0);
    runtime.run().unwrap();

    let bytes = std::fs::read(&path).unwrap();
    std::fs::remove_file(&path).ok();
    // Header: start time, then a table with one reaction, two triggers
    // (timer + the startup-less graph has only the timer)... at least
    // the registered entries, followed by frames.
    let table_size = i32::from_le_bytes(bytes[8..12].try_into().unwrap());
    assert!(table_size >= 3); // reaction + timer + user event
    assert!(bytes.len() > 12);
}
