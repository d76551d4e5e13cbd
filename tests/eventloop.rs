//! Integration tests for loop lifecycle, the cross-thread submit
//! wakeup, timers and ordering.

use std::sync::mpsc;
use std::time::{Duration, Instant};

use spindle::{ConfigBuilder, EventLoop, IoBuffer, LoopState, ReactorKind, Scheduler, TpcEngine};

fn started_engine(kind: ReactorKind, loops: usize) -> Option<TpcEngine> {
    let config = ConfigBuilder::new()
        .reactor(kind)
        .eventloops(loops)
        .build()
        .unwrap();
    let engine = match TpcEngine::new(config) {
        Ok(e) => e,
        Err(_) if kind == ReactorKind::CompletionRing => return None,
        Err(e) => panic!("engine construction failed: {e}"),
    };
    engine.start().unwrap();
    Some(engine)
}

fn submit_wakeup_latency(kind: ReactorKind) {
    let Some(engine) = started_engine(kind, 1) else {
        return;
    };
    let eventloop = engine.eventloop(0);

    // Let the loop reach its parked state.
    std::thread::sleep(Duration::from_millis(50));

    for _ in 0..10 {
        let (tx, rx) = mpsc::channel();
        let submitted = Instant::now();
        eventloop.execute(move || {
            let _ = tx.send(());
        })
        .unwrap();
        rx.recv_timeout(Duration::from_secs(1))
            .expect("task did not run");
        let latency = submitted.elapsed();
        assert!(
            latency < Duration::from_millis(50),
            "parked loop took {latency:?} to observe a submit"
        );
    }

    engine.shutdown();
    assert!(engine.await_termination(Duration::from_secs(5)));
}

#[test]
fn submit_wakeup_latency_readiness() {
    submit_wakeup_latency(ReactorKind::Readiness);
}

#[test]
fn submit_wakeup_latency_portable() {
    submit_wakeup_latency(ReactorKind::Portable);
}

#[test]
fn submit_wakeup_latency_completion_ring() {
    submit_wakeup_latency(ReactorKind::CompletionRing);
}

#[test]
fn single_producer_tasks_run_in_order() {
    let Some(engine) = started_engine(ReactorKind::Portable, 1) else {
        return;
    };
    let eventloop = engine.eventloop(0);

    let (tx, rx) = mpsc::channel();
    for k in 0..500u32 {
        let tx = tx.clone();
        eventloop
            .execute(move || {
                let _ = tx.send(k);
            })
            .unwrap();
    }
    for expected in 0..500u32 {
        let got = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(got, expected, "tasks reordered");
    }

    engine.shutdown();
    assert!(engine.await_termination(Duration::from_secs(5)));
}

#[test]
fn timer_fires_near_deadline() {
    let Some(engine) = started_engine(ReactorKind::Readiness, 1) else {
        return;
    };
    let eventloop = engine.eventloop(0).clone();

    let (tx, rx) = mpsc::channel();
    let timer_loop = eventloop.clone();
    let armed = Instant::now();
    eventloop
        .execute(move || {
            // On the owner thread now; scheduling is legal here.
            let tx = tx.clone();
            timer_loop.schedule_after(Duration::from_millis(40), move || {
                let _ = tx.send(Instant::now());
            });
        })
        .unwrap();

    let fired = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    let elapsed = fired.duration_since(armed);
    assert!(
        elapsed >= Duration::from_millis(35),
        "timer fired early: {elapsed:?}"
    );
    assert!(
        elapsed < Duration::from_millis(500),
        "timer fired late: {elapsed:?}"
    );

    engine.shutdown();
    assert!(engine.await_termination(Duration::from_secs(5)));
}

#[test]
fn timers_fire_in_deadline_order() {
    let Some(engine) = started_engine(ReactorKind::Portable, 1) else {
        return;
    };
    let eventloop = engine.eventloop(0).clone();

    let (tx, rx) = mpsc::channel();
    let timer_loop = eventloop.clone();
    eventloop
        .execute(move || {
            for (label, delay_ms) in [(3u32, 90u64), (1, 30), (2, 60)] {
                let tx = tx.clone();
                timer_loop.schedule_after(Duration::from_millis(delay_ms), move || {
                    let _ = tx.send(label);
                });
            }
        })
        .unwrap();

    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 1);
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 2);
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 3);

    engine.shutdown();
    assert!(engine.await_termination(Duration::from_secs(5)));
}

#[test]
fn shutdown_rejects_new_work_without_side_effects() {
    let Some(engine) = started_engine(ReactorKind::Portable, 1) else {
        return;
    };
    let eventloop = engine.eventloop(0).clone();

    engine.shutdown();
    assert!(engine.await_termination(Duration::from_secs(5)));
    assert_eq!(eventloop.state(), LoopState::Terminated);

    let result = eventloop.execute(|| panic!("must never run"));
    assert!(matches!(result, Err(spindle::Error::Shutdown)));

    let buf = IoBuffer::with_capacity(16);
    assert!(matches!(
        eventloop.offer(buf),
        Err(spindle::Error::Shutdown)
    ));

    // Idempotent.
    engine.shutdown();
    eventloop.shutdown();
}

#[test]
fn shutdown_before_start_terminates() {
    let config = ConfigBuilder::new()
        .reactor(ReactorKind::Portable)
        .eventloops(1)
        .build()
        .unwrap();
    let eventloop = EventLoop::new(0, &config).unwrap();
    assert_eq!(eventloop.state(), LoopState::New);
    eventloop.shutdown();
    assert_eq!(eventloop.state(), LoopState::Terminated);
    assert!(eventloop.await_termination(Duration::from_secs(1)));
}

#[test]
fn wakeup_from_owner_thread_is_noop() {
    let Some(engine) = started_engine(ReactorKind::Readiness, 1) else {
        return;
    };
    let eventloop = engine.eventloop(0).clone();

    let (tx, rx) = mpsc::channel();
    let self_loop = eventloop.clone();
    eventloop
        .execute(move || {
            // Must not write the eventfd or deadlock.
            self_loop.wakeup();
            let _ = tx.send(self_loop.is_owner());
        })
        .unwrap();
    assert!(rx.recv_timeout(Duration::from_secs(2)).unwrap());

    engine.shutdown();
    assert!(engine.await_termination(Duration::from_secs(5)));
}

// ── Scheduler tick ──────────────────────────────────────────────────

struct TickOnce {
    tx: mpsc::Sender<IoBuffer>,
}

impl Scheduler for TickOnce {
    fn tick(&mut self) -> bool {
        false
    }

    fn schedule(&mut self, request: IoBuffer) {
        let _ = self.tx.send(request);
    }
}

#[test]
fn offered_buffer_reaches_scheduler_after_wakeup() {
    let config = ConfigBuilder::new()
        .reactor(ReactorKind::Readiness)
        .eventloops(1)
        .build()
        .unwrap();
    let eventloop = EventLoop::new(0, &config).unwrap();
    let (tx, rx) = mpsc::channel();
    eventloop.set_scheduler(Box::new(TickOnce { tx })).unwrap();
    eventloop.start().unwrap();

    let mut buf = IoBuffer::with_capacity(32);
    buf.write_i64(4242);
    buf.flip();
    eventloop.offer(buf).unwrap();

    let mut got = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(got.read_i64(), 4242);

    eventloop.shutdown();
    assert!(eventloop.await_termination(Duration::from_secs(5)));
}

#[test]
fn spin_mode_still_runs_tasks() {
    let config = ConfigBuilder::new()
        .reactor(ReactorKind::Portable)
        .eventloops(1)
        .spin(true)
        .build()
        .unwrap();
    let engine = TpcEngine::new(config).unwrap();
    engine.start().unwrap();

    let (tx, rx) = mpsc::channel();
    engine
        .eventloop(0)
        .execute(move || {
            let _ = tx.send(());
        })
        .unwrap();
    rx.recv_timeout(Duration::from_secs(2)).unwrap();

    engine.shutdown();
    assert!(engine.await_termination(Duration::from_secs(5)));
}
