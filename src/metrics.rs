//! Engine metrics.
//!
//! Static counters and gauges for connection lifecycle, byte flow, loop
//! behavior and request correlation, exposed through `metriken` for
//! whatever sink the embedding process registers.

use metriken::{metric, Counter, Gauge};

// ── Connection lifecycle ─────────────────────────────────────────

#[metric(
    name = "spindle/connections/accepted",
    description = "Total connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "spindle/connections/closed",
    description = "Total connections closed"
)]
pub static CONNECTIONS_CLOSED: Counter = Counter::new();

#[metric(
    name = "spindle/connections/active",
    description = "Sockets currently registered with a loop"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

// ── Bytes ────────────────────────────────────────────────────────

#[metric(name = "spindle/bytes/received", description = "Total bytes received")]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(name = "spindle/bytes/sent", description = "Total bytes sent")]
pub static BYTES_SENT: Counter = Counter::new();

// ── Loop behavior ────────────────────────────────────────────────

#[metric(
    name = "spindle/loop/wakeups",
    description = "Cross-thread wakeup writes issued"
)]
pub static WAKEUPS: Counter = Counter::new();

#[metric(
    name = "spindle/loop/parks",
    description = "Times a loop entered a kernel wait"
)]
pub static PARKS: Counter = Counter::new();

#[metric(
    name = "spindle/loop/tasks_executed",
    description = "Concurrent-queue tasks executed"
)]
pub static TASKS_EXECUTED: Counter = Counter::new();

// ── Frames ───────────────────────────────────────────────────────

#[metric(
    name = "spindle/frames/decoded",
    description = "Complete frames detached from receive accumulators"
)]
pub static FRAMES_DECODED: Counter = Counter::new();

// ── Sockets ──────────────────────────────────────────────────────

#[metric(
    name = "spindle/socket/backpressure_rejects",
    description = "Writes refused by the outbound byte budget"
)]
pub static BACKPRESSURE_REJECTS: Counter = Counter::new();

// ── Requests ─────────────────────────────────────────────────────

#[metric(
    name = "spindle/requests/completed",
    description = "Requests resolved with a response"
)]
pub static REQUESTS_COMPLETED: Counter = Counter::new();

#[metric(
    name = "spindle/requests/timed_out",
    description = "Requests failed by their deadline"
)]
pub static REQUESTS_TIMED_OUT: Counter = Counter::new();
