//! Target runtime metrics.
//!
//! Per-process counters for queue lifecycle, PDU traffic, and caravan
//! behavior, exposed through the metriken registry.

use metriken::{metric, Counter, Gauge};

// ── Queue lifecycle ──────────────────────────────────────────────

#[metric(
    name = "caravan/queues/accepted",
    description = "Total connections accepted into queues"
)]
pub static QUEUES_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "caravan/queues/released",
    description = "Total queues released"
)]
pub static QUEUES_RELEASED: Counter = Counter::new();

#[metric(name = "caravan/queues/active", description = "Currently live queues")]
pub static QUEUES_ACTIVE: Gauge = Gauge::new();

// ── PDU traffic ──────────────────────────────────────────────────

#[metric(name = "caravan/pdus/received", description = "Inbound PDUs dispatched")]
pub static PDUS_RECEIVED: Counter = Counter::new();

#[metric(name = "caravan/responses/sent", description = "Response PDUs emitted")]
pub static RESPONSES_SENT: Counter = Counter::new();

#[metric(name = "caravan/r2ts/sent", description = "R2T PDUs emitted")]
pub static R2TS_SENT: Counter = Counter::new();

// ── Caravans ─────────────────────────────────────────────────────

#[metric(
    name = "caravan/flushes",
    description = "Caravan flush writev invocations"
)]
pub static CARAVAN_FLUSHES: Counter = Counter::new();

#[metric(
    name = "caravan/flushed_bytes",
    description = "Total bytes flushed through caravans"
)]
pub static CARAVAN_FLUSHED_BYTES: Counter = Counter::new();

#[metric(
    name = "caravan/send_stalls",
    description = "Flushes deferred because the socket send buffer was full"
)]
pub static CARAVAN_SEND_STALLS: Counter = Counter::new();

// ── Errors ───────────────────────────────────────────────────────

#[metric(name = "caravan/fatal_errors", description = "Queue-fatal protocol errors")]
pub static FATAL_ERRORS: Counter = Counter::new();

#[metric(
    name = "caravan/digest_errors",
    description = "Header or data digest verification failures"
)]
pub static DIGEST_ERRORS: Counter = Counter::new();
