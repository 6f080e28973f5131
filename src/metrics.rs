//! netline runtime metrics.
//!
//! Loop-wide counters for stream lifecycle, bytes moved, idle expiries, and
//! pool churn. Exposed through the metriken registry for scraping.

use metriken::{Counter, Gauge, metric};

// ── Stream lifecycle ─────────────────────────────────────────────

#[metric(
    name = "netline/streams/accepted",
    description = "Total streams accepted from servers"
)]
pub static STREAMS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "netline/streams/connected",
    description = "Total outbound connects completed"
)]
pub static STREAMS_CONNECTED: Counter = Counter::new();

#[metric(name = "netline/streams/closed", description = "Total streams closed")]
pub static STREAMS_CLOSED: Counter = Counter::new();

#[metric(
    name = "netline/streams/active",
    description = "Currently open streams"
)]
pub static STREAMS_ACTIVE: Gauge = Gauge::new();

// ── Bytes ────────────────────────────────────────────────────────

#[metric(name = "netline/bytes/received", description = "Total bytes received")]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(name = "netline/bytes/sent", description = "Total bytes sent")]
pub static BYTES_SENT: Counter = Counter::new();

// ── Timeouts ─────────────────────────────────────────────────────

#[metric(
    name = "netline/timeouts/idle",
    description = "Streams torn down by idle timeout"
)]
pub static IDLE_TIMEOUTS: Counter = Counter::new();

// ── Pool churn ───────────────────────────────────────────────────

#[metric(
    name = "netline/pool/slabs_replaced",
    description = "Read slab replacements at the low-water mark"
)]
pub static POOL_SLABS_REPLACED: Counter = Counter::new();

// ── Backpressure ─────────────────────────────────────────────────

#[metric(
    name = "netline/write/residuals",
    description = "Partial writes requeued for write readiness"
)]
pub static WRITE_RESIDUALS: Counter = Counter::new();
