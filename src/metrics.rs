use prometheus::{register_counter, register_int_gauge, Counter, IntGauge, Opts};
use std::sync::LazyLock;

// Counters
pub static SEGMENTS_PROCESSED: LazyLock<Counter> = LazyLock::new(|| {
    register_counter!(Opts::new(
        "tcpasm_segments_total",
        "The total number of TCP segments fed into the assembler"
    ))
    .unwrap()
});

pub static CONNECTIONS_TRACKED: LazyLock<Counter> = LazyLock::new(|| {
    register_counter!(Opts::new(
        "tcpasm_connections_total",
        "The total number of connections created in the stream pool"
    ))
    .unwrap()
});

pub static FLUSHED_HALVES: LazyLock<Counter> = LazyLock::new(|| {
    register_counter!(Opts::new(
        "tcpasm_flushed_halves_total",
        "The total number of half-connections pushed past a gap by a timed flush"
    ))
    .unwrap()
});

pub static SAVED_CONNECTIONS: LazyLock<Counter> = LazyLock::new(|| {
    register_counter!(Opts::new(
        "tcpasm_saved_connections_total",
        "The total number of conversations persisted to disk"
    ))
    .unwrap()
});

pub static SAVED_STREAMS: LazyLock<Counter> = LazyLock::new(|| {
    register_counter!(Opts::new(
        "tcpasm_saved_streams_total",
        "The total number of per-direction streams persisted to disk"
    ))
    .unwrap()
});

pub static CREDENTIALS_HARVESTED: LazyLock<Counter> = LazyLock::new(|| {
    register_counter!(Opts::new(
        "tcpasm_credentials_total",
        "The total number of credential records emitted by harvesters"
    ))
    .unwrap()
});

// Gauges
pub static ACTIVE_READERS: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!(Opts::new(
        "tcpasm_active_readers",
        "The number of reader tasks that have not reached cleanup"
    ))
    .unwrap()
});

/// Initialize all metrics with default values
pub fn init_metrics() {
    SEGMENTS_PROCESSED.inc_by(0.0);
    CONNECTIONS_TRACKED.inc_by(0.0);
    FLUSHED_HALVES.inc_by(0.0);
    SAVED_CONNECTIONS.inc_by(0.0);
    SAVED_STREAMS.inc_by(0.0);
    CREDENTIALS_HARVESTED.inc_by(0.0);
    ACTIVE_READERS.set(0);
}
