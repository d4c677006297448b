//! Config for client-side buffering, flushing and retry of batchable writes.

use std::{
    num::{NonZeroU32, NonZeroUsize},
    time::Duration,
};

/// CLI config for the batching client.
#[derive(Debug, Clone, Copy, clap::Parser)]
pub struct BatchingConfig {
    /// How often buffered operations are flushed to their region servers.
    ///
    /// A value of zero disables the periodic flush; buffered operations are
    /// then only sent when a buffer fills up or when an explicit flush is
    /// requested.
    #[clap(
        long = "flush-interval",
        env = "REGIONKV_FLUSH_INTERVAL",
        default_value = "1s",
        value_parser = humantime::parse_duration,
        action
    )]
    pub flush_interval: Duration,

    /// Number of operations queued for a single region after which that
    /// region's buffer is flushed without waiting for the next tick.
    #[clap(
        long = "buffer-max-operations",
        env = "REGIONKV_BUFFER_MAX_OPERATIONS",
        default_value = "1024",
        action
    )]
    pub buffer_max_operations: NonZeroUsize,

    /// Approximate payload bytes queued for a single region after which that
    /// region's buffer is flushed without waiting for the next tick.
    #[clap(
        long = "buffer-max-bytes",
        env = "REGIONKV_BUFFER_MAX_BYTES",
        default_value = "1048576",
        action
    )]
    pub buffer_max_bytes: NonZeroUsize,

    /// How long an empty region buffer is kept around before it is released.
    #[clap(
        long = "buffer-idle-timeout",
        env = "REGIONKV_BUFFER_IDLE_TIMEOUT",
        default_value = "60s",
        value_parser = humantime::parse_duration,
        action
    )]
    pub buffer_idle_timeout: Duration,

    /// Maximum number of times an operation is sent before it is failed.
    #[clap(
        long = "max-attempts",
        env = "REGIONKV_MAX_ATTEMPTS",
        default_value = "10",
        action
    )]
    pub max_attempts: NonZeroU32,

    /// Delay before the first re-send of a batch that hit a transport error.
    ///
    /// Later re-sends double the delay up to `--retry-max-backoff`.
    #[clap(
        long = "retry-initial-backoff",
        env = "REGIONKV_RETRY_INITIAL_BACKOFF",
        default_value = "50ms",
        value_parser = humantime::parse_duration,
        action
    )]
    pub retry_initial_backoff: Duration,

    /// Upper bound on the delay between re-sends.
    #[clap(
        long = "retry-max-backoff",
        env = "REGIONKV_RETRY_MAX_BACKOFF",
        default_value = "5s",
        value_parser = humantime::parse_duration,
        action
    )]
    pub retry_max_backoff: Duration,
}
