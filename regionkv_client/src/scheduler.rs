//! The periodic flush timer.

use std::{
    fmt::Debug,
    sync::{Arc, Weak},
    time::Duration,
};

use observability_deps::tracing::{debug, info};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Work performed on every tick of the flush timer.
pub(crate) trait FlushTarget: Debug + Send + Sync + 'static {
    fn flush_tick(self: Arc<Self>);
}

/// Holds the current flush interval. A zero interval disables the timer.
#[derive(Debug)]
pub(crate) struct FlushScheduler {
    interval: watch::Sender<Duration>,
}

impl FlushScheduler {
    pub(crate) fn new(interval: Duration) -> Self {
        let (interval, _) = watch::channel(interval);
        Self { interval }
    }

    /// Change the interval, returning the previous one.
    ///
    /// A running timer is restarted with the new interval, so the change
    /// takes effect without waiting for the pending tick.
    pub(crate) fn set_interval(&self, interval: Duration) -> Duration {
        let previous = self.interval.send_replace(interval);
        if previous != interval {
            info!(?previous, ?interval, "flush interval changed");
        }
        previous
    }

    pub(crate) fn interval(&self) -> Duration {
        *self.interval.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Duration> {
        self.interval.subscribe()
    }
}

/// Tick `target` every interval read from `interval` until `shutdown` is
/// cancelled, the interval sender is dropped or `target` is gone.
pub(crate) async fn run_flush_timer<T>(
    target: Weak<T>,
    mut interval: watch::Receiver<Duration>,
    shutdown: CancellationToken,
) where
    T: FlushTarget,
{
    loop {
        let period = *interval.borrow_and_update();

        if period.is_zero() {
            debug!("periodic flush disabled");
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                res = interval.changed() => match res {
                    Ok(()) => continue,
                    Err(_) => break,
                },
            }
        }

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            res = interval.changed() => match res {
                Ok(()) => continue,
                Err(_) => break,
            },
            _ = tokio::time::sleep(period) => {}
        }

        let Some(target) = target.upgrade() else {
            break;
        };
        target.flush_tick();
    }

    debug!("flush timer stopped");
}
