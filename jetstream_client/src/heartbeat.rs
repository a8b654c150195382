//! Liveness detection for consumers that promise idle heartbeats. A timer
//! task counts the beats we did *not* see; every frame on the subscription
//! calls [IdleHeartbeatMonitor::work] to reset the count.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_MAX_OUT: usize = 2;

/// Invoked from the timer task once the miss count reaches `max_out`;
/// returning false stops the monitor.
pub type MissHandler = Box<dyn FnMut(usize) -> bool + Send>;

pub struct IdleHeartbeatMonitor {
    missed: Arc<AtomicUsize>,
    cancel: CancellationToken,
    reconfigure: watch::Sender<(Duration, Option<Duration>)>,
}

impl IdleHeartbeatMonitor {
    pub fn new(
        interval: Duration,
        max_out: usize,
        cancel_after: Option<Duration>,
        handler: MissHandler,
    ) -> Self {
        let missed = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let (reconfigure, config) = watch::channel((interval, cancel_after));

        tokio::spawn(run(missed.clone(), cancel.clone(), config, max_out, handler));

        Self {
            missed,
            cancel,
            reconfigure,
        }
    }

    /// A sign of life was observed; start counting from zero again.
    pub fn work(&self) {
        self.missed.store(0, Ordering::Relaxed);
    }

    /// Swaps interval and lifetime bound without losing the handler. Also
    /// resets the miss count.
    pub fn change(&self, interval: Duration, cancel_after: Option<Duration>) {
        self.missed.store(0, Ordering::Relaxed);
        let _ = self.reconfigure.send((interval, cancel_after));
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for IdleHeartbeatMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(
    missed: Arc<AtomicUsize>,
    cancel: CancellationToken,
    mut config: watch::Receiver<(Duration, Option<Duration>)>,
    max_out: usize,
    mut handler: MissHandler,
) {
    let (mut interval, mut cancel_after) = *config.borrow();
    let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
    let mut deadline = cancel_after.map(|after| time::Instant::now() + after);

    loop {
        let expiry = async {
            match deadline {
                Some(at) => time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = expiry => {
                log::debug!("heartbeat monitor reached its lifetime bound");
                break;
            }
            changed = config.changed() => {
                if changed.is_err() {
                    break;
                }
                (interval, cancel_after) = *config.borrow_and_update();
                ticker = time::interval_at(time::Instant::now() + interval, interval);
                deadline = cancel_after.map(|after| time::Instant::now() + after);
            }
            _ = ticker.tick() => {
                let count = missed.fetch_add(1, Ordering::Relaxed) + 1;
                if count >= max_out && !handler(count) {
                    break;
                }
            }
        }
    }
}
