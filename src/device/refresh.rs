use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type Tick = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Throttled periodic task that can be started and stopped repeatedly.
///
/// The first tick fires as soon as the task starts; after that at most one
/// tick runs per interval.
pub struct Refresher {
    interval: Duration,
    tick: Tick,
    task: Mutex<Option<CancellationToken>>,
}

impl std::fmt::Debug for Refresher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Refresher")
            .field("interval", &self.interval)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Refresher {
    pub fn new<F, Fut>(interval: Duration, tick: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Refresher {
            interval,
            tick: Arc::new(move || tick().boxed()),
            task: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    /// Starts ticking; does nothing when already running
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                warn!("Cannot start refresher outside a runtime: {}", e);
                return;
            }
        };

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let tick = self.tick.clone();
        let period = self.interval;

        runtime.spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = cancelled.cancelled() => break,
                    _ = async {
                        ticker.tick().await;
                        tick().await;
                    } => {}
                }
            }
            debug!("Refresher stopped");
        });

        *task = Some(token);
    }

    pub fn stop(&self) {
        if let Some(token) = self.task.lock().take() {
            token.cancel();
        }
    }
}

impl Drop for Refresher {
    fn drop(&mut self) {
        self.stop();
    }
}
