//! Periodic reporters for transfer speed and queue state

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ripper::data_service::DataService;
use crate::ripper::error::RipperResult;
use crate::ripper::event_bus::{Event, EventBus};
use crate::ripper::job_queue::JobQueue;
use crate::ripper::models::GlobalState;

pub const SPEED_INTERVAL: Duration = Duration::from_secs(1);
pub const GLOBAL_STATE_INTERVAL: Duration = Duration::from_secs(3);

/// Byte counter shared by every worker
#[derive(Debug, Default)]
pub struct ThroughputMeter {
    bytes: AtomicU64,
}

impl ThroughputMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Read and reset the accumulated byte count
    pub fn take(&self) -> u64 {
        self.bytes.swap(0, Ordering::Relaxed)
    }
}

/// Publish `BytesPerSecond` once per second whenever the rate changes
pub fn spawn_speed_reporter(
    meter: Arc<ThroughputMeter>,
    event_bus: EventBus,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(SPEED_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        let mut last = 0;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let rate = meter.take();
                    if rate != last {
                        event_bus.publish(Event::BytesPerSecond(rate));
                        last = rate;
                    }
                }
            }
        }
        debug!("Speed reporter stopped");
    })
}

/// Tracks running, queued and failed work
pub struct GlobalStateMonitor {
    queue: Arc<JobQueue>,
    data: Arc<DataService>,
    event_bus: EventBus,
}

impl GlobalStateMonitor {
    pub fn new(queue: Arc<JobQueue>, data: Arc<DataService>, event_bus: EventBus) -> Self {
        Self {
            queue,
            data,
            event_bus,
        }
    }

    pub fn snapshot(&self) -> RipperResult<GlobalState> {
        Ok(GlobalState {
            running: self.queue.running_count(),
            remaining: self.queue.pending_count(),
            error: self.data.count_error_images()?,
        })
    }

    /// Publish `GlobalState` every few seconds whenever it changed
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(GLOBAL_STATE_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last: Option<GlobalState> = None;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => match self.snapshot() {
                        Ok(state) if last != Some(state) => {
                            self.event_bus.publish(Event::GlobalState(state));
                            last = Some(state);
                        }
                        Ok(_) => {}
                        Err(e) => warn!("Failed to compute global state: {}", e),
                    }
                }
            }
            debug!("Global state monitor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meter_take_resets() {
        let meter = ThroughputMeter::new();
        meter.record(10);
        meter.record(5);
        assert_eq!(meter.take(), 15);
        assert_eq!(meter.take(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_speed_reporter_publishes_changes_only() {
        let meter = Arc::new(ThroughputMeter::new());
        let bus = EventBus::new();
        let events = bus.subscribe();
        let shutdown = CancellationToken::new();
        let handle = spawn_speed_reporter(meter.clone(), bus, shutdown.clone());

        meter.record(2048);
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(events.try_recv().unwrap(), Event::BytesPerSecond(2048));

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(events.try_recv().unwrap(), Event::BytesPerSecond(0));

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(events.try_recv().is_err());

        shutdown.cancel();
        handle.await.unwrap();
    }
}
