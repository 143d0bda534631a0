//! Sleep/wake monitoring.
//!
//! The supervisor owns the actual power-management subscription (IOKit on
//! the host) and feeds transitions in through [`SleepWakeMonitor::notify`].
//! Consumers subscribe to the two broadcast channels: on wake the guest
//! clock is resynced twice across a short burst window, and licensing /
//! heartbeat failures are suppressed for a startup-equivalent grace period
//! around the transition.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tracing::{debug, info};

/// Failure suppression window after a wake.
pub const WAKE_GRACE: Duration = Duration::from_secs(120);

/// Gap between the two post-wake clock resyncs.
pub const CLOCK_BURST_WINDOW: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerEvent {
    Sleep,
    Wake,
}

/// Something that can nudge the guest clock; the wake handler calls it
/// twice per transition.
pub trait ClockSync: Send + Sync {
    fn resync(&self);
}

pub struct SleepWakeMonitor {
    sleep_tx: broadcast::Sender<()>,
    wake_tx: broadcast::Sender<()>,
    sleeping: AtomicBool,
    last_wake: Mutex<Option<Instant>>,
}

impl SleepWakeMonitor {
    pub fn new() -> Arc<Self> {
        let (sleep_tx, _) = broadcast::channel(4);
        let (wake_tx, _) = broadcast::channel(4);
        Arc::new(Self {
            sleep_tx,
            wake_tx,
            sleeping: AtomicBool::new(false),
            last_wake: Mutex::new(None),
        })
    }

    /// Deliver a transition from the platform notifier.
    pub fn notify(&self, event: PowerEvent) {
        match event {
            PowerEvent::Sleep => {
                info!("host is going to sleep");
                self.sleeping.store(true, Ordering::Release);
                let _ = self.sleep_tx.send(());
            }
            PowerEvent::Wake => {
                info!("host woke up");
                self.sleeping.store(false, Ordering::Release);
                *self.last_wake.lock().expect("wake clock poisoned") = Some(Instant::now());
                let _ = self.wake_tx.send(());
            }
        }
    }

    pub fn subscribe_sleep(&self) -> broadcast::Receiver<()> {
        self.sleep_tx.subscribe()
    }

    pub fn subscribe_wake(&self) -> broadcast::Receiver<()> {
        self.wake_tx.subscribe()
    }

    /// True while asleep or inside the post-wake grace window; license
    /// checks and heartbeats treat failures as benign then.
    pub fn suppress_failures(&self) -> bool {
        if self.sleeping.load(Ordering::Acquire) {
            return true;
        }
        self.last_wake
            .lock()
            .expect("wake clock poisoned")
            .map(|at| at.elapsed() < WAKE_GRACE)
            .unwrap_or(false)
    }

    /// Spawn the wake consumer: two clock resyncs per wake, a burst apart.
    pub fn spawn_wake_clock_sync(self: &Arc<Self>, clock: Arc<dyn ClockSync>) {
        let mut wake_rx = self.subscribe_wake();
        tokio::spawn(async move {
            while wake_rx.recv().await.is_ok() {
                debug!("post-wake clock resync burst");
                clock.resync();
                tokio::time::sleep(CLOCK_BURST_WINDOW).await;
                clock.resync();
            }
        });
    }
}
