//! Periodic state polling.
//! Reads a device on a timer and turns snapshot differences into events.

use crate::device::DeviceSession;
use crate::error::Result;
use crate::state::{DeviceState, StateEvent};
use log::{debug, info, warn};
use std::future::Future;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Anything that can produce a state snapshot on demand.
pub trait StateSource: Send + Sync + 'static {
    fn read_state(&self) -> impl Future<Output = Result<DeviceState>> + Send;
}

impl StateSource for DeviceSession {
    fn read_state(&self) -> impl Future<Output = Result<DeviceState>> + Send {
        DeviceSession::read_state(self)
    }
}

/// A state change observed on one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollEvent {
    pub device_id: String,
    pub event: StateEvent,
}

/// Diffs consecutive snapshots of one device.
pub struct PollingEngine<S> {
    device_id: String,
    source: S,
    previous: Option<DeviceState>,
}

impl<S: StateSource> PollingEngine<S> {
    pub fn new(device_id: impl Into<String>, source: S) -> Self {
        Self {
            device_id: device_id.into(),
            source,
            previous: None,
        }
    }

    /// Last successfully read snapshot.
    pub fn snapshot(&self) -> Option<&DeviceState> {
        self.previous.as_ref()
    }

    /// Poll once.
    ///
    /// The first successful read only establishes the baseline. A failed
    /// read is logged and leaves the previous snapshot in place.
    pub async fn tick(&mut self) -> Vec<StateEvent> {
        let current = match self.source.read_state().await {
            Ok(state) => state,
            Err(e) => {
                warn!("Poll of {} failed, keeping last state: {}", self.device_id, e);
                return Vec::new();
            }
        };

        let events = match &self.previous {
            Some(previous) => current.diff(previous),
            None => {
                debug!("Baseline for {}: {} fields", self.device_id, current.len());
                Vec::new()
            }
        };
        self.previous = Some(current);
        events
    }

    /// Run on a timer until `token` is cancelled.
    ///
    /// Ticks that come due while a read is still outstanding are skipped.
    pub fn spawn(
        mut self,
        interval: Duration,
        events: broadcast::Sender<PollEvent>,
        token: CancellationToken,
    ) -> PollHandle {
        let task_token = token.clone();
        let task = tokio::spawn(async move {
            info!("Polling {} every {:?}", self.device_id, interval);
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let changes = tokio::select! {
                    _ = task_token.cancelled() => break,
                    changes = self.tick() => changes,
                };
                for event in changes {
                    debug!("{}: {:?}", self.device_id, event);
                    let _ = events.send(PollEvent {
                        device_id: self.device_id.clone(),
                        event,
                    });
                }
            }
            info!("Stopped polling {}", self.device_id);
        });
        PollHandle { token, task }
    }
}

/// Handle to a running polling task.
pub struct PollHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl PollHandle {
    /// Request the task to stop; an in-flight read is abandoned.
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop and wait for the task to exit.
    pub async fn join(self) {
        self.token.cancel();
        let _ = self.task.await;
    }
}
