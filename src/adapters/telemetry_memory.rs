use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::adapters::telemetry::{
    ChannelError, SampleHandler, SubscriberRegistry, SubscriptionHandle, TelemetryChannel,
    TelemetrySample,
};
use crate::domain::models::RelayState;
use crate::domain::session_state::{Clock, TimestampMs};

/// Oldest relay commands are dropped beyond this many.
pub const COMMAND_LOG_CAPACITY: usize = 256;

/// How the simulated device answers the next relay command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Acknowledge,
    Timeout,
    Unreachable,
}

/// In-process channel: samples are pushed by the caller (or a
/// [`SampleSimulator`]) and relay commands are answered from a script
/// (acknowledged once the script runs out).
#[derive(Default)]
pub struct InMemoryTelemetryChannel {
    registry: SubscriberRegistry,
    script: Mutex<VecDeque<RelayOutcome>>,
    commands: Mutex<VecDeque<(String, RelayState)>>,
    fail_subscribe: AtomicBool,
}

impl InMemoryTelemetryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_relay(&self, outcome: RelayOutcome) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(outcome);
        }
    }

    pub fn fail_subscriptions(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    /// Delivers `sample` to every subscriber of its device; returns how many
    /// handlers ran.
    pub fn publish_sample(&self, sample: TelemetrySample) -> usize {
        self.registry.dispatch(&sample)
    }

    /// Sends one `voltage`/`current` sample to every subscribed device.
    /// Returns how many handlers ran.
    pub fn publish_to_subscribed(
        &self,
        voltage: f64,
        current: f64,
        timestamp: TimestampMs,
    ) -> usize {
        self.registry
            .subscribed_devices()
            .into_iter()
            .map(|device_id| {
                self.publish_sample(TelemetrySample {
                    device_id,
                    voltage,
                    current,
                    timestamp,
                })
            })
            .sum()
    }

    /// The most recent relay commands, oldest first, including unanswered
    /// ones. At most [`COMMAND_LOG_CAPACITY`] are kept.
    pub fn commands(&self) -> Vec<(String, RelayState)> {
        self.commands
            .lock()
            .map(|commands| commands.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self, device_id: &str) -> usize {
        self.registry.subscriber_count(device_id)
    }

    fn next_outcome(&self) -> Result<RelayOutcome, ChannelError> {
        let mut script = self.script.lock().map_err(|_| ChannelError::LockPoisoned)?;
        Ok(script.pop_front().unwrap_or(RelayOutcome::Acknowledge))
    }
}

impl TelemetryChannel for InMemoryTelemetryChannel {
    fn subscribe(
        &self,
        device_id: &str,
        on_sample: SampleHandler,
    ) -> Result<SubscriptionHandle, ChannelError> {
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(ChannelError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "simulated subscription failure",
            )));
        }
        self.registry.subscribe(device_id, on_sample)
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.registry.unsubscribe(handle);
    }

    fn publish_command(
        &self,
        device_id: &str,
        relay: RelayState,
        timeout: Duration,
    ) -> Result<(), ChannelError> {
        {
            let mut commands = self.commands.lock().map_err(|_| ChannelError::LockPoisoned)?;
            if commands.len() == COMMAND_LOG_CAPACITY {
                commands.pop_front();
            }
            commands.push_back((device_id.to_string(), relay));
        }

        match self.next_outcome()? {
            RelayOutcome::Acknowledge => Ok(()),
            RelayOutcome::Timeout => Err(ChannelError::Timeout {
                device_id: device_id.to_string(),
                timeout_ms: timeout.as_millis(),
            }),
            RelayOutcome::Unreachable => Err(ChannelError::UnknownDevice(device_id.to_string())),
        }
    }
}

/// Constant load reported by every simulated device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulatedLoad {
    pub voltage: f64,
    pub current: f64,
    pub interval: Duration,
}

/// Background thread standing in for devices when no hardware is attached:
/// every `interval` it publishes the configured load for each device that
/// has a subscriber.
pub struct SampleSimulator {
    stop_tx: Mutex<Option<mpsc::Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SampleSimulator {
    pub fn spawn(
        channel: Arc<InMemoryTelemetryChannel>,
        clock: Arc<dyn Clock>,
        load: SimulatedLoad,
    ) -> Result<Self, ChannelError> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let worker = std::thread::Builder::new()
            .name("telemetry-simulator".to_string())
            .spawn(move || {
                // A send or a dropped sender both end the loop.
                while let Err(mpsc::RecvTimeoutError::Timeout) = stop_rx.recv_timeout(load.interval)
                {
                    let delivered =
                        channel.publish_to_subscribed(load.voltage, load.current, clock.now());
                    if delivered > 0 {
                        tracing::trace!(delivered, "simulated samples published");
                    }
                }
                tracing::debug!("telemetry simulator stopped");
            })?;

        Ok(Self {
            stop_tx: Mutex::new(Some(stop_tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn shutdown(&self) {
        if let Ok(mut stop_tx) = self.stop_tx.lock() {
            stop_tx.take();
        }

        let worker = match self.worker.lock() {
            Ok(mut worker) => worker.take(),
            Err(_) => None,
        };
        if let Some(worker) = worker
            && worker.join().is_err()
        {
            tracing::error!("telemetry simulator thread panicked");
        }
    }
}

impl Drop for SampleSimulator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
