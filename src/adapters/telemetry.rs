use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;

use crate::domain::models::RelayState;
use crate::domain::session_state::TimestampMs;

#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySample {
    pub device_id: String,
    pub voltage: f64,
    pub current: f64,
    pub timestamp: TimestampMs,
}

pub type SampleHandler = Arc<dyn Fn(TelemetrySample) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    pub fn id(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("relay command to {device_id} not acknowledged within {timeout_ms} ms")]
    Timeout { device_id: String, timeout_ms: u128 },
    #[error("device {0} has not been seen on the telemetry channel")]
    UnknownDevice(String),
    #[error("device {device_id} acknowledged relay {actual}, expected {expected}")]
    Rejected {
        device_id: String,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("telemetry channel closed before {device_id} acknowledged the relay command")]
    Closed { device_id: String },
    #[error("telemetry channel io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode relay command: {0}")]
    Json(#[from] serde_json::Error),
    #[error("telemetry channel state lock poisoned")]
    LockPoisoned,
}

/// Publish/subscribe transport between the controller and charging devices.
pub trait TelemetryChannel: Send + Sync + 'static {
    /// Registers `on_sample` for every sample `device_id` reports from now on.
    fn subscribe(
        &self,
        device_id: &str,
        on_sample: SampleHandler,
    ) -> Result<SubscriptionHandle, ChannelError>;

    /// Unknown or already removed handles are ignored.
    fn unsubscribe(&self, handle: SubscriptionHandle);

    /// Sends a relay command and blocks until the device acknowledges it or
    /// `timeout` elapses.
    fn publish_command(
        &self,
        device_id: &str,
        relay: RelayState,
        timeout: Duration,
    ) -> Result<(), ChannelError>;
}

/// Subscriber bookkeeping shared by the channel implementations.
#[derive(Default)]
pub struct SubscriberRegistry {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, (String, SampleHandler)>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &self,
        device_id: &str,
        on_sample: SampleHandler,
    ) -> Result<SubscriptionHandle, ChannelError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut subscribers = self
            .subscribers
            .lock()
            .map_err(|_| ChannelError::LockPoisoned)?;
        subscribers.insert(id, (device_id.to_string(), on_sample));
        Ok(SubscriptionHandle(id))
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        match self.subscribers.lock() {
            Ok(mut subscribers) => {
                subscribers.remove(&handle.0);
            }
            Err(_) => {
                tracing::error!(
                    subscription = handle.0,
                    "subscriber registry lock poisoned during unsubscribe"
                );
            }
        }
    }

    pub fn subscriber_count(&self, device_id: &str) -> usize {
        self.subscribers
            .lock()
            .map(|subscribers| {
                subscribers
                    .values()
                    .filter(|(subscribed_device, _)| subscribed_device == device_id)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Distinct devices with at least one subscriber, sorted.
    pub fn subscribed_devices(&self) -> Vec<String> {
        let mut devices: Vec<String> = self
            .subscribers
            .lock()
            .map(|subscribers| {
                subscribers
                    .values()
                    .map(|(device_id, _)| device_id.clone())
                    .collect()
            })
            .unwrap_or_default();
        devices.sort();
        devices.dedup();
        devices
    }

    /// Handlers run after the registry lock is released so they may
    /// unsubscribe themselves.
    pub fn dispatch(&self, sample: &TelemetrySample) -> usize {
        let handlers: Vec<SampleHandler> = match self.subscribers.lock() {
            Ok(subscribers) => subscribers
                .values()
                .filter(|(device_id, _)| device_id == &sample.device_id)
                .map(|(_, handler)| Arc::clone(handler))
                .collect(),
            Err(_) => {
                tracing::error!("subscriber registry lock poisoned during dispatch");
                return 0;
            }
        };

        for handler in &handlers {
            handler(sample.clone());
        }

        handlers.len()
    }
}
