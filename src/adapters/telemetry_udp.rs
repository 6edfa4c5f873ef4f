//! JSON-over-UDP transport for charging devices.
//!
//! Devices send readings (`{"deviceId","voltage","current","timestamp"}`, either
//! measurement may come alone) and relay acks (`{"deviceId","ack","relay","commandId"}`)
//! to one socket. Relay commands (`{"deviceId","relay","commandId"}`) go back to
//! the address a device last reported from. Each command waits on its own
//! `(deviceId, commandId)` entry, so overlapping commands to one device do not
//! steal each other's acks.

use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::adapters::telemetry::{
    ChannelError, SampleHandler, SubscriberRegistry, SubscriptionHandle, TelemetryChannel,
    TelemetrySample,
};
use crate::domain::models::RelayState;
use crate::domain::session_state::Clock;
use crate::domain::telemetry_payload::{
    DeviceMessage, DeviceReading, parse_device_message, relay_command_payload,
};

const UDP_BUFFER_SIZE: usize = 4096;
const RECV_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy)]
struct DeviceState {
    addr: SocketAddr,
    voltage: Option<f64>,
    current: Option<f64>,
}

struct PendingAck {
    relay: RelayState,
    waiter: mpsc::Sender<RelayState>,
}

type PendingAcks = HashMap<(String, u64), PendingAck>;

struct Shared {
    socket: UdpSocket,
    registry: SubscriberRegistry,
    devices: Mutex<HashMap<String, DeviceState>>,
    next_command_id: AtomicU64,
    pending_acks: Mutex<PendingAcks>,
    clock: Arc<dyn Clock>,
    stop_flag: AtomicBool,
}

pub struct UdpTelemetryChannel {
    shared: Arc<Shared>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl UdpTelemetryChannel {
    pub fn bind(bind: &str, clock: Arc<dyn Clock>) -> Result<Self, ChannelError> {
        let socket = UdpSocket::bind(bind)?;
        socket.set_read_timeout(Some(RECV_POLL_INTERVAL))?;

        let shared = Arc::new(Shared {
            socket,
            registry: SubscriberRegistry::new(),
            devices: Mutex::new(HashMap::new()),
            next_command_id: AtomicU64::new(0),
            pending_acks: Mutex::new(HashMap::new()),
            clock,
            stop_flag: AtomicBool::new(false),
        });

        // Samples are dispatched off the receive thread so a handler that
        // sends a relay command does not block the ack it is waiting for.
        let (sample_tx, sample_rx) = mpsc::channel::<TelemetrySample>();

        let dispatch_shared = Arc::clone(&shared);
        std::thread::Builder::new()
            .name("telemetry-dispatch".to_string())
            .spawn(move || {
                for sample in sample_rx {
                    dispatch_shared.registry.dispatch(&sample);
                }
            })?;

        let receive_shared = Arc::clone(&shared);
        let receiver = std::thread::Builder::new()
            .name("telemetry-udp".to_string())
            .spawn(move || receive_loop(&receive_shared, &sample_tx))?;

        Ok(Self {
            shared,
            receiver: Mutex::new(Some(receiver)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ChannelError> {
        self.shared.socket.local_addr().map_err(ChannelError::from)
    }

    /// Stops the receive thread. Commands still waiting for an ack fail with
    /// `ChannelError::Closed`.
    pub fn shutdown(&self) {
        self.shared.stop_flag.store(true, Ordering::Relaxed);
        if let Ok(mut pending) = self.shared.pending_acks.lock() {
            pending.clear();
        }

        let handle = match self.receiver.lock() {
            Ok(mut receiver) => receiver.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle
            && handle.thread().id() != std::thread::current().id()
            && handle.join().is_err()
        {
            tracing::error!("telemetry receive thread panicked");
        }
    }

    fn device_addr(&self, device_id: &str) -> Result<SocketAddr, ChannelError> {
        let devices = self
            .shared
            .devices
            .lock()
            .map_err(|_| ChannelError::LockPoisoned)?;
        devices
            .get(device_id)
            .map(|state| state.addr)
            .ok_or_else(|| ChannelError::UnknownDevice(device_id.to_string()))
    }
}

impl Drop for UdpTelemetryChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl TelemetryChannel for UdpTelemetryChannel {
    fn subscribe(
        &self,
        device_id: &str,
        on_sample: SampleHandler,
    ) -> Result<SubscriptionHandle, ChannelError> {
        self.shared.registry.subscribe(device_id, on_sample)
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.shared.registry.unsubscribe(handle);
    }

    fn publish_command(
        &self,
        device_id: &str,
        relay: RelayState,
        timeout: Duration,
    ) -> Result<(), ChannelError> {
        let addr = self.device_addr(device_id)?;

        let command_id = self.shared.next_command_id.fetch_add(1, Ordering::Relaxed) + 1;
        let key = (device_id.to_string(), command_id);
        let (ack_tx, ack_rx) = mpsc::channel();
        self.shared
            .pending_acks
            .lock()
            .map_err(|_| ChannelError::LockPoisoned)?
            .insert(
                key.clone(),
                PendingAck {
                    relay,
                    waiter: ack_tx,
                },
            );

        let payload = serde_json::to_vec(&relay_command_payload(device_id, relay, command_id))?;
        if let Err(error) = self.shared.socket.send_to(&payload, addr) {
            self.forget_pending(&key);
            return Err(ChannelError::Io(error));
        }

        tracing::debug!(
            device_id,
            command_id,
            relay = relay.as_str(),
            %addr,
            "relay command sent"
        );

        match ack_rx.recv_timeout(timeout) {
            Ok(acknowledged) if acknowledged == relay => Ok(()),
            Ok(acknowledged) => Err(ChannelError::Rejected {
                device_id: device_id.to_string(),
                expected: relay.as_str(),
                actual: acknowledged.as_str(),
            }),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                self.forget_pending(&key);
                Err(ChannelError::Timeout {
                    device_id: device_id.to_string(),
                    timeout_ms: timeout.as_millis(),
                })
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                self.forget_pending(&key);
                Err(ChannelError::Closed {
                    device_id: device_id.to_string(),
                })
            }
        }
    }
}

impl UdpTelemetryChannel {
    /// Removes only this command's waiter; other commands to the same device
    /// keep theirs.
    fn forget_pending(&self, key: &(String, u64)) {
        if let Ok(mut pending) = self.shared.pending_acks.lock() {
            pending.remove(key);
        }
    }
}

fn receive_loop(shared: &Shared, sample_tx: &mpsc::Sender<TelemetrySample>) {
    let mut buffer = [0_u8; UDP_BUFFER_SIZE];

    while !shared.stop_flag.load(Ordering::Relaxed) {
        let (size, from) = match shared.socket.recv_from(&mut buffer) {
            Ok(tuple) => tuple,
            Err(error)
                if matches!(
                    error.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                continue;
            }
            Err(error) => {
                tracing::warn!(error = %error, "telemetry socket receive failed");
                continue;
            }
        };

        let message = match serde_json::from_slice::<serde_json::Value>(&buffer[..size])
            .map_err(|error| error.to_string())
            .and_then(|value| parse_device_message(&value).map_err(|error| error.to_string()))
        {
            Ok(message) => message,
            Err(error) => {
                tracing::warn!(%from, error = %error, "discarding malformed device datagram");
                continue;
            }
        };

        match message {
            DeviceMessage::RelayAck {
                device_id,
                relay,
                command_id,
            } => {
                remember_device(shared, &device_id, from);
                handle_ack(shared, &device_id, relay, command_id);
            }
            DeviceMessage::Reading(reading) => {
                if let Some(sample) = merge_reading(shared, reading, from)
                    && sample_tx.send(sample).is_err()
                {
                    tracing::error!("telemetry dispatcher stopped; receive loop exiting");
                    return;
                }
            }
        }
    }
}

fn remember_device(shared: &Shared, device_id: &str, from: SocketAddr) {
    if let Ok(mut devices) = shared.devices.lock() {
        devices
            .entry(device_id.to_string())
            .and_modify(|state| state.addr = from)
            .or_insert(DeviceState {
                addr: from,
                voltage: None,
                current: None,
            });
    }
}

fn handle_ack(shared: &Shared, device_id: &str, relay: RelayState, command_id: Option<u64>) {
    let waiter = shared
        .pending_acks
        .lock()
        .ok()
        .and_then(|mut pending| take_waiter(&mut pending, device_id, relay, command_id));

    match waiter {
        Some(waiter) => {
            let _ = waiter.send(relay);
        }
        None => {
            tracing::debug!(
                device_id,
                command_id,
                relay = relay.as_str(),
                "unsolicited relay ack ignored"
            );
        }
    }
}

/// An ack carrying a command id only resolves that command. Without one it
/// goes to the oldest command expecting the same relay state, falling back to
/// the oldest command for the device, which then reports a rejection.
fn take_waiter(
    pending: &mut PendingAcks,
    device_id: &str,
    relay: RelayState,
    command_id: Option<u64>,
) -> Option<mpsc::Sender<RelayState>> {
    let key = match command_id {
        Some(command_id) => (device_id.to_string(), command_id),
        None => {
            let oldest = |same_relay: bool| {
                pending
                    .iter()
                    .filter(|((pending_device, _), ack)| {
                        pending_device == device_id && (!same_relay || ack.relay == relay)
                    })
                    .map(|((_, id), _)| *id)
                    .min()
            };
            let id = oldest(true).or_else(|| oldest(false))?;
            (device_id.to_string(), id)
        }
    };

    pending.remove(&key).map(|ack| ack.waiter)
}

/// Folds a possibly partial reading into the device's last known values and
/// returns a sample once both voltage and current are known.
fn merge_reading(
    shared: &Shared,
    reading: DeviceReading,
    from: SocketAddr,
) -> Option<TelemetrySample> {
    let mut devices = shared.devices.lock().ok()?;
    let state = devices
        .entry(reading.device_id.clone())
        .or_insert(DeviceState {
            addr: from,
            voltage: None,
            current: None,
        });
    state.addr = from;
    if reading.voltage.is_some() {
        state.voltage = reading.voltage;
    }
    if reading.current.is_some() {
        state.current = reading.current;
    }

    let (voltage, current) = (state.voltage?, state.current?);
    Some(TelemetrySample {
        device_id: reading.device_id,
        voltage,
        current,
        timestamp: reading.timestamp.unwrap_or_else(|| shared.clock.now()),
    })
}
