use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde_json::json;
use thiserror::Error;

use crate::adapters::telemetry::{
    ChannelError, SampleHandler, SubscriptionHandle, TelemetryChannel, TelemetrySample,
};
use crate::app::services::{QueryError, ServiceError, SessionQueryService, SessionStore};
use crate::domain::metering::{MeterUpdate, MeteringEngine};
use crate::domain::models::{
    NewLogEventRecord, NewSession, RelayState, Session, SessionStatus, SessionUpdate, StopReason,
    derive_session_id,
};
use crate::domain::session_state::{Clock, SessionEvent, TimestampMs, next_status};

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("invalid start request: {0}")]
    InvalidRequest(String),
    #[error("a session already exists for transaction {0}")]
    DuplicateTransaction(String),
    #[error("actuator unavailable for {session_id}: {source}")]
    ActuatorUnavailable {
        session_id: String,
        #[source]
        source: ChannelError,
    },
    #[error("telemetry unavailable for {session_id}: {source}")]
    TelemetryUnavailable {
        session_id: String,
        #[source]
        source: ChannelError,
    },
    #[error("session {0} was stopped before it became active")]
    Cancelled(String),
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("session store failed: {0}")]
    Store(#[from] ServiceError),
    #[error("session state lock poisoned")]
    LockPoisoned,
}

impl From<QueryError> for ControllerError {
    fn from(error: QueryError) -> Self {
        match error {
            QueryError::NotFound(key) => Self::NotFound(key),
            QueryError::Service(error) => Self::Store(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryOutcome {
    /// No live session matched, or it already finished.
    Dropped,
    Metered(MeterUpdate),
    Stopped(StopReason),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StartRequest {
    pub transaction_id: String,
    pub device_id: String,
    pub budget: f64,
    pub energy_cap_kwh: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControllerSettings {
    pub rate_per_kwh: f64,
    pub actuator_timeout: Duration,
    pub enforce_energy_cap: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerDiagnostics {
    pub live_sessions: usize,
    pub stale_samples_dropped: u64,
}

struct LiveSession {
    device_id: String,
    engine: MeteringEngine,
    /// Last known record, returned when the final write cannot be persisted.
    snapshot: Session,
    subscription: Option<SubscriptionHandle>,
    finished: bool,
}

/// Drives sessions from start to their terminal state. Samples and stops for
/// one session are serialized by that session's mutex.
pub struct SessionController {
    store: Arc<dyn SessionStore>,
    queries: SessionQueryService,
    channel: Arc<dyn TelemetryChannel>,
    clock: Arc<dyn Clock>,
    settings: ControllerSettings,
    live: Mutex<HashMap<String, Arc<Mutex<LiveSession>>>>,
    stale_samples_dropped: AtomicU64,
    this: Weak<SessionController>,
}

impl SessionController {
    pub fn new(
        store: Arc<dyn SessionStore>,
        channel: Arc<dyn TelemetryChannel>,
        clock: Arc<dyn Clock>,
        settings: ControllerSettings,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            queries: SessionQueryService::new(Arc::clone(&store)),
            store,
            channel,
            clock,
            settings,
            live: Mutex::new(HashMap::new()),
            stale_samples_dropped: AtomicU64::new(0),
            this: this.clone(),
        })
    }

    pub fn start(&self, request: StartRequest) -> Result<Session, ControllerError> {
        validate_start(&request)?;

        let session_id = derive_session_id(&request.transaction_id);
        let started_at = self.clock.now();
        let engine = MeteringEngine::new(
            self.settings.rate_per_kwh,
            request.budget,
            request.energy_cap_kwh,
        )
        .map_err(|error| ControllerError::InvalidRequest(error.to_string()))?;

        let new_session = NewSession {
            transaction_id: request.transaction_id.clone(),
            session_id: session_id.clone(),
            device_id: request.device_id.clone(),
            started_at: started_at.to_iso8601(),
            budget: request.budget,
            energy_cap_kwh: request.energy_cap_kwh,
            rate_per_kwh: self.settings.rate_per_kwh,
        };
        let created = self.store.create_if_absent(&new_session)?;
        if !created {
            tracing::info!(
                transaction_id = %request.transaction_id,
                "start rejected: transaction already has a session"
            );
            return Err(ControllerError::DuplicateTransaction(request.transaction_id));
        }

        tracing::info!(
            session_id = %session_id,
            device_id = %request.device_id,
            budget = request.budget,
            energy_cap_kwh = request.energy_cap_kwh,
            "session created, switching relay on"
        );

        if let Err(error) = self.command_relay(&request.device_id, RelayState::On) {
            tracing::warn!(
                session_id = %session_id,
                device_id = %request.device_id,
                error = %error,
                "relay on failed, aborting session"
            );
            self.abort_pending(
                &session_id,
                StopReason::ActuatorUnavailable,
                Some(error.to_string()),
            );
            self.record_event(
                "error",
                "ACTUATOR_UNAVAILABLE",
                "relay did not acknowledge ON",
                &session_id,
                &request.device_id,
                Some(json!({ "error": error.to_string() })),
            );
            return Err(ControllerError::ActuatorUnavailable { session_id, source: error });
        }

        let live = Arc::new(Mutex::new(LiveSession {
            device_id: request.device_id.clone(),
            engine,
            snapshot: Session::from_new(&new_session),
            subscription: None,
            finished: false,
        }));
        let mut live_guard = live.lock().map_err(|_| ControllerError::LockPoisoned)?;
        self.live_sessions()?
            .insert(session_id.clone(), Arc::clone(&live));

        let handle = match self
            .channel
            .subscribe(&request.device_id, self.sample_handler(&session_id))
        {
            Ok(handle) => handle,
            Err(error) => {
                live_guard.finished = true;
                self.forget_live(&session_id);
                tracing::warn!(
                    session_id = %session_id,
                    error = %error,
                    "telemetry subscription failed, aborting session"
                );
                let off_error = self.command_relay(&request.device_id, RelayState::Off).err();
                self.abort_pending(
                    &session_id,
                    StopReason::TelemetryUnavailable,
                    off_error.map(|off| off.to_string()),
                );
                self.record_event(
                    "error",
                    "TELEMETRY_UNAVAILABLE",
                    "telemetry subscription failed",
                    &session_id,
                    &request.device_id,
                    Some(json!({ "error": error.to_string() })),
                );
                return Err(ControllerError::TelemetryUnavailable { session_id, source: error });
            }
        };
        live_guard.subscription = Some(handle);

        let mut activation = SessionUpdate::guarded(SessionStatus::Pending, self.now_iso());
        activation.status = next_status(SessionStatus::Pending, SessionEvent::Activated);
        activation.relay_state = Some(RelayState::On);

        let activated = self.store.update(&session_id, &activation);
        if !matches!(activated, Ok(true)) {
            live_guard.finished = true;
            self.forget_live(&session_id);
            self.channel.unsubscribe(handle);
            if let Err(error) = self.command_relay(&request.device_id, RelayState::Off) {
                tracing::warn!(
                    session_id = %session_id,
                    error = %error,
                    "relay off after aborted activation not confirmed"
                );
            }
            activated?;
            tracing::info!(session_id = %session_id, "session cancelled while starting");
            return Err(ControllerError::Cancelled(session_id));
        }
        live_guard.snapshot.apply(&activation);
        drop(live_guard);

        tracing::info!(
            session_id = %session_id,
            subscription = handle.id(),
            "session active"
        );
        Ok(self.queries.get_by_session_id(&session_id)?)
    }

    /// Feeds one sample into the session's meter and stops the session once
    /// its budget (or, when enforced, its energy cap) is used up.
    pub fn on_telemetry_sample(
        &self,
        session_id: &str,
        voltage: f64,
        current: f64,
        timestamp: TimestampMs,
    ) -> TelemetryOutcome {
        let Some(live) = self.find_live(session_id) else {
            self.drop_stale(session_id);
            return TelemetryOutcome::Dropped;
        };
        let Ok(mut live_guard) = live.lock() else {
            tracing::error!(session_id, "live session lock poisoned, sample dropped");
            return TelemetryOutcome::Dropped;
        };
        if live_guard.finished {
            self.drop_stale(session_id);
            return TelemetryOutcome::Dropped;
        }

        let update = live_guard.engine.ingest_sample(voltage, current, timestamp);

        let mut write = SessionUpdate::guarded(SessionStatus::Active, self.now_iso());
        write.cumulative_energy_kwh = Some(update.energy_kwh);
        write.cumulative_cost = Some(update.cost);
        write.last_voltage = Some(voltage);
        write.last_current = Some(current);
        write.last_sample_at = Some(timestamp.to_iso8601());
        write.last_power_w = Some(update.power_w);
        match self.store.update(session_id, &write) {
            Ok(true) => live_guard.snapshot.apply(&write),
            Ok(false) => tracing::warn!(session_id, "meter update skipped, session not active"),
            Err(error) => {
                tracing::warn!(session_id, error = %error, "failed to persist meter update");
                live_guard.snapshot.apply(&write);
            }
        }

        let stop_reason = if update.budget_exceeded {
            Some(StopReason::BudgetExhausted)
        } else if update.energy_cap_reached && self.settings.enforce_energy_cap {
            Some(StopReason::EnergyCapReached)
        } else {
            None
        };

        let Some(reason) = stop_reason else {
            return TelemetryOutcome::Metered(update);
        };

        tracing::info!(
            session_id,
            energy_kwh = update.energy_kwh,
            cost = update.cost,
            reason = reason.as_str(),
            "limit reached, stopping session"
        );
        let device_id = live_guard.device_id.clone();
        self.finish_live(session_id, &mut live_guard, reason);
        self.record_event(
            "info",
            reason.as_str(),
            "session stopped automatically",
            session_id,
            &device_id,
            Some(json!({ "energyKWh": update.energy_kwh, "cost": update.cost })),
        );

        TelemetryOutcome::Stopped(reason)
    }

    /// Idempotent: a finished session is returned unchanged. Once the relay
    /// has been commanded OFF a failed final write is logged, not returned;
    /// the caller gets the last known record with the stop applied.
    pub fn stop(&self, session_id: &str, reason: StopReason) -> Result<Session, ControllerError> {
        if let Some(live) = self.find_live(session_id) {
            let mut live_guard = live.lock().map_err(|_| ControllerError::LockPoisoned)?;
            if !live_guard.finished {
                return Ok(self.finish_live(session_id, &mut live_guard, reason));
            }
        }

        let session = self.queries.get_by_session_id(session_id)?;
        if session.status.is_terminal() {
            return Ok(session);
        }
        let event = if session.status == SessionStatus::Pending {
            SessionEvent::Cancelled
        } else {
            SessionEvent::Stopped
        };

        if session.status == SessionStatus::Active {
            tracing::warn!(session_id, "stopping active session without a live meter");
        }
        let actuator_error = self
            .command_relay(&session.device_id, RelayState::Off)
            .err()
            .map(|error| error.to_string());

        let mut write = SessionUpdate::guarded(session.status, self.now_iso());
        write.status = next_status(session.status, event);
        write.relay_state = Some(RelayState::Off);
        write.ended_at = Some(write.updated_at.clone());
        write.stop_reason = Some(reason);
        write.actuator_error = actuator_error;

        match self.store.update(session_id, &write) {
            Ok(true) => {}
            // Raced with start or another stop; settle against the new state.
            Ok(false) => return self.stop(session_id, reason),
            Err(error) => {
                tracing::error!(
                    session_id,
                    error = %error,
                    "failed to persist stop, returning last known state"
                );
                let mut last_known = session;
                last_known.apply(&write);
                return Ok(last_known);
            }
        }

        tracing::info!(
            session_id,
            status = ?write.status,
            reason = reason.as_str(),
            "session stopped"
        );
        let mut fallback = session;
        fallback.apply(&write);
        Ok(self.read_back(session_id, fallback))
    }

    pub fn get_by_transaction_id(&self, transaction_id: &str) -> Result<Session, ControllerError> {
        Ok(self.queries.get_by_transaction_id(transaction_id)?)
    }

    pub fn get_by_session_id(&self, session_id: &str) -> Result<Session, ControllerError> {
        Ok(self.queries.get_by_session_id(session_id)?)
    }

    /// Aborts sessions a previous process left PENDING or ACTIVE. Returns how
    /// many were aborted.
    pub fn recover_unfinished(&self) -> Result<usize, ControllerError> {
        let mut recovered = 0;

        for session in self.store.list_unfinished()? {
            if self.find_live(&session.session_id).is_some() {
                continue;
            }

            let actuator_error = self
                .command_relay(&session.device_id, RelayState::Off)
                .err()
                .map(|error| error.to_string());

            let mut write = SessionUpdate::guarded(session.status, self.now_iso());
            write.status = next_status(session.status, SessionEvent::Recovered);
            write.relay_state = Some(RelayState::Off);
            write.ended_at = Some(write.updated_at.clone());
            write.stop_reason = Some(StopReason::ServiceRestart);
            write.actuator_error = actuator_error.clone();

            if !self.store.update(&session.session_id, &write)? {
                continue;
            }

            tracing::warn!(
                session_id = %session.session_id,
                previous_status = session.status.as_str(),
                "aborted session left unfinished by previous run"
            );
            self.record_event(
                "warn",
                StopReason::ServiceRestart.as_str(),
                "unfinished session aborted on startup",
                &session.session_id,
                &session.device_id,
                Some(json!({
                    "previousStatus": session.status.as_str(),
                    "actuatorError": actuator_error,
                })),
            );
            recovered += 1;
        }

        Ok(recovered)
    }

    pub fn diagnostics(&self) -> ControllerDiagnostics {
        ControllerDiagnostics {
            live_sessions: self.live.lock().map(|live| live.len()).unwrap_or(0),
            stale_samples_dropped: self.stale_samples_dropped.load(Ordering::Relaxed),
        }
    }

    /// Store errors are logged; the in-memory snapshot is returned instead.
    fn finish_live(&self, session_id: &str, live: &mut LiveSession, reason: StopReason) -> Session {
        live.finished = true;
        self.forget_live(session_id);
        if let Some(handle) = live.subscription.take() {
            self.channel.unsubscribe(handle);
        }

        let actuator_error = match self.command_relay(&live.device_id, RelayState::Off) {
            Ok(()) => None,
            Err(error) => {
                tracing::warn!(
                    session_id,
                    device_id = %live.device_id,
                    error = %error,
                    "relay off not confirmed, relay may still be energised"
                );
                self.record_event(
                    "warn",
                    "ACTUATOR_OFF_UNCONFIRMED",
                    "relay did not acknowledge OFF",
                    session_id,
                    &live.device_id,
                    Some(json!({ "error": error.to_string() })),
                );
                Some(error.to_string())
            }
        };

        let mut write = SessionUpdate::guarded(SessionStatus::Active, self.now_iso());
        write.status = next_status(SessionStatus::Active, SessionEvent::Stopped);
        write.relay_state = Some(RelayState::Off);
        write.cumulative_energy_kwh = Some(live.engine.energy_kwh());
        write.cumulative_cost = Some(live.engine.cost());
        write.ended_at = Some(write.updated_at.clone());
        write.stop_reason = Some(reason);
        write.actuator_error = actuator_error;
        live.snapshot.apply(&write);

        match self.store.update(session_id, &write) {
            Ok(true) => {}
            Ok(false) => tracing::warn!(session_id, "session was no longer active when stopping"),
            Err(error) => {
                tracing::error!(
                    session_id,
                    error = %error,
                    "failed to persist completed session, returning last known state"
                );
                return live.snapshot.clone();
            }
        }

        tracing::info!(
            session_id,
            energy_kwh = live.engine.energy_kwh(),
            cost = live.engine.cost(),
            reason = reason.as_str(),
            "session completed"
        );
        self.read_back(session_id, live.snapshot.clone())
    }

    fn read_back(&self, session_id: &str, fallback: Session) -> Session {
        match self.queries.get_by_session_id(session_id) {
            Ok(session) => session,
            Err(error) => {
                tracing::warn!(session_id, error = %error, "failed to re-read stopped session");
                fallback
            }
        }
    }

    fn abort_pending(&self, session_id: &str, reason: StopReason, actuator_error: Option<String>) {
        let mut write = SessionUpdate::guarded(SessionStatus::Pending, self.now_iso());
        write.status = next_status(SessionStatus::Pending, SessionEvent::StartFailed);
        write.relay_state = Some(RelayState::Off);
        write.ended_at = Some(write.updated_at.clone());
        write.stop_reason = Some(reason);
        write.actuator_error = actuator_error;

        match self.store.update(session_id, &write) {
            Ok(true) => {}
            Ok(false) => tracing::info!(session_id, "session already left PENDING"),
            Err(error) => {
                tracing::error!(session_id, error = %error, "failed to record aborted session")
            }
        }
    }

    fn command_relay(&self, device_id: &str, relay: RelayState) -> Result<(), ChannelError> {
        self.channel
            .publish_command(device_id, relay, self.settings.actuator_timeout)
    }

    fn sample_handler(&self, session_id: &str) -> SampleHandler {
        let controller = self.this.clone();
        let session_id = session_id.to_string();
        Arc::new(move |sample: TelemetrySample| {
            if let Some(controller) = controller.upgrade() {
                controller.on_telemetry_sample(
                    &session_id,
                    sample.voltage,
                    sample.current,
                    sample.timestamp,
                );
            }
        })
    }

    fn live_sessions(
        &self,
    ) -> Result<MutexGuard<'_, HashMap<String, Arc<Mutex<LiveSession>>>>, ControllerError> {
        self.live.lock().map_err(|_| ControllerError::LockPoisoned)
    }

    fn find_live(&self, session_id: &str) -> Option<Arc<Mutex<LiveSession>>> {
        self.live_sessions()
            .ok()
            .and_then(|live| live.get(session_id).cloned())
    }

    fn forget_live(&self, session_id: &str) {
        if let Ok(mut live) = self.live_sessions() {
            live.remove(session_id);
        }
    }

    fn drop_stale(&self, session_id: &str) {
        let dropped = self.stale_samples_dropped.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(session_id, dropped, "sample for inactive session dropped");
    }

    fn now_iso(&self) -> String {
        self.clock.now().to_iso8601()
    }

    fn record_event(
        &self,
        level: &str,
        code: &str,
        message: &str,
        session_id: &str,
        device_id: &str,
        details: Option<serde_json::Value>,
    ) {
        let event = NewLogEventRecord {
            created_at: self.now_iso(),
            level: level.to_string(),
            code: code.to_string(),
            message: message.to_string(),
            session_id: Some(session_id.to_string()),
            device_id: Some(device_id.to_string()),
            details_json: details.map(|value| value.to_string()),
        };
        if let Err(error) = self.store.record_event(&event) {
            tracing::warn!(session_id, code, error = %error, "failed to persist log event");
        }
    }
}

fn validate_start(request: &StartRequest) -> Result<(), ControllerError> {
    if request.transaction_id.trim().is_empty() {
        return Err(ControllerError::InvalidRequest(
            "transactionId must not be empty".to_string(),
        ));
    }
    if request.device_id.trim().is_empty() {
        return Err(ControllerError::InvalidRequest(
            "deviceId must not be empty".to_string(),
        ));
    }
    if !request.budget.is_finite() || request.budget <= 0.0 {
        return Err(ControllerError::InvalidRequest(format!(
            "budgetCurrency must be a positive number, got {}",
            request.budget
        )));
    }
    if !request.energy_cap_kwh.is_finite() || request.energy_cap_kwh < 0.0 {
        return Err(ControllerError::InvalidRequest(format!(
            "energyCapKWh must not be negative, got {}",
            request.energy_cap_kwh
        )));
    }
    Ok(())
}
