pub const SESSION_ID_PREFIX: &str = "session-";

pub fn derive_session_id(transaction_id: &str) -> String {
    format!("{SESSION_ID_PREFIX}{transaction_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionStatus {
    Pending,
    Active,
    Completed,
    Aborted,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Active => "ACTIVE",
            Self::Completed => "COMPLETED",
            Self::Aborted => "ABORTED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(Self::Pending),
            "ACTIVE" => Some(Self::Active),
            "COMPLETED" => Some(Self::Completed),
            "ABORTED" => Some(Self::Aborted),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayState {
    Off,
    On,
}

impl RelayState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::On => "ON",
        }
    }

    /// Case-insensitive, accepts `1`/`0` as sent by some relay firmwares.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "ON" | "1" | "TRUE" => Some(Self::On),
            "OFF" | "0" | "FALSE" => Some(Self::Off),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    UserRequested,
    BudgetExhausted,
    EnergyCapReached,
    ActuatorUnavailable,
    TelemetryUnavailable,
    ServiceRestart,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserRequested => "USER_REQUESTED",
            Self::BudgetExhausted => "BUDGET_EXHAUSTED",
            Self::EnergyCapReached => "ENERGY_CAP_REACHED",
            Self::ActuatorUnavailable => "ACTUATOR_UNAVAILABLE",
            Self::TelemetryUnavailable => "TELEMETRY_UNAVAILABLE",
            Self::ServiceRestart => "SERVICE_RESTART",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "USER_REQUESTED" => Some(Self::UserRequested),
            "BUDGET_EXHAUSTED" => Some(Self::BudgetExhausted),
            "ENERGY_CAP_REACHED" => Some(Self::EnergyCapReached),
            "ACTUATOR_UNAVAILABLE" => Some(Self::ActuatorUnavailable),
            "TELEMETRY_UNAVAILABLE" => Some(Self::TelemetryUnavailable),
            "SERVICE_RESTART" => Some(Self::ServiceRestart),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub transaction_id: String,
    pub session_id: String,
    pub device_id: String,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub cumulative_energy_kwh: f64,
    pub cumulative_cost: f64,
    pub relay_state: RelayState,
    pub budget: f64,
    pub energy_cap_kwh: f64,
    pub rate_per_kwh: f64,
    pub status: SessionStatus,
    pub stop_reason: Option<StopReason>,
    pub last_voltage: Option<f64>,
    pub last_current: Option<f64>,
    pub last_sample_at: Option<String>,
    pub last_power_w: Option<f64>,
    pub actuator_error: Option<String>,
    pub updated_at: String,
}

impl Session {
    /// The PENDING record `create_session_if_absent` stores for `new_session`.
    pub fn from_new(new_session: &NewSession) -> Self {
        Self {
            transaction_id: new_session.transaction_id.clone(),
            session_id: new_session.session_id.clone(),
            device_id: new_session.device_id.clone(),
            started_at: new_session.started_at.clone(),
            ended_at: None,
            cumulative_energy_kwh: 0.0,
            cumulative_cost: 0.0,
            relay_state: RelayState::Off,
            budget: new_session.budget,
            energy_cap_kwh: new_session.energy_cap_kwh,
            rate_per_kwh: new_session.rate_per_kwh,
            status: SessionStatus::Pending,
            stop_reason: None,
            last_voltage: None,
            last_current: None,
            last_sample_at: None,
            last_power_w: None,
            actuator_error: None,
            updated_at: new_session.started_at.clone(),
        }
    }

    /// In-memory counterpart of `update_session`, without the status guard.
    pub fn apply(&mut self, update: &SessionUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(relay_state) = update.relay_state {
            self.relay_state = relay_state;
        }
        if let Some(energy) = update.cumulative_energy_kwh {
            self.cumulative_energy_kwh = self.cumulative_energy_kwh.max(energy);
        }
        if let Some(cost) = update.cumulative_cost {
            self.cumulative_cost = self.cumulative_cost.max(cost);
        }
        if update.ended_at.is_some() {
            self.ended_at.clone_from(&update.ended_at);
        }
        if update.stop_reason.is_some() {
            self.stop_reason = update.stop_reason;
        }
        if update.last_voltage.is_some() {
            self.last_voltage = update.last_voltage;
        }
        if update.last_current.is_some() {
            self.last_current = update.last_current;
        }
        if update.last_sample_at.is_some() {
            self.last_sample_at.clone_from(&update.last_sample_at);
        }
        if update.last_power_w.is_some() {
            self.last_power_w = update.last_power_w;
        }
        if update.actuator_error.is_some() {
            self.actuator_error.clone_from(&update.actuator_error);
        }
        self.updated_at.clone_from(&update.updated_at);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewSession {
    pub transaction_id: String,
    pub session_id: String,
    pub device_id: String,
    pub started_at: String,
    pub budget: f64,
    pub energy_cap_kwh: f64,
    pub rate_per_kwh: f64,
}

/// Partial write applied only while the stored status equals `expected_status`.
/// `None` fields keep their stored value.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionUpdate {
    pub expected_status: SessionStatus,
    pub status: Option<SessionStatus>,
    pub relay_state: Option<RelayState>,
    pub cumulative_energy_kwh: Option<f64>,
    pub cumulative_cost: Option<f64>,
    pub ended_at: Option<String>,
    pub stop_reason: Option<StopReason>,
    pub last_voltage: Option<f64>,
    pub last_current: Option<f64>,
    pub last_sample_at: Option<String>,
    pub last_power_w: Option<f64>,
    pub actuator_error: Option<String>,
    pub updated_at: String,
}

impl SessionUpdate {
    pub fn guarded(expected_status: SessionStatus, updated_at: String) -> Self {
        Self {
            expected_status,
            status: None,
            relay_state: None,
            cumulative_energy_kwh: None,
            cumulative_cost: None,
            ended_at: None,
            stop_reason: None,
            last_voltage: None,
            last_current: None,
            last_sample_at: None,
            last_power_w: None,
            actuator_error: None,
            updated_at,
        }
    }
}

/// A charging device as seen through its sessions.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSummary {
    pub device_id: String,
    pub session_count: i64,
    pub latest_session_id: String,
    pub latest_status: SessionStatus,
    pub latest_started_at: String,
    pub last_sample_at: Option<String>,
    pub last_power_w: Option<f64>,
    /// The PENDING or ACTIVE session currently holding the device, if any.
    pub active_session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewLogEventRecord {
    pub created_at: String,
    pub level: String,
    pub code: String,
    pub message: String,
    pub session_id: Option<String>,
    pub device_id: Option<String>,
    pub details_json: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogEventRecord {
    pub id: String,
    pub created_at: String,
    pub level: String,
    pub code: String,
    pub message: String,
    pub session_id: Option<String>,
    pub device_id: Option<String>,
    pub details_json: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::{
        NewSession, RelayState, Session, SessionStatus, SessionUpdate, StopReason,
        derive_session_id,
    };

    #[test]
    fn derives_session_id_from_transaction_id() {
        assert_eq!(derive_session_id("tx-42"), "session-tx-42");
    }

    #[test]
    fn status_strings_round_trip_through_parse() {
        for status in [
            SessionStatus::Pending,
            SessionStatus::Active,
            SessionStatus::Completed,
            SessionStatus::Aborted,
        ] {
            assert_eq!(SessionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SessionStatus::parse("active"), None);
    }

    #[test]
    fn only_completed_and_aborted_are_terminal() {
        assert!(!SessionStatus::Pending.is_terminal());
        assert!(!SessionStatus::Active.is_terminal());
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Aborted.is_terminal());
    }

    #[test]
    fn applied_update_overlays_fields_and_keeps_totals_monotonic() {
        let mut session = Session::from_new(&NewSession {
            transaction_id: "tx-1".to_string(),
            session_id: derive_session_id("tx-1"),
            device_id: "wallbox-1".to_string(),
            started_at: "2026-02-20T10:00:00.000Z".to_string(),
            budget: 10.0,
            energy_cap_kwh: 0.0,
            rate_per_kwh: 20.0,
        });
        assert_eq!(session.status, SessionStatus::Pending);
        assert_eq!(session.updated_at, session.started_at);

        let mut metered = SessionUpdate::guarded(SessionStatus::Active, "t1".to_string());
        metered.status = Some(SessionStatus::Active);
        metered.cumulative_energy_kwh = Some(0.4);
        metered.cumulative_cost = Some(8.0);
        metered.last_power_w = Some(2300.0);
        session.apply(&metered);

        let mut finished = SessionUpdate::guarded(SessionStatus::Active, "t2".to_string());
        finished.status = Some(SessionStatus::Completed);
        finished.relay_state = Some(RelayState::Off);
        finished.cumulative_energy_kwh = Some(0.3);
        finished.stop_reason = Some(StopReason::UserRequested);
        session.apply(&finished);

        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.cumulative_energy_kwh, 0.4);
        assert_eq!(session.cumulative_cost, 8.0);
        assert_eq!(session.last_power_w, Some(2300.0));
        assert_eq!(session.stop_reason, Some(StopReason::UserRequested));
        assert_eq!(session.updated_at, "t2");
    }

    #[test]
    fn relay_state_parse_is_lenient() {
        assert_eq!(RelayState::parse(" on "), Some(RelayState::On));
        assert_eq!(RelayState::parse("0"), Some(RelayState::Off));
        assert_eq!(RelayState::parse("toggle"), None);
    }

    #[test]
    fn unknown_stop_reason_is_rejected() {
        assert_eq!(
            StopReason::parse("BUDGET_EXHAUSTED"),
            Some(StopReason::BudgetExhausted)
        );
        assert_eq!(StopReason::parse("SOMETHING_ELSE"), None);
    }
}
