use chrono::{SecondsFormat, Utc};

use crate::domain::models::SessionStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimestampMs(pub i64);

impl TimestampMs {
    pub fn to_iso8601(self) -> String {
        let datetime = chrono::DateTime::<Utc>::from_timestamp_millis(self.0)
            .unwrap_or_else(|| chrono::DateTime::<Utc>::from(std::time::UNIX_EPOCH));
        datetime.to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> TimestampMs;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> TimestampMs {
        TimestampMs(Utc::now().timestamp_millis())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Relay ON acknowledged and telemetry subscribed.
    Activated,
    /// Relay ON or subscription failed during start.
    StartFailed,
    /// Stop received while start was still waiting on the relay.
    Cancelled,
    Stopped,
    /// Record left unfinished by a previous process.
    Recovered,
}

/// Returns the status reached by applying `event`, or `None` when the event is
/// not allowed from `current`. Terminal states accept nothing.
pub fn next_status(current: SessionStatus, event: SessionEvent) -> Option<SessionStatus> {
    match (current, event) {
        (SessionStatus::Pending, SessionEvent::Activated) => Some(SessionStatus::Active),
        (SessionStatus::Pending, SessionEvent::StartFailed | SessionEvent::Cancelled) => {
            Some(SessionStatus::Aborted)
        }
        (SessionStatus::Active, SessionEvent::Stopped) => Some(SessionStatus::Completed),
        (SessionStatus::Pending | SessionStatus::Active, SessionEvent::Recovered) => {
            Some(SessionStatus::Aborted)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::{SessionEvent, TimestampMs, next_status};
    use crate::domain::models::SessionStatus;

    #[test]
    fn formats_timestamp_as_utc_millis() {
        assert_eq!(
            TimestampMs(1_700_000_000_000).to_iso8601(),
            "2023-11-14T22:13:20.000Z"
        );
    }

    #[test]
    fn pending_session_activates_or_aborts() {
        assert_eq!(
            next_status(SessionStatus::Pending, SessionEvent::Activated),
            Some(SessionStatus::Active)
        );
        assert_eq!(
            next_status(SessionStatus::Pending, SessionEvent::StartFailed),
            Some(SessionStatus::Aborted)
        );
        assert_eq!(
            next_status(SessionStatus::Pending, SessionEvent::Cancelled),
            Some(SessionStatus::Aborted)
        );
        assert_eq!(next_status(SessionStatus::Pending, SessionEvent::Stopped), None);
    }

    #[test]
    fn active_session_only_completes_on_stop() {
        assert_eq!(
            next_status(SessionStatus::Active, SessionEvent::Stopped),
            Some(SessionStatus::Completed)
        );
        assert_eq!(next_status(SessionStatus::Active, SessionEvent::Activated), None);
        assert_eq!(next_status(SessionStatus::Active, SessionEvent::Cancelled), None);
    }

    #[test]
    fn terminal_states_never_reenter_active() {
        for status in [SessionStatus::Completed, SessionStatus::Aborted] {
            for event in [
                SessionEvent::Activated,
                SessionEvent::StartFailed,
                SessionEvent::Cancelled,
                SessionEvent::Stopped,
                SessionEvent::Recovered,
            ] {
                assert_eq!(next_status(status, event), None);
            }
        }
    }

    #[test]
    fn recovery_aborts_unfinished_sessions() {
        assert_eq!(
            next_status(SessionStatus::Active, SessionEvent::Recovered),
            Some(SessionStatus::Aborted)
        );
        assert_eq!(
            next_status(SessionStatus::Pending, SessionEvent::Recovered),
            Some(SessionStatus::Aborted)
        );
    }
}
