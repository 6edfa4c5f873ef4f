//! Energy and cost accounting for one charging session.
//!
//! Energy is a left-Riemann sum: each sample's instantaneous power is applied
//! over the wall-clock gap since the previous accepted sample. This is a
//! discrete approximation, not an integral of the true power curve. A long gap
//! between samples is billed entirely at the power of the sample that closes
//! it, so lost or delayed telemetry biases the estimate in either direction.

use thiserror::Error;

use crate::domain::session_state::TimestampMs;

const MS_PER_HOUR: f64 = 3_600_000.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeterUpdate {
    pub energy_kwh: f64,
    pub cost: f64,
    pub power_w: f64,
    pub budget_exceeded: bool,
    pub energy_cap_reached: bool,
}

#[derive(Debug, Error, Clone, Copy, PartialEq)]
pub enum MeteringError {
    #[error("rate per kWh must be a positive finite number, got {0}")]
    InvalidRate(f64),
    #[error("budget must be a positive finite number, got {0}")]
    InvalidBudget(f64),
    #[error("energy cap must be a non-negative finite number, got {0}")]
    InvalidEnergyCap(f64),
}

#[derive(Debug, Clone)]
pub struct MeteringEngine {
    rate_per_kwh: f64,
    budget: f64,
    energy_cap_kwh: f64,
    last_sample_at: Option<TimestampMs>,
    energy_kwh: f64,
    budget_exceeded: bool,
}

impl MeteringEngine {
    /// `energy_cap_kwh == 0.0` means no cap. The meter clock starts at the
    /// first sample, not at session start.
    pub fn new(rate_per_kwh: f64, budget: f64, energy_cap_kwh: f64) -> Result<Self, MeteringError> {
        if !rate_per_kwh.is_finite() || rate_per_kwh <= 0.0 {
            return Err(MeteringError::InvalidRate(rate_per_kwh));
        }
        if !budget.is_finite() || budget <= 0.0 {
            return Err(MeteringError::InvalidBudget(budget));
        }
        if !energy_cap_kwh.is_finite() || energy_cap_kwh < 0.0 {
            return Err(MeteringError::InvalidEnergyCap(energy_cap_kwh));
        }

        Ok(Self {
            rate_per_kwh,
            budget,
            energy_cap_kwh,
            last_sample_at: None,
            energy_kwh: 0.0,
            budget_exceeded: false,
        })
    }

    pub fn ingest_sample(
        &mut self,
        voltage: f64,
        current: f64,
        timestamp: TimestampMs,
    ) -> MeterUpdate {
        let power_w = instantaneous_power_w(voltage, current);

        match self.last_sample_at {
            None => {
                self.last_sample_at = Some(timestamp);
            }
            Some(previous) if timestamp < previous => {
                tracing::debug!(
                    previous_ms = previous.0,
                    sample_ms = timestamp.0,
                    "out-of-order sample ignored for energy accounting"
                );
            }
            Some(previous) => {
                let elapsed_hours = (timestamp.0 - previous.0) as f64 / MS_PER_HOUR;
                self.energy_kwh += elapsed_hours * power_w / 1000.0;
                self.last_sample_at = Some(timestamp);
            }
        }

        if self.cost() >= self.budget {
            self.budget_exceeded = true;
        }

        self.snapshot(power_w)
    }

    pub fn energy_kwh(&self) -> f64 {
        self.energy_kwh
    }

    pub fn cost(&self) -> f64 {
        self.energy_kwh * self.rate_per_kwh
    }

    pub fn last_sample_at(&self) -> Option<TimestampMs> {
        self.last_sample_at
    }

    fn snapshot(&self, power_w: f64) -> MeterUpdate {
        MeterUpdate {
            energy_kwh: self.energy_kwh,
            cost: self.cost(),
            power_w,
            budget_exceeded: self.budget_exceeded,
            energy_cap_reached: self.energy_cap_kwh > 0.0
                && self.energy_kwh >= self.energy_cap_kwh,
        }
    }
}

fn instantaneous_power_w(voltage: f64, current: f64) -> f64 {
    if !voltage.is_finite() || !current.is_finite() || voltage <= 0.0 || current <= 0.0 {
        return 0.0;
    }
    voltage * current
}
