use std::time::Duration;

use super::descriptor::Role;

const INITIAL_MS: u64 = 3_600_000;
const DEVICE_CEILING_MS: u64 = 5_400_000;
const CLIENT_FLOOR_MS: u64 = 1_800_000;
const STEP_MS: u64 = 60_000;

/// Renewal interval that drifts by one step per successful connect: devices
/// grow toward a ceiling, clients shrink toward a floor, and both start over
/// once the bound is reached. Spreads keep-alive traffic of many endpoints
/// sharing one relay.
#[derive(Debug, Clone)]
pub struct HeartbeatSchedule {
    role: Role,
    interval_ms: u64,
}

impl HeartbeatSchedule {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            interval_ms: INITIAL_MS,
        }
    }

    /// Advances the schedule for a new connection and returns its interval.
    pub fn on_connect(&mut self) -> Duration {
        self.interval_ms = match self.role {
            Role::Device if self.interval_ms < DEVICE_CEILING_MS => self.interval_ms + STEP_MS,
            Role::Client if self.interval_ms > CLIENT_FLOOR_MS => self.interval_ms - STEP_MS,
            _ => INITIAL_MS,
        };
        self.interval()
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}
