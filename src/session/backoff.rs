//! Reconnect delay policy.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

use crate::config::ReconnectConfig;

/// WebSocket close codes that mean "relay not ready".
pub const CLOSE_ABNORMAL: u16 = 1006;
pub const CLOSE_UNSUPPORTED: u16 = 1003;

/// From this attempt on the delay is extended and retries continue quietly.
const BACKGROUND_ATTEMPT: u32 = 3;
/// User-facing warnings are printed for the first attempts only.
const WARN_ATTEMPTS: u32 = 2;

pub fn is_server_not_ready(code: u16) -> bool {
    code == CLOSE_ABNORMAL || code == CLOSE_UNSUPPORTED
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPlan {
    /// 1-based attempt number since the last successful open.
    pub attempt: u32,
    pub delay: Duration,
    pub warn: bool,
    /// Set on the attempt where retries move to the background.
    pub background: bool,
}

/// Randomized delay in `[base, base + spread)`, extended by a fixed amount
/// from the third consecutive attempt on. The counter resets on every
/// successful open.
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempt: u32,
    rng: Box<dyn RngCore + Send + Sync>,
}

impl std::fmt::Debug for ReconnectPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectPolicy")
            .field("config", &self.config)
            .field("attempt", &self.attempt)
            .finish()
    }
}

impl ReconnectPolicy {
    pub fn new(config: ReconnectConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    pub fn with_rng(config: ReconnectConfig, rng: impl RngCore + Send + Sync + 'static) -> Self {
        Self {
            config,
            attempt: 0,
            rng: Box::new(rng),
        }
    }

    pub fn next_plan(&mut self, close_code: u16) -> ReconnectPlan {
        self.attempt = self.attempt.saturating_add(1);
        let jitter = if self.config.spread_ms == 0 {
            0
        } else {
            self.rng.gen_range(0..self.config.spread_ms)
        };
        let mut delay_ms = self.config.base_ms + jitter;
        if self.attempt >= BACKGROUND_ATTEMPT {
            delay_ms += self.config.extension_ms;
        }
        ReconnectPlan {
            attempt: self.attempt,
            delay: Duration::from_millis(delay_ms),
            warn: is_server_not_ready(close_code) && self.attempt <= WARN_ATTEMPTS,
            background: self.attempt == BACKGROUND_ATTEMPT,
        }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}
