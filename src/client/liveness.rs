//! Local short-circuit for devices known to be unreachable.

use std::collections::BTreeSet;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::LivenessConfig;
use crate::error::{Error, Result};
use crate::frame::EndpointId;

#[derive(Debug, Default)]
struct Known {
    invalid: BTreeSet<EndpointId>,
    offline: BTreeSet<EndpointId>,
}

/// Tracks devices the relay reported as unregistered or off-line.
///
/// Every check grows a per-client delay by `step_ms` up to `max_ms`. A
/// request for an unreachable device waits out that delay before failing,
/// so a caller retrying in a tight loop is slowed down instead of flooding
/// the relay.
#[derive(Debug)]
pub struct Liveness {
    config: LivenessConfig,
    delay_ms: Mutex<u64>,
    known: Mutex<Known>,
}

impl Liveness {
    pub fn new(config: LivenessConfig) -> Self {
        Self {
            config,
            delay_ms: Mutex::new(config.base_ms),
            known: Mutex::new(Known::default()),
        }
    }

    pub fn current_delay(&self) -> Duration {
        Duration::from_millis(*self.delay_ms.lock())
    }

    fn bump(&self) -> Duration {
        let mut delay = self.delay_ms.lock();
        *delay = (*delay + self.config.step_ms).min(self.config.max_ms.max(self.config.base_ms));
        Duration::from_millis(*delay)
    }

    /// Fails for devices known to be unreachable.
    pub async fn check(&self, device: &EndpointId) -> Result<()> {
        let delay = self.bump();
        let reason = {
            let known = self.known.lock();
            if known.invalid.contains(device) {
                Some(format!("device[{device}] is not registered"))
            } else if known.offline.contains(device) {
                Some(offline_error(device))
            } else {
                None
            }
        };
        match reason {
            Some(reason) => {
                tracing::debug!(device = %device, delay_ms = delay.as_millis() as u64, "short-circuiting unreachable device");
                tokio::time::sleep(delay).await;
                Err(Error::Resource(reason))
            }
            None => Ok(()),
        }
    }

    pub fn is_available(&self, device: &EndpointId) -> bool {
        let known = self.known.lock();
        !known.invalid.contains(device) && !known.offline.contains(device)
    }

    pub fn mark_invalid(&self, device: EndpointId) {
        self.known.lock().invalid.insert(device);
    }

    pub fn mark_offline(&self, device: EndpointId) {
        self.known.lock().offline.insert(device);
    }

    /// A device announced itself; it is reachable again even if the relay
    /// previously did not know it.
    pub fn mark_online(&self, device: &EndpointId) {
        let mut known = self.known.lock();
        known.offline.remove(device);
        known.invalid.remove(device);
    }
}

pub fn offline_error(device: &EndpointId) -> String {
    format!("device[{device}] is off-line")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> LivenessConfig {
        LivenessConfig {
            base_ms: 1_000,
            step_ms: 50,
            max_ms: 1_100,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn known_devices_pass_and_delay_grows_to_cap() {
        let liveness = Liveness::new(config());
        let id = EndpointId::Num(100);
        liveness.check(&id).await.unwrap();
        assert_eq!(liveness.current_delay(), Duration::from_millis(1_050));
        liveness.check(&id).await.unwrap();
        liveness.check(&id).await.unwrap();
        assert_eq!(liveness.current_delay(), Duration::from_millis(1_100));
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_devices_fail_after_the_delay() {
        let liveness = Liveness::new(config());
        let id = EndpointId::Num(100);
        liveness.mark_offline(id.clone());
        let start = tokio::time::Instant::now();
        let err = liveness.check(&id).await.unwrap_err();
        assert!(start.elapsed() >= Duration::from_millis(1_050));
        assert!(matches!(err, Error::Resource(m) if m == "device[100] is off-line"));

        liveness.mark_online(&id);
        assert!(liveness.is_available(&id));
        liveness.mark_invalid(EndpointId::Num(200));
        assert!(liveness.check(&EndpointId::Num(200)).await.is_err());
    }
}
