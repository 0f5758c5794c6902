use std::sync::Arc;

use parking_lot::Mutex;

use crate::bus::{EventBus, Topic};
use crate::config::Config;
use crate::eventlog::EventLog;
use crate::frame::Frame;
use crate::handshake::registration::SystemInfo;
use crate::handshake::{KeySource, RelayKeySource};

use super::descriptor::{Role, SessionDescriptor};
use super::state::{SessionState, SessionStateError};

/// Shared state of one endpoint process. Every component holds a clone
/// instead of reaching for globals.
#[derive(Clone)]
pub struct SessionContext {
    config: Arc<Config>,
    bus: EventBus,
    log: Arc<dyn EventLog>,
    key_source: Arc<dyn KeySource>,
    system: SystemInfo,
    descriptor: Arc<Mutex<SessionDescriptor>>,
    state: Arc<Mutex<SessionState>>,
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("descriptor", &*self.descriptor.lock())
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl SessionContext {
    pub fn new(config: Config, descriptor: SessionDescriptor, log: Arc<dyn EventLog>) -> Self {
        let key_source = Arc::new(RelayKeySource::from_config(&config));
        Self::with_key_source(config, descriptor, log, key_source)
    }

    pub fn with_key_source(
        config: Config,
        descriptor: SessionDescriptor,
        log: Arc<dyn EventLog>,
        key_source: Arc<dyn KeySource>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            bus: EventBus::new(),
            log,
            key_source,
            system: SystemInfo::current(),
            descriptor: Arc::new(Mutex::new(descriptor)),
            state: Arc::new(Mutex::new(SessionState::Disconnected)),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn log(&self) -> &dyn EventLog {
        self.log.as_ref()
    }

    pub fn key_source(&self) -> Arc<dyn KeySource> {
        self.key_source.clone()
    }

    pub fn system_info(&self) -> &SystemInfo {
        &self.system
    }

    pub fn descriptor(&self) -> SessionDescriptor {
        self.descriptor.lock().clone()
    }

    pub fn replace_descriptor(&self, descriptor: SessionDescriptor) {
        *self.descriptor.lock() = descriptor;
    }

    pub fn role(&self) -> Role {
        self.descriptor.lock().role
    }

    pub fn state(&self) -> SessionState {
        self.state.lock().clone()
    }

    pub fn transition(&self, next: SessionState) -> Result<SessionState, SessionStateError> {
        let mut state = self.state.lock();
        *state = state.transition(next)?;
        Ok(state.clone())
    }

    /// Hands a frame to the connection writer. Returns false when no
    /// connection is up; the frame is then lost.
    pub fn send(&self, frame: Frame) -> bool {
        self.bus.publish(&Topic::Outbound, frame)
    }

    /// Answers `request` through the relay.
    pub fn respond(&self, request: Frame) -> bool {
        self.send(request.into_response(self.role()))
    }
}
