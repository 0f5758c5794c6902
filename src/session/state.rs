use thiserror::Error;

/// Connection lifecycle of the relay session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    AwaitingRegistration,
    Active,
    /// Registered, but device watches are paused by a remote `enable: false`.
    Suspended,
    Reconnecting { attempt: u32 },
}

#[derive(Debug, Error)]
pub enum SessionStateError {
    #[error("invalid session transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },
}

impl SessionState {
    /// Validates `self -> next` and returns the new state.
    pub fn transition(&self, next: SessionState) -> Result<SessionState, SessionStateError> {
        use SessionState::*;
        let allowed = match (self, &next) {
            (_, Disconnected) => true,
            (Disconnected, Connecting) | (Reconnecting { .. }, Connecting) => true,
            (Connecting, AwaitingRegistration) => true,
            (AwaitingRegistration, Active) => true,
            (Active, Active) | (Active, Suspended) | (Suspended, Active) | (Suspended, Suspended) => {
                true
            }
            (Disconnected, Reconnecting { .. }) => false,
            (_, Reconnecting { .. }) => true,
            _ => false,
        };
        if allowed {
            Ok(next)
        } else {
            Err(SessionStateError::InvalidTransition {
                from: self.clone(),
                to: next,
            })
        }
    }

    /// Registered with the relay (watches may still be suspended).
    pub fn is_registered(&self) -> bool {
        matches!(self, SessionState::Active | SessionState::Suspended)
    }
}

#[cfg(test)]
mod tests {
    use super::SessionState::*;
    use super::*;

    #[test]
    fn happy_path() {
        let s = Disconnected
            .transition(Connecting)
            .and_then(|s| s.transition(AwaitingRegistration))
            .and_then(|s| s.transition(Active))
            .and_then(|s| s.transition(Suspended))
            .and_then(|s| s.transition(Active))
            .unwrap();
        assert!(s.is_registered());
    }

    #[test]
    fn reconnecting_reachable_from_non_terminal_states() {
        for from in [Connecting, AwaitingRegistration, Active, Suspended] {
            assert!(from.transition(Reconnecting { attempt: 1 }).is_ok());
        }
        assert!(Disconnected.transition(Reconnecting { attempt: 1 }).is_err());
        assert!(Reconnecting { attempt: 1 }.transition(Connecting).is_ok());
    }

    #[test]
    fn rejects_skipping_registration() {
        assert!(Connecting.transition(Active).is_err());
        assert!(Disconnected.transition(Active).is_err());
        assert!(AwaitingRegistration.transition(Suspended).is_err());
    }
}
