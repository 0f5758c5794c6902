//! Registration and session-control codes.

use std::time::Duration;

use crate::error::Result;
use crate::frame::Frame;

use super::descriptor::SessionDescriptor;

const MAX_REGISTRATION_ATTEMPTS: u32 = 3;
const RETRY_STEP: Duration = Duration::from_millis(100);

/// What the session loop must do in response to a control frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlAction {
    /// Registration succeeded. A new descriptor, when present, replaces the
    /// current one and is persisted first.
    Activate {
        descriptor: Option<SessionDescriptor>,
    },
    /// Token renewed: persist it, then reconnect with it.
    Renew { descriptor: SessionDescriptor },
    Reconnect,
    ModuleUpdate(Frame),
    RetryRegistration { delay: Duration },
    Fatal(String),
    SecurityCodeReset {
        reason: String,
        edata: Option<String>,
        etag: Option<String>,
    },
    Ignore,
}

#[derive(Debug, Default)]
pub struct ControlHandler {
    failed_registrations: u32,
}

impl ControlHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// `connections` is the number of sockets opened since the last successful
    /// registration, used to tell a transient race from a real rejection.
    pub fn handle(
        &mut self,
        code: u16,
        frame: &Frame,
        current: &SessionDescriptor,
        connections: u32,
    ) -> Result<ControlAction> {
        let reason = || frame.str_field("reason").or(frame.error()).unwrap_or("").to_string();
        let action = match code {
            100 | 101 | 102 => {
                if let Some(err) = frame.error() {
                    ControlAction::Fatal(err.to_string())
                } else {
                    self.failed_registrations = 0;
                    ControlAction::Activate {
                        descriptor: Some(SessionDescriptor::from_reply(frame, current)?),
                    }
                }
            }
            110 => {
                if frame.contains("data") && frame.error().is_none() {
                    ControlAction::Renew {
                        descriptor: SessionDescriptor::from_reply(frame, current)?,
                    }
                } else {
                    ControlAction::Reconnect
                }
            }
            150 => {
                if current.aid.is_some() && frame.str_field("aid") == current.aid.as_deref() {
                    ControlAction::ModuleUpdate(frame.clone())
                } else {
                    tracing::debug!("ignoring module update for another installation");
                    ControlAction::Ignore
                }
            }
            200 | 210 => {
                self.failed_registrations = 0;
                ControlAction::Activate { descriptor: None }
            }
            300 => {
                let same = |field: &str, value: &Option<String>| {
                    frame.str_field(field).map(str::to_string) == *value
                };
                if same("aid", &current.aid) && same("uid", &current.uid) && same("ak", &current.ak) {
                    ControlAction::Reconnect
                } else {
                    tracing::warn!("relay challenge does not match local identity");
                    ControlAction::Ignore
                }
            }
            500 | 510 | 520 => {
                if connections > 1 && self.failed_registrations < MAX_REGISTRATION_ATTEMPTS {
                    self.failed_registrations += 1;
                    ControlAction::RetryRegistration {
                        delay: RETRY_STEP * (self.failed_registrations - 1),
                    }
                } else {
                    ControlAction::Fatal(non_empty(reason(), "authentication failed"))
                }
            }
            530 => ControlAction::Fatal(non_empty(reason(), "invalid or unregistered id")),
            600 => ControlAction::SecurityCodeReset {
                reason: non_empty(reason(), "security code reset"),
                edata: frame.str_field("edata").map(str::to_string),
                etag: frame.str_field("etag").map(str::to_string),
            },
            other => {
                tracing::debug!(code = other, "unhandled control code");
                ControlAction::Ignore
            }
        };
        Ok(action)
    }
}

fn non_empty(value: String, fallback: &str) -> String {
    if value.is_empty() {
        fallback.to_string()
    } else {
        value
    }
}
