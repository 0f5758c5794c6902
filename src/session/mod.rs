//! Relay session: one persistent `/m2m` connection per process.
//!
//! The loop registers (key exchange first when no token is stored), keeps the
//! registration alive with periodic renewal frames, forwards everything
//! published on [`Topic::Outbound`] to the socket, and hands inbound frames
//! either to the control-code handler or to the role's [`Endpoint`]. Lost
//! connections are retried with [`ReconnectPolicy`]; only identity failures
//! end the session.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::time::{self, Instant};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::admin;
use crate::bus::Topic;
use crate::crypto::cipher::{decrypt_code, seal_credentials};
use crate::crypto::{CredentialSource, TransientKeys};
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::handshake::registration;
use crate::router;

pub mod backoff;
pub mod context;
pub mod control;
pub mod descriptor;
pub mod heartbeat;
pub mod outbound;
pub mod state;

pub use backoff::{ReconnectPlan, ReconnectPolicy};
pub use context::SessionContext;
pub use descriptor::{Role, SessionDescriptor, TokenStore};
pub use state::{SessionState, SessionStateError};

use backoff::CLOSE_ABNORMAL;
use control::{ControlAction, ControlHandler};
use heartbeat::HeartbeatSchedule;
use outbound::OutboundQueue;

/// Close code reported when the peer closed without a status.
const CLOSE_NO_STATUS: u16 = 1005;
const WRITER_DRAIN: Duration = Duration::from_secs(1);

/// Role-specific behaviour plugged into the session loop.
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// Handles one non-control frame. Non-fatal errors are logged and the
    /// frame is dropped.
    async fn handle(&self, ctx: &SessionContext, frame: Frame) -> Result<()>;

    /// Registration accepted with `code`.
    async fn on_active(&self, ctx: &SessionContext, code: u16) -> Result<()>;

    async fn on_disconnect(&self, ctx: &SessionContext);

    /// Last call before [`Session::run`] returns.
    async fn on_shutdown(&self, ctx: &SessionContext);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionExit {
    Shutdown,
    /// The relay answered a security-code reset; `code` is the decrypted
    /// value when the keys were still available.
    SecurityCodeReset { reason: String, code: Option<String> },
}

/// Stops a running session from another task.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    cancel: CancellationToken,
}

impl SessionHandle {
    /// Sends the exit frame, closes the connection and makes `run` return.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// How one connection ended.
enum Closed {
    Shutdown,
    SecurityCodeReset { reason: String, code: Option<String> },
    Lost { code: u16 },
    Reconnect { delay: Duration },
}

pub struct Session<E> {
    ctx: SessionContext,
    endpoint: E,
    credentials: Option<Arc<dyn CredentialSource>>,
    store: TokenStore,
    policy: ReconnectPolicy,
    heartbeat: HeartbeatSchedule,
    control: ControlHandler,
    cancel: CancellationToken,
    connections: u32,
    keys: Option<TransientKeys>,
}

impl<E: Endpoint> Session<E> {
    pub fn new(ctx: SessionContext, endpoint: E) -> Self {
        let store = TokenStore::new(ctx.config().token_path.clone());
        let policy = ReconnectPolicy::new(ctx.config().reconnect);
        let heartbeat = HeartbeatSchedule::new(ctx.role());
        Self {
            ctx,
            endpoint,
            credentials: None,
            store,
            policy,
            heartbeat,
            control: ControlHandler::new(),
            cancel: CancellationToken::new(),
            connections: 0,
            keys: None,
        }
    }

    /// Credentials used when no stored token is available.
    pub fn with_credentials(mut self, source: Arc<dyn CredentialSource>) -> Self {
        self.credentials = Some(source);
        self
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            cancel: self.cancel.clone(),
        }
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    /// Runs until shutdown, a security-code reset, or a fatal error.
    pub async fn run(mut self) -> Result<SessionExit> {
        let result = self.drive().await;
        self.keys = None;
        self.endpoint.on_shutdown(&self.ctx).await;
        if let Err(err) = self.ctx.transition(SessionState::Disconnected) {
            tracing::debug!(error = %err, "final transition");
        }
        match &result {
            Ok(exit) => {
                tracing::info!(?exit, "session ended");
                self.ctx.log().record("process", "exit", &[]);
            }
            Err(err) => {
                tracing::error!(error = %err, "session terminated");
                self.ctx.log().record("process", "terminated", &[err.to_string().as_str()]);
            }
        }
        result
    }

    async fn drive(&mut self) -> Result<SessionExit> {
        self.restore_token().await?;
        self.ctx.transition(SessionState::Connecting)?;
        loop {
            let closed = match self.connect_once().await {
                Ok(closed) => closed,
                Err(err) if err.is_fatal() || matches!(err, Error::Validation(_)) => return Err(err),
                Err(err) => {
                    tracing::warn!(error = %err, "relay connection failed");
                    Closed::Lost {
                        code: CLOSE_ABNORMAL,
                    }
                }
            };
            self.keys = None;
            self.endpoint.on_disconnect(&self.ctx).await;

            let delay = match closed {
                Closed::Shutdown => return Ok(SessionExit::Shutdown),
                Closed::SecurityCodeReset { reason, code } => {
                    return Ok(SessionExit::SecurityCodeReset { reason, code })
                }
                Closed::Reconnect { delay } => {
                    self.ctx.transition(SessionState::Reconnecting {
                        attempt: self.policy.attempts(),
                    })?;
                    delay
                }
                Closed::Lost { code } => {
                    let plan = self.policy.next_plan(code);
                    if plan.warn {
                        tracing::warn!(code, attempt = plan.attempt, "relay not ready, reconnecting");
                    }
                    if plan.background {
                        tracing::info!("relay still unavailable, retrying in the background");
                    }
                    self.ctx.transition(SessionState::Reconnecting {
                        attempt: plan.attempt,
                    })?;
                    plan.delay
                }
            };

            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(SessionExit::Shutdown),
                _ = time::sleep(delay) => {}
            }
            self.ctx.transition(SessionState::Connecting)?;
        }
    }

    /// Reuses a stored token when it belongs to this identity.
    async fn restore_token(&mut self) -> Result<()> {
        let Some(mut stored) = self.store.load().await? else {
            return Ok(());
        };
        let expected = self.ctx.descriptor();
        if stored.matches_identity(&expected) && stored.has_token() {
            stored.restartable = expected.restartable;
            tracing::info!(id = %stored.owner_key(), "restored session token");
            self.ctx.replace_descriptor(stored);
        } else {
            tracing::info!("stored token belongs to another identity, registering afresh");
            self.store.clear().await?;
        }
        Ok(())
    }

    async fn registration_frame(&mut self) -> Result<Frame> {
        let descriptor = self.ctx.descriptor();
        let system = self.ctx.system_info().clone();
        if descriptor.has_token() {
            return Ok(registration::with_token(&descriptor, &system));
        }
        let source = self.credentials.clone().ok_or_else(|| {
            Error::Authentication("no session token and no credential source".into())
        })?;
        let credentials = source.credentials(descriptor.role)?;
        let keys = self.ctx.key_source().exchange().await?;
        let sealed = seal_credentials(&keys, &credentials)?;
        let frame = registration::fresh(&descriptor, &sealed, &keys, &system);
        self.keys = Some(keys);
        Ok(frame)
    }

    async fn connect_once(&mut self) -> Result<Closed> {
        let cancel = self.cancel.clone();
        let url = self.ctx.config().endpoint("/m2m")?;
        let registration = tokio::select! {
            _ = cancel.cancelled() => return Ok(Closed::Shutdown),
            frame = self.registration_frame() => frame?,
        };
        let (ws, _) = tokio::select! {
            _ = cancel.cancelled() => return Ok(Closed::Shutdown),
            res = connect_async(url.as_str()) => res?,
        };
        self.connections += 1;
        self.ctx.transition(SessionState::AwaitingRegistration)?;
        tracing::info!(url = %url, "connected to relay");

        let (mut sink, mut stream) = ws.split();
        let (queue, mut pending) = OutboundQueue::new(self.ctx.config().send_threshold);
        let mut writer = tokio::spawn(async move {
            while let Some(text) = pending.recv().await {
                let len = text.len();
                if let Err(err) = sink.send(Message::Text(text)).await {
                    tracing::debug!(error = %err, "relay write failed");
                    return;
                }
                pending.flushed(len);
            }
            let _ = sink.close().await;
        });
        let mut writer_done = false;

        queue.push(&registration);
        let mut outbound = self.ctx.bus().subscribe(Topic::Outbound);
        let period = self.heartbeat.on_connect();
        let mut renew = time::interval_at(Instant::now() + period, period);
        let wipe = time::sleep(self.ctx.config().key_retention());
        tokio::pin!(wipe);

        let closed = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    queue.push(&exit_frame(&self.ctx.descriptor()));
                    break Closed::Shutdown;
                }
                _ = &mut wipe, if self.keys.is_some() => {
                    self.keys = None;
                    tracing::debug!("transient keys discarded");
                }
                _ = renew.tick() => {
                    let role = self.ctx.role();
                    queue.push(&self.ctx.descriptor().to_frame().with("_pid", role.renew_pid()));
                }
                Some(frame) = outbound.recv() => {
                    queue.offer(&frame);
                }
                _ = &mut writer, if !writer_done => {
                    writer_done = true;
                    break Closed::Lost { code: CLOSE_ABNORMAL };
                }
                msg = stream.next() => {
                    let text = match msg {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                            Ok(text) => text,
                            Err(_) => {
                                tracing::debug!("dropping non-utf8 frame");
                                continue;
                            }
                        },
                        Some(Ok(Message::Close(frame))) => {
                            let code = frame.map(|f| u16::from(f.code)).unwrap_or(CLOSE_NO_STATUS);
                            break Closed::Lost { code };
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(err)) => {
                            tracing::debug!(error = %err, "relay read failed");
                            break Closed::Lost { code: CLOSE_ABNORMAL };
                        }
                        None => break Closed::Lost { code: CLOSE_ABNORMAL },
                    };
                    match self.dispatch(&text, &queue).await {
                        Ok(Some(closed)) => break closed,
                        Ok(None) => {}
                        Err(err) => return Err(err),
                    }
                }
            }
        };

        drop(outbound);
        drop(queue);
        if !writer_done && time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
            writer.abort();
        }
        Ok(closed)
    }

    async fn dispatch(&mut self, text: &str, queue: &OutboundQueue) -> Result<Option<Closed>> {
        let frames = match Frame::parse_batch(text) {
            Ok(frames) => frames,
            Err(err) => {
                tracing::debug!(error = %err, "dropping malformed frame");
                return Ok(None);
            }
        };
        for frame in frames {
            if let Some(code) = router::control_code(&frame) {
                if let Some(closed) = self.on_control(code, frame, queue).await? {
                    return Ok(Some(closed));
                }
                continue;
            }
            if let Err(err) = self.endpoint.handle(&self.ctx, frame).await {
                if err.is_fatal() {
                    return Err(err);
                }
                tracing::debug!(error = %err, "frame handling failed");
            }
        }
        Ok(None)
    }

    async fn on_control(
        &mut self,
        code: u16,
        frame: Frame,
        queue: &OutboundQueue,
    ) -> Result<Option<Closed>> {
        tracing::debug!(code, "control frame");
        let current = self.ctx.descriptor();
        let action = self.control.handle(code, &frame, &current, self.connections)?;
        let outcome = match action {
            ControlAction::Activate { descriptor } => {
                if let Some(descriptor) = descriptor {
                    self.store.save(&descriptor).await?;
                    self.ctx.replace_descriptor(descriptor);
                    self.ctx.log().record("session", "registered", &[code.to_string().as_str()]);
                }
                self.activate(code).await?;
                None
            }
            ControlAction::Renew { descriptor } => {
                self.store.save(&descriptor).await?;
                self.ctx.replace_descriptor(descriptor);
                tracing::info!("session token renewed");
                Some(Closed::Reconnect {
                    delay: Duration::ZERO,
                })
            }
            ControlAction::Reconnect => Some(Closed::Reconnect {
                delay: Duration::ZERO,
            }),
            ControlAction::ModuleUpdate(update) => {
                let root = self.ctx.config().module_root.clone();
                let response = admin::module_update_response(update, &root, self.ctx.role()).await;
                self.ctx.log().record("session", "module update", &[]);
                queue.push(&response);
                None
            }
            ControlAction::RetryRegistration { delay } => {
                tracing::info!(?delay, "registration refused, retrying");
                Some(Closed::Reconnect { delay })
            }
            ControlAction::Fatal(reason) => {
                tracing::error!(code, reason = %reason, "registration refused");
                return Err(Error::Authentication(reason));
            }
            ControlAction::SecurityCodeReset {
                reason,
                edata,
                etag,
            } => {
                let code = match (&self.keys, edata, etag) {
                    (Some(keys), Some(data), Some(tag)) => match decrypt_code(keys, &data, &tag) {
                        Ok(code) => Some(code),
                        Err(err) => {
                            tracing::warn!(error = %err, "security code could not be decrypted");
                            None
                        }
                    },
                    _ => None,
                };
                tracing::info!(reason = %reason, "security code reset");
                Some(Closed::SecurityCodeReset { reason, code })
            }
            ControlAction::Ignore => None,
        };
        self.ctx.bus().publish(&Topic::Control, frame);
        Ok(outcome)
    }

    async fn activate(&mut self, code: u16) -> Result<()> {
        if !self.ctx.state().is_registered() {
            self.ctx.transition(SessionState::Active)?;
        }
        self.policy.reset();
        tracing::info!(code, id = %self.ctx.descriptor().owner_key(), "session active");
        if let Err(err) = self.endpoint.on_active(&self.ctx, code).await {
            if err.is_fatal() {
                return Err(err);
            }
            tracing::warn!(error = %err, "activation handler failed");
        }
        Ok(())
    }
}

/// Final frame announcing that this endpoint is going away.
pub fn exit_frame(descriptor: &SessionDescriptor) -> Frame {
    descriptor
        .to_frame()
        .with("_pid", "exit")
        .with("exit", true)
        .with("active", false)
}
