//! M2M protocol engine.
//!
//! Devices and clients talk through a relay over one persistent WebSocket
//! per process. Registration is authenticated with a secp521r1 key exchange
//! against a pinned relay identity; credentials are sealed with AES-256-GCM
//! under PBKDF2-derived keys before they leave the process. On top of the
//! session sit the device watch engine (edge-triggered delivery of channel
//! and GPIO values) and the client access facade.

pub mod admin;
pub mod bus;
pub mod client;
pub mod config;
pub mod crypto;
pub mod device;
pub mod e2e_common;
pub mod error;
pub mod eventlog;
pub mod frame;
pub mod handshake;
pub mod router;
pub mod session;

pub use bus::{EventBus, Topic};
pub use client::{Client, RemoteDevice, WatchOptions, WatchStream};
pub use config::Config;
pub use crypto::{CredentialSource, Credentials, StaticCredentials};
pub use device::{Device, GpioDriver, SimulatedGpio};
pub use error::{Error, Result};
pub use eventlog::{EventLog, FileEventLog, NullEventLog};
pub use frame::{EndpointId, Frame};
pub use handshake::{HandshakeError, KeySource, RelayKeySource};
pub use session::{
    Endpoint, Role, Session, SessionContext, SessionDescriptor, SessionExit, SessionHandle,
    SessionState,
};
