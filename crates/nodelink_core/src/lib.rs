pub mod config;
pub mod envelope;
pub mod error;
pub mod handshake;
pub mod identity;
pub mod notify;
pub mod presence;
pub mod protocol;
pub mod state;
pub mod storage;
pub mod tail;

pub use config::*;
pub use envelope::EnvelopeRouter;
pub use error::*;
pub use handshake::{GatewaySession, GatewayStream, HandshakeClient, HandshakePhase};
pub use identity::DeviceIdentity;
pub use notify::{Locale, MemoryNotifier, Notifier, StatusChange};
pub use presence::{PresenceFilter, PresenceReconciler};
pub use state::{ConnectionState, ConnectionStateStore, ConnectionStatus, StateUpdate};
pub use tail::{FixedPath, SessionIndex, SessionTailer, TailSource};
