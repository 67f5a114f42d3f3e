//! IRC client protocol session engine.
//!
//! `ircore` owns the logical state of a single server connection: it
//! decodes protocol lines into typed messages, dispatches them through a
//! collision-checked command registry, negotiates IRCv3 capabilities,
//! tracks joined channels and their members, reconciles bouncer history
//! replay against persisted state, and drives the connect/disconnect/
//! reconnect lifecycle with pluggable backoff.
//!
//! The embedding application supplies the transport, the user directory,
//! durable storage and the transfer subsystem through the traits in
//! [`collab`]; everything else is internal.
//!
//! ```no_run
//! use std::sync::Arc;
//! use ircore::config::EngineConfig;
//! use ircore::lifecycle::ConnectionController;
//! use ircore::session::Session;
//! # fn collaborators() -> (Arc<dyn ircore::collab::Directory>,
//! #     Arc<dyn ircore::collab::Storage>, Arc<dyn ircore::collab::Connector>) { unimplemented!() }
//!
//! # async fn run() {
//! let (directory, storage, connector) = collaborators();
//! let config = EngineConfig::default();
//! let session = Session::new(&config, directory, storage);
//! let controller = ConnectionController::new(Arc::clone(&session), connector, config);
//! controller.connect();
//! # }
//! ```

pub mod batch;
pub mod caps;
pub mod channel;
pub mod collab;
pub mod config;
pub mod correlate;
pub mod error;
pub mod event;
pub mod filter;
pub mod handlers;
pub mod isupport;
pub mod lifecycle;
pub mod net;
pub mod proto;
pub mod registry;
pub mod replay;
pub mod session;

pub use config::EngineConfig;
pub use error::{ConnectError, CorrelateError, DisconnectReason, ProtocolError};
pub use event::{ChatEvent, ChatEventKind, ConnectionInfo, SenderInfo, SessionObserver};
pub use lifecycle::{BackoffPolicy, ConnectionController, RuleBackoff};
pub use net::TcpConnector;
pub use proto::{Message, Prefix, Verb};
pub use session::Session;
