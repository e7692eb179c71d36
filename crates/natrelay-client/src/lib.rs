//! Tunnel client library
//!
//! Registers tunnels with a relay server and serves their sessions by dialing
//! the local service. [`TunnelDescriptor`] keeps a tunnel alive across
//! disconnects; [`connect`] is the single-attempt building block below it.

pub mod config;
pub mod connector;
pub mod error;
pub mod handler;
pub mod supervisor;
pub mod tls;

pub use config::{ClientConfig, RetryPolicy};
pub use connector::LocalConnector;
pub use error::ClientError;
pub use handler::{connect, ConnectedTunnel, SessionEnd};
pub use supervisor::{TunnelDescriptor, TunnelObserver, TunnelState};
pub use tls::{build_tls_connector, tls_connector_from_pem};
