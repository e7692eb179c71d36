//! Server control plane
//!
//! Accepts control connections, admits their tunnel requests, registers the
//! tunnels and routes public TCP and HTTP traffic into them.
pub mod acceptor;
pub mod handler;
pub mod http;
pub mod interceptor;
pub mod server;
pub mod tls;

pub use acceptor::RemotePeerAcceptor;
pub use handler::TunnelHandler;
pub use http::{HttpListener, HttpPlugin};
pub use interceptor::{AdmissionError, DefaultRequestInterceptor, TunnelRequestInterceptor};
pub use server::{RelayServer, ServerConfig, ServerError};
pub use tls::{ensure_crypto_provider, load_tls_acceptor, tls_acceptor_from_pem, TlsError};
