//! HTTP request interception for vhost tunnels
//!
//! Every HTTP request routed to a tunnel passes through an
//! [`HttpRequestInterceptor`] before it is forwarded. The interceptor may
//! answer the request itself (a 401 basic-auth challenge, for instance) or
//! rewrite the request head in place and let it through.
//!
//! # Usage
//!
//! ```ignore
//! use natrelay_http_auth::{DefaultHttpInterceptor, HttpRequestHead, HttpRequestInterceptor};
//!
//! let interceptor = DefaultHttpInterceptor;
//! let (mut head, _) = HttpRequestHead::parse(raw)?.unwrap();
//!
//! if let Some(response) = interceptor.handle(local, remote, &request, &mut head) {
//!     // write `response` back to the peer and stop
//! }
//! ```

mod basic;
mod header;
mod request;

pub use basic::BasicAuthProvider;
pub use header::HeaderRewriter;
pub use request::{HttpParseError, HttpRequestHead, MAX_HEAD_SIZE};

use std::net::SocketAddr;

use natrelay_proto::TunnelRequest;
use tracing::debug;

/// Authentication result
#[derive(Debug, Clone)]
pub enum AuthResult {
    /// Request is authenticated (no auth required or valid credentials)
    Authenticated,
    /// Request requires authentication - includes the 401 response bytes
    Unauthorized(Vec<u8>),
}

/// Trait for implementing HTTP authentication providers
pub trait HttpAuthProvider: Send + Sync {
    /// Authenticate the request based on headers
    fn authenticate(&self, headers: &[(String, String)]) -> AuthResult;

    /// Generate the 401 Unauthorized response for this auth type
    fn unauthorized_response(&self) -> Vec<u8>;

    /// Return the authentication type name (for logging)
    fn auth_type(&self) -> &'static str;
}

/// Policy applied to each inbound HTTP request of a tunnel
pub trait HttpRequestInterceptor: Send + Sync {
    /// Returns a full HTTP response to short-circuit the request, or `None`
    /// to forward it. Header rewrites are applied to `head` in place.
    fn handle(
        &self,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        request: &TunnelRequest,
        head: &mut HttpRequestHead,
    ) -> Option<Vec<u8>>;
}

/// Basic-auth challenge followed by the tunnel's set/add header rewrites
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHttpInterceptor;

impl HttpRequestInterceptor for DefaultHttpInterceptor {
    fn handle(
        &self,
        _local_addr: SocketAddr,
        remote_addr: SocketAddr,
        request: &TunnelRequest,
        head: &mut HttpRequestHead,
    ) -> Option<Vec<u8>> {
        if let Some(basic) = request.basic_auth.as_ref().filter(|b| b.enabled) {
            let provider = BasicAuthProvider::from(basic);
            if let AuthResult::Unauthorized(response) = provider.authenticate(&head.headers) {
                debug!("Rejecting {} {} from {}: basic auth", head.method, head.path, remote_addr);
                return Some(response);
            }
        }

        HeaderRewriter::new(&request.set_headers, &request.add_headers)
            .apply(&mut head.headers, remote_addr);
        None
    }
}

/// Minimal complete HTTP/1.1 response with a plain-text body
pub fn simple_response(status: u16, reason: &str, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        status,
        reason,
        body.len(),
        body
    )
    .into_bytes()
}
