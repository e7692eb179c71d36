//! Basic credentials check for HTTP tunnels
//!
//! Each HTTP tunnel may carry one `username:password` pair. Requests without
//! a matching `Authorization: Basic ...` header get a 401 challenge naming
//! the tunnel's realm.

use crate::{AuthResult, HttpAuthProvider};
use base64::Engine;
use natrelay_proto::BasicAuth;
use tracing::debug;

/// Validates a single `username:password` pair for one realm
pub struct BasicAuthProvider {
    expected: String,
    realm: String,
}

impl BasicAuthProvider {
    pub fn new(username: &str, password: &str, realm: impl Into<String>) -> Self {
        Self {
            expected: format!("{}:{}", username, password),
            realm: realm.into(),
        }
    }

    /// `user:password` from a `Basic` header value, if it decodes
    fn decode_header(value: &str) -> Option<String> {
        let (scheme, encoded) = value.trim().split_once(' ')?;
        scheme
            .eq_ignore_ascii_case("basic")
            .then(|| base64::engine::general_purpose::STANDARD.decode(encoded.trim()))?
            .ok()
            .and_then(|raw| String::from_utf8(raw).ok())
    }

    /// Compare without short-circuiting on the first differing byte
    fn matches(&self, credentials: &str) -> bool {
        let expected = self.expected.as_bytes();
        let given = credentials.as_bytes();
        if expected.len() != given.len() {
            return false;
        }
        expected
            .iter()
            .zip(given)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl From<&BasicAuth> for BasicAuthProvider {
    fn from(config: &BasicAuth) -> Self {
        Self::new(&config.username, &config.password, config.realm.clone())
    }
}

impl HttpAuthProvider for BasicAuthProvider {
    fn authenticate(&self, headers: &[(String, String)]) -> AuthResult {
        for (name, value) in headers {
            if !name.eq_ignore_ascii_case("authorization") {
                continue;
            }
            match Self::decode_header(value) {
                Some(credentials) if self.matches(&credentials) => {
                    return AuthResult::Authenticated;
                }
                Some(_) => debug!("Basic auth: invalid credentials"),
                None => debug!("Basic auth: could not decode credentials"),
            }
        }

        AuthResult::Unauthorized(self.unauthorized_response())
    }

    fn unauthorized_response(&self) -> Vec<u8> {
        const BODY: &str = "Authentication required";
        let challenge = format!("Basic realm=\"{}\"", self.realm.replace('"', "\\\""));
        let length = BODY.len().to_string();
        let mut response = String::from("HTTP/1.1 401 Unauthorized\r\n");
        for (name, value) in [
            ("WWW-Authenticate", challenge.as_str()),
            ("Content-Type", "text/plain"),
            ("Content-Length", length.as_str()),
            ("Connection", "close"),
        ] {
            response.push_str(&format!("{}: {}\r\n", name, value));
        }
        response.push_str("\r\n");
        response.push_str(BODY);
        response.into_bytes()
    }

    fn auth_type(&self) -> &'static str {
        "basic"
    }
}
