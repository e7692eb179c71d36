//! Parsed HTTP/1.x request head

use thiserror::Error;

/// Largest request head accepted before the request is refused
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

const MAX_HEADERS: usize = 128;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HttpParseError {
    #[error("Malformed HTTP request: {0}")]
    Malformed(String),

    #[error("HTTP request head exceeds {0} bytes")]
    TooLarge(usize),
}

/// Request line and headers of one HTTP/1.x request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequestHead {
    pub method: String,
    pub path: String,
    /// Minor version: 0 for HTTP/1.0, 1 for HTTP/1.1
    pub version: u8,
    pub headers: Vec<(String, String)>,
}

impl HttpRequestHead {
    /// Parse a head from the start of `buf`.
    ///
    /// Returns `Ok(None)` while the head is incomplete, otherwise the head
    /// and the number of bytes it occupied (the body starts right after).
    pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>, HttpParseError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);

        let consumed = match req.parse(buf) {
            Ok(httparse::Status::Complete(n)) => n,
            Ok(httparse::Status::Partial) => {
                if buf.len() >= MAX_HEAD_SIZE {
                    return Err(HttpParseError::TooLarge(MAX_HEAD_SIZE));
                }
                return Ok(None);
            }
            Err(e) => return Err(HttpParseError::Malformed(e.to_string())),
        };

        if consumed > MAX_HEAD_SIZE {
            return Err(HttpParseError::TooLarge(MAX_HEAD_SIZE));
        }

        let head = Self {
            method: req.method.unwrap_or("GET").to_string(),
            path: req.path.unwrap_or("/").to_string(),
            version: req.version.unwrap_or(1),
            headers: req
                .headers
                .iter()
                .map(|h| {
                    (
                        h.name.to_string(),
                        String::from_utf8_lossy(h.value).into_owned(),
                    )
                })
                .collect(),
        };

        Ok(Some((head, consumed)))
    }

    /// First value of a header, case-insensitive
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Replace every header of this name with a single value
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.remove_header(name);
        self.headers.push((name.to_string(), value.into()));
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn host(&self) -> Option<&str> {
        self.header("host")
    }

    /// Protocol switch request (WebSocket and friends)
    pub fn is_upgrade(&self) -> bool {
        self.header("upgrade").is_some()
            && self
                .header_values("connection")
                .iter()
                .flat_map(|v| v.split(','))
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
    }

    /// Serialize back to wire form, terminated by the blank line
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(
            format!("{} {} HTTP/1.{}\r\n", self.method, self.path, self.version).as_bytes(),
        );
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_complete_head_with_body() {
        let raw = b"POST /api HTTP/1.1\r\nHost: a.example.com\r\nContent-Length: 4\r\n\r\nbody";
        let (head, consumed) = HttpRequestHead::parse(raw).unwrap().unwrap();

        assert_eq!(head.method, "POST");
        assert_eq!(head.path, "/api");
        assert_eq!(head.version, 1);
        assert_eq!(head.host(), Some("a.example.com"));
        assert_eq!(&raw[consumed..], b"body");
    }

    #[test]
    fn test_partial_head() {
        let raw = b"GET / HTTP/1.1\r\nHost: a.exa";
        assert_eq!(HttpRequestHead::parse(raw).unwrap(), None);
    }

    #[test]
    fn test_malformed_head() {
        let raw = b"GET / HTTP/1.1\r\nBad Header\r\n\r\n";
        assert!(matches!(
            HttpRequestHead::parse(raw),
            Err(HttpParseError::Malformed(_))
        ));
    }

    #[test]
    fn test_oversized_partial_head() {
        let mut raw = b"GET / HTTP/1.1\r\nX-Big: ".to_vec();
        raw.extend(std::iter::repeat(b'a').take(MAX_HEAD_SIZE));
        assert_eq!(
            HttpRequestHead::parse(&raw),
            Err(HttpParseError::TooLarge(MAX_HEAD_SIZE))
        );
    }

    #[test]
    fn test_serialize_after_rewrite() {
        let raw = b"GET /x HTTP/1.0\r\nHost: a.example.com\r\nConnection: keep-alive\r\n\r\n";
        let (mut head, _) = HttpRequestHead::parse(raw).unwrap().unwrap();
        head.set_header("Connection", "close");

        assert_eq!(
            head.to_bytes(),
            b"GET /x HTTP/1.0\r\nHost: a.example.com\r\nConnection: close\r\n\r\n".to_vec()
        );
    }

    #[test]
    fn test_upgrade_detection() {
        let raw = b"GET /ws HTTP/1.1\r\nHost: a\r\nConnection: keep-alive, Upgrade\r\nUpgrade: websocket\r\n\r\n";
        let (head, _) = HttpRequestHead::parse(raw).unwrap().unwrap();
        assert!(head.is_upgrade());

        let raw = b"GET / HTTP/1.1\r\nHost: a\r\n\r\n";
        let (head, _) = HttpRequestHead::parse(raw).unwrap().unwrap();
        assert!(!head.is_upgrade());
    }
}
