//! Header set/add rewriting
//!
//! `set` headers replace every existing header of the same name; `add`
//! headers are appended next to existing ones. In both, the
//! [`REMOTE_ADDR_TOKEN`] placeholder is replaced by the peer's IP address.

use std::net::SocketAddr;

use natrelay_proto::REMOTE_ADDR_TOKEN;

pub struct HeaderRewriter<'a> {
    set: &'a [(String, String)],
    add: &'a [(String, String)],
}

impl<'a> HeaderRewriter<'a> {
    pub fn new(set: &'a [(String, String)], add: &'a [(String, String)]) -> Self {
        Self { set, add }
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.add.is_empty()
    }

    pub fn apply(&self, headers: &mut Vec<(String, String)>, remote_addr: SocketAddr) {
        let remote_ip = remote_addr.ip().to_string();
        let resolve = |value: &str| value.replace(REMOTE_ADDR_TOKEN, &remote_ip);

        for (name, value) in self.set {
            headers.retain(|(existing, _)| !existing.eq_ignore_ascii_case(name));
            headers.push((name.clone(), resolve(value)));
        }

        for (name, value) in self.add {
            headers.push((name.clone(), resolve(value)));
        }
    }
}
