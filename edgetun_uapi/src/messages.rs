//! Control protocol messages
//!
//! Requests and responses are newline separated `key=value` lines terminated
//! by a blank line. A request starts with `get=1`, `get=peers` or `set=1`; a
//! response always starts with `errno=<code>`.

use crate::error::{ProtocolError, ProtocolResult};
use crate::model::{
    parse_allowed_ip, parse_endpoint, parse_hex_key, parse_number, parse_private_key, Key, Peer,
    PrivateKey, KEY_LEN,
};
use ipnet::IpNet;
use std::fmt::Write as _;
use std::net::SocketAddr;

/// Status reported in the `errno=` line of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Success,
    /// Failure while applying or reading the running state
    Io,
    /// Unsupported key or unparseable value
    Invalid,
    /// Request does not follow the line grammar
    Protocol,
}

impl ErrorCode {
    pub fn errno(self) -> i32 {
        match self {
            ErrorCode::Success => 0,
            ErrorCode::Io => libc::EIO,
            ErrorCode::Invalid => libc::EINVAL,
            ErrorCode::Protocol => libc::EPROTO,
        }
    }
}

/// Which part of the configuration a get request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetScope {
    /// `get=1`: interface keys followed by every peer
    All,
    /// `get=peers`: peers only
    Peers,
}

/// Incremental change to one peer, introduced by `public_key=` in a set request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerUpdate {
    pub public_key: Key,
    pub remove: bool,
    pub update_only: bool,
    pub endpoint: Option<SocketAddr>,
    /// `Some(0)` disables keepalive.
    pub persistent_keepalive: Option<u16>,
    pub replace_allowed_ips: bool,
    pub allowed_ips: Vec<IpNet>,
}

impl PeerUpdate {
    pub fn new(public_key: Key) -> Self {
        Self {
            public_key,
            remove: false,
            update_only: false,
            endpoint: None,
            persistent_keepalive: None,
            replace_allowed_ips: false,
            allowed_ips: Vec::new(),
        }
    }

    /// An update that makes the target peer exactly equal to `peer`.
    pub fn from_peer(peer: &Peer) -> Self {
        Self {
            endpoint: peer.endpoint,
            persistent_keepalive: Some(peer.persistent_keepalive.unwrap_or(0)),
            replace_allowed_ips: true,
            allowed_ips: peer.allowed_ips.clone(),
            ..Self::new(peer.public_key)
        }
    }

    fn encode_into(&self, out: &mut String) {
        let _ = writeln!(out, "public_key={}", self.public_key.to_hex());
        if self.remove {
            out.push_str("remove=true\n");
            return;
        }
        if self.update_only {
            out.push_str("update_only=true\n");
        }
        if let Some(endpoint) = self.endpoint {
            let _ = writeln!(out, "endpoint={endpoint}");
        }
        if let Some(seconds) = self.persistent_keepalive {
            let _ = writeln!(out, "persistent_keepalive_interval={seconds}");
        }
        if self.replace_allowed_ips {
            out.push_str("replace_allowed_ips=true\n");
        }
        for net in &self.allowed_ips {
            let _ = writeln!(out, "allowed_ip={net}");
        }
    }
}

/// One mutation carried by a set request, applied in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetOperation {
    /// `None` clears the key (sent as all zeroes)
    PrivateKey(Option<PrivateKey>),
    ListenPort(u16),
    ReplacePeers,
    Peer(PeerUpdate),
}

/// A parsed control request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    Get(GetScope),
    Set(Vec<SetOperation>),
}

impl ControlRequest {
    /// Parse the lines of one request, without the terminating blank line.
    pub fn parse<S: AsRef<str>>(lines: &[S]) -> ProtocolResult<Self> {
        let (first, rest) = lines.split_first().ok_or(ProtocolError::MissingCommand)?;
        let (command, value) = split_line(first.as_ref())?;

        match command {
            "get" => {
                let scope = match value {
                    "1" => GetScope::All,
                    "peers" => GetScope::Peers,
                    other => return Err(ProtocolError::invalid("get", other)),
                };
                if let Some(extra) = rest.first() {
                    return Err(ProtocolError::MalformedLine(extra.as_ref().to_string()));
                }
                Ok(ControlRequest::Get(scope))
            }
            "set" => {
                if value != "1" {
                    return Err(ProtocolError::invalid("set", value));
                }
                Ok(ControlRequest::Set(parse_set_lines(rest)?))
            }
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }

    /// Parse configuration text in set-request form. The leading `set=1` line
    /// is optional and blank lines are skipped.
    pub fn parse_set_body(text: &str) -> ProtocolResult<Vec<SetOperation>> {
        let mut lines: Vec<&str> = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();
        if lines.first() == Some(&"set=1") {
            lines.remove(0);
        }
        parse_set_lines(&lines)
    }

    /// Encode the request including its terminating blank line.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        match self {
            ControlRequest::Get(GetScope::All) => out.push_str("get=1\n"),
            ControlRequest::Get(GetScope::Peers) => out.push_str("get=peers\n"),
            ControlRequest::Set(ops) => {
                out.push_str("set=1\n");
                out.push_str(&encode_set_operations(ops));
            }
        }
        out.push('\n');
        out
    }
}

/// Encode operations as set-request body lines without the command line.
pub fn encode_set_operations(ops: &[SetOperation]) -> String {
    let mut out = String::new();
    for op in ops {
        match op {
            SetOperation::PrivateKey(Some(key)) => {
                let _ = writeln!(out, "private_key={}", key.key().to_hex());
            }
            SetOperation::PrivateKey(None) => {
                let _ = writeln!(out, "private_key={}", "0".repeat(KEY_LEN * 2));
            }
            SetOperation::ListenPort(port) => {
                let _ = writeln!(out, "listen_port={port}");
            }
            SetOperation::ReplacePeers => out.push_str("replace_peers=true\n"),
            SetOperation::Peer(update) => update.encode_into(&mut out),
        }
    }
    out
}

fn parse_set_lines<S: AsRef<str>>(lines: &[S]) -> ProtocolResult<Vec<SetOperation>> {
    let mut ops = Vec::new();
    let mut peer: Option<PeerUpdate> = None;

    for line in lines {
        let (key, value) = split_line(line.as_ref())?;
        match key {
            "private_key" | "listen_port" | "replace_peers" => {
                if peer.is_some() {
                    return Err(ProtocolError::InterfaceKeyInPeer(key.to_string()));
                }
                ops.push(match key {
                    "private_key" => SetOperation::PrivateKey(parse_private_key(key, value)?),
                    "listen_port" => SetOperation::ListenPort(parse_number(key, value)?),
                    _ => {
                        parse_true(key, value)?;
                        SetOperation::ReplacePeers
                    }
                });
            }
            "public_key" => {
                if let Some(done) = peer.take() {
                    ops.push(SetOperation::Peer(done));
                }
                peer = Some(PeerUpdate::new(parse_hex_key(key, value)?));
            }
            "remove" | "update_only" | "endpoint" | "persistent_keepalive_interval"
            | "replace_allowed_ips" | "allowed_ip" | "protocol_version" => {
                let current = peer
                    .as_mut()
                    .ok_or_else(|| ProtocolError::PeerKeyWithoutPeer(key.to_string()))?;
                match key {
                    "remove" => current.remove = parse_true(key, value)?,
                    "update_only" => current.update_only = parse_true(key, value)?,
                    "endpoint" => current.endpoint = Some(parse_endpoint(key, value)?),
                    "persistent_keepalive_interval" => {
                        current.persistent_keepalive = Some(parse_number(key, value)?)
                    }
                    "replace_allowed_ips" => {
                        current.replace_allowed_ips = parse_true(key, value)?
                    }
                    "allowed_ip" => current.allowed_ips.push(parse_allowed_ip(key, value)?),
                    _ => {
                        if value != "1" {
                            return Err(ProtocolError::invalid(key, value));
                        }
                    }
                }
            }
            other => return Err(ProtocolError::UnsupportedKey(other.to_string())),
        }
    }

    if let Some(done) = peer.take() {
        ops.push(SetOperation::Peer(done));
    }
    Ok(ops)
}

fn parse_true(key: &str, value: &str) -> ProtocolResult<bool> {
    match value {
        "true" => Ok(true),
        _ => Err(ProtocolError::invalid(key, value)),
    }
}

fn split_line(line: &str) -> ProtocolResult<(&str, &str)> {
    match line.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key, value)),
        _ => Err(ProtocolError::MalformedLine(line.to_string())),
    }
}

/// A control response: errno plus the pairs answering a get request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlResponse {
    pub errno: i32,
    pub entries: Vec<(String, String)>,
}

impl ControlResponse {
    pub fn ok() -> Self {
        Self {
            errno: 0,
            entries: Vec::new(),
        }
    }

    pub fn error(code: ErrorCode) -> Self {
        Self {
            errno: code.errno(),
            entries: Vec::new(),
        }
    }

    pub fn with_entries(entries: Vec<(String, String)>) -> Self {
        Self { errno: 0, entries }
    }

    pub fn is_success(&self) -> bool {
        self.errno == 0
    }

    /// First value for `key`, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Encode the response, errno first, including the terminating blank line.
    pub fn encode(&self) -> String {
        let mut out = format!("errno={}\n", self.errno);
        for (key, value) in &self.entries {
            let _ = writeln!(out, "{key}={value}");
        }
        out.push('\n');
        out
    }

    /// Parse response lines. The `errno=` line is required and must come first.
    pub fn parse<S: AsRef<str>>(lines: &[S]) -> ProtocolResult<Self> {
        let (first, rest) = lines.split_first().ok_or(ProtocolError::MissingErrno)?;
        let errno = match split_line(first.as_ref()) {
            Ok(("errno", value)) => parse_number("errno", value)?,
            _ => return Err(ProtocolError::MissingErrno),
        };

        let entries = rest
            .iter()
            .map(|line| split_line(line.as_ref()).map(|(k, v)| (k.to_string(), v.to_string())))
            .collect::<ProtocolResult<Vec<_>>>()?;

        Ok(Self { errno, entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> Key {
        Key::from_bytes([byte; KEY_LEN])
    }

    #[test]
    fn parse_get_requests() {
        assert_eq!(
            ControlRequest::parse(&["get=1"]).unwrap(),
            ControlRequest::Get(GetScope::All)
        );
        assert_eq!(
            ControlRequest::parse(&["get=peers"]).unwrap(),
            ControlRequest::Get(GetScope::Peers)
        );
        assert!(matches!(
            ControlRequest::parse(&["get=2"]),
            Err(ProtocolError::InvalidValue { .. })
        ));
    }

    #[test]
    fn parse_set_request() {
        let k = key(1);
        let lines = vec![
            "set=1".to_string(),
            "listen_port=51820".to_string(),
            "replace_peers=true".to_string(),
            format!("public_key={}", k.to_hex()),
            "endpoint=192.0.2.1:51820".to_string(),
            "persistent_keepalive_interval=25".to_string(),
            "allowed_ip=10.0.0.0/24".to_string(),
        ];

        let request = ControlRequest::parse(&lines).unwrap();
        let ControlRequest::Set(ops) = request else {
            panic!("expected set request");
        };

        assert_eq!(ops.len(), 3);
        assert_eq!(ops[0], SetOperation::ListenPort(51820));
        assert_eq!(ops[1], SetOperation::ReplacePeers);
        match &ops[2] {
            SetOperation::Peer(update) => {
                assert_eq!(update.public_key, k);
                assert_eq!(update.persistent_keepalive, Some(25));
                assert_eq!(update.allowed_ips, vec!["10.0.0.0/24".parse().unwrap()]);
            }
            other => panic!("unexpected operation {:?}", other),
        }
    }

    #[test]
    fn parse_errors_map_to_errno() {
        let missing = ControlRequest::parse::<&str>(&[]).unwrap_err();
        assert_eq!(missing.error_code(), ErrorCode::Protocol);

        let garbage = ControlRequest::parse(&["hello"]).unwrap_err();
        assert_eq!(garbage, ProtocolError::MalformedLine("hello".to_string()));
        assert_eq!(garbage.error_code().errno(), libc::EPROTO);

        let unknown = ControlRequest::parse(&["set=1", "fwmark=1"]).unwrap_err();
        assert_eq!(unknown.error_code().errno(), libc::EINVAL);

        let orphan = ControlRequest::parse(&["set=1", "allowed_ip=10.0.0.0/24"]).unwrap_err();
        assert!(matches!(orphan, ProtocolError::PeerKeyWithoutPeer(_)));

        let k = key(2).to_hex();
        let misplaced =
            ControlRequest::parse(&["set=1".to_string(), format!("public_key={k}"), "listen_port=1".to_string()])
                .unwrap_err();
        assert!(matches!(misplaced, ProtocolError::InterfaceKeyInPeer(_)));
    }

    #[test]
    fn zero_private_key_clears() {
        let body = encode_set_operations(&[SetOperation::PrivateKey(None)]);
        let ops = ControlRequest::parse_set_body(&body).unwrap();
        assert_eq!(ops, vec![SetOperation::PrivateKey(None)]);
    }

    #[test]
    fn set_body_accepts_optional_command_line() {
        let with = ControlRequest::parse_set_body("set=1\nlisten_port=7\n\n").unwrap();
        let without = ControlRequest::parse_set_body("listen_port=7").unwrap();
        assert_eq!(with, without);
    }

    #[test]
    fn request_encoding_ends_with_blank_line() {
        assert_eq!(ControlRequest::Get(GetScope::Peers).encode(), "get=peers\n\n");
        let encoded = ControlRequest::Set(vec![SetOperation::ListenPort(9)]).encode();
        assert_eq!(encoded, "set=1\nlisten_port=9\n\n");
    }

    #[test]
    fn response_errno_comes_first() {
        let response = ControlResponse::with_entries(vec![("listen_port".into(), "1".into())]);
        assert_eq!(response.encode(), "errno=0\nlisten_port=1\n\n");

        let parsed = ControlResponse::parse(&["errno=22"]).unwrap();
        assert_eq!(parsed.errno, libc::EINVAL);
        assert!(!parsed.is_success());

        assert_eq!(
            ControlResponse::parse(&["listen_port=1", "errno=0"]),
            Err(ProtocolError::MissingErrno)
        );
    }
}
