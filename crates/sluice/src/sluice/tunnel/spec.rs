use std::{fmt, str::FromStr};

use thiserror::Error;

pub const DEFAULT_BIND_HOST: &str = "0.0.0.0";
pub const DEFAULT_TARGET_HOST: &str = "127.0.0.1";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SpecError {
    #[error("empty tunnel spec")]
    Empty,
    #[error("udp tunnels are not supported: {0}")]
    Udp(String),
    #[error("invalid port {0:?}")]
    BadPort(String),
    #[error("invalid host {0:?}")]
    BadHost(String),
    #[error("invalid tunnel spec {0:?}")]
    Format(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Listen on the server, dial from the client.
    Reverse,
    /// Listen on the client, dial from the server.
    Forward,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for HostPort {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, SpecError> {
        let parts = split_parts(s.trim())?;
        match parts.as_slice() {
            [host, port] => Ok(HostPort::new(parse_host(host)?, parse_port(port)?)),
            _ => Err(SpecError::Format(s.to_string())),
        }
    }
}

/// One requested tunnel.
///
/// Text form: `[R:][bind_host:]bind_port:target_host:target_port[/tcp]`, plus
/// the shorthands `port`, `bind_port:target_port` and `target_host:target_port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TunnelSpec {
    pub direction: Direction,
    pub bind: HostPort,
    pub target: HostPort,
}

impl TunnelSpec {
    pub fn is_reverse(&self) -> bool {
        self.direction == Direction::Reverse
    }

    /// The address a user must be allowed to use for this spec.
    pub fn authorization_addr(&self) -> &HostPort {
        match self.direction {
            Direction::Reverse => &self.bind,
            Direction::Forward => &self.target,
        }
    }
}

impl fmt::Display for TunnelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_reverse() {
            f.write_str("R:")?;
        }
        write!(f, "{}:{}", self.bind, self.target)
    }
}

impl FromStr for TunnelSpec {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, SpecError> {
        let raw = s.trim();
        if raw.is_empty() {
            return Err(SpecError::Empty);
        }

        let mut body = raw;
        if let Some((head, proto)) = raw.rsplit_once('/') {
            match proto.to_ascii_lowercase().as_str() {
                "tcp" => body = head,
                "udp" => return Err(SpecError::Udp(raw.to_string())),
                _ => return Err(SpecError::Format(raw.to_string())),
            }
        }

        let mut direction = Direction::Forward;
        if let Some(rest) = body
            .strip_prefix("R:")
            .or_else(|| body.strip_prefix("r:"))
        {
            direction = Direction::Reverse;
            body = rest;
        }

        let parts = split_parts(body)?;
        let (bind, target) = match parts.as_slice() {
            [port] => {
                let port = parse_port(port)?;
                (
                    HostPort::new(DEFAULT_BIND_HOST, port),
                    HostPort::new(DEFAULT_TARGET_HOST, port),
                )
            }
            [a, b] if is_port(a) => (
                HostPort::new(DEFAULT_BIND_HOST, parse_port(a)?),
                HostPort::new(DEFAULT_TARGET_HOST, parse_port(b)?),
            ),
            [host, port] => {
                let port = parse_port(port)?;
                (
                    HostPort::new(DEFAULT_BIND_HOST, port),
                    HostPort::new(parse_host(host)?, port),
                )
            }
            [bind_port, host, port] => (
                HostPort::new(DEFAULT_BIND_HOST, parse_port(bind_port)?),
                HostPort::new(parse_host(host)?, parse_port(port)?),
            ),
            [bind_host, bind_port, host, port] => (
                HostPort::new(parse_host(bind_host)?, parse_port(bind_port)?),
                HostPort::new(parse_host(host)?, parse_port(port)?),
            ),
            _ => return Err(SpecError::Format(raw.to_string())),
        };

        Ok(TunnelSpec {
            direction,
            bind,
            target,
        })
    }
}

/// Splits on `:` outside `[...]` so IPv6 hosts can be written bracketed.
fn split_parts(s: &str) -> Result<Vec<&str>, SpecError> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| SpecError::Format(s.to_string()))?
            }
            ':' if depth == 0 => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(SpecError::Format(s.to_string()));
    }
    parts.push(&s[start..]);
    Ok(parts)
}

fn is_port(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

fn parse_port(s: &str) -> Result<u16, SpecError> {
    match s.trim().parse::<u16>() {
        Ok(p) if p > 0 => Ok(p),
        _ => Err(SpecError::BadPort(s.to_string())),
    }
}

fn parse_host(s: &str) -> Result<String, SpecError> {
    let s = s.trim();
    if let Some(inner) = s.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
        return match inner.parse::<std::net::Ipv6Addr>() {
            Ok(_) => Ok(inner.to_string()),
            Err(_) => Err(SpecError::BadHost(s.to_string())),
        };
    }
    let valid = !s.is_empty()
        && s.len() <= 253
        && s
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'_'));
    if !valid {
        return Err(SpecError::BadHost(s.to_string()));
    }
    Ok(s.to_ascii_lowercase())
}
