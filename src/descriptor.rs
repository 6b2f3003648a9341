//! Connection descriptor parsing
//!
//! A relay connection is described by an `ss://` URI of the shape
//! `ss://base64(method:password)@host:port[/][?...][#...]`. The credential
//! block may use the standard or URL-safe base64 alphabet and may omit
//! padding. Parsing happens once per session and performs a single DNS
//! lookup to pre-resolve the relay host.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::net::{IpAddr, ToSocketAddrs};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("connection descriptor is empty")]
    EmptyInput,
    #[error("malformed descriptor URI: {0}")]
    MalformedUri(String),
    #[error("bad credential encoding: {0}")]
    BadCredentialEncoding(String),
}

/// Decoded relay connection settings. Immutable once parsed.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    /// Relay hostname exactly as it appeared in the URI
    pub host: String,
    /// Relay port (1-65535)
    pub port: u16,
    /// AEAD cipher identifier, e.g. "aes-256-gcm"
    pub method: String,
    /// Shared secret
    pub password: String,
    /// IP literal for the relay, or `host` verbatim when resolution failed
    pub resolved_addr: String,
}

// Manual Debug so the password never lands in logs.
impl std::fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("method", &self.method)
            .field("password", &"<redacted>")
            .field("resolved_addr", &self.resolved_addr)
            .finish()
    }
}

/// Parse an `ss://` URI into a [`ConnectionDescriptor`].
///
/// Resolution failure is non-fatal: the relay client may resolve the host
/// itself, so `resolved_addr` falls back to the verbatim hostname.
pub fn parse(uri: &str) -> Result<ConnectionDescriptor, ParseError> {
    let uri = uri.trim();
    if uri.is_empty() {
        return Err(ParseError::EmptyInput);
    }

    let rest = uri.strip_prefix("ss://").unwrap_or(uri);
    // Fragment and query carry no connection data
    let rest = rest.split('#').next().unwrap_or(rest);
    let rest = rest.split('?').next().unwrap_or(rest);
    let rest = rest.strip_suffix('/').unwrap_or(rest);

    let (userinfo, host_port) = rest
        .rsplit_once('@')
        .ok_or_else(|| ParseError::MalformedUri("no '@' separator".into()))?;

    // Split on the last ':' so bracketed IPv6 literals survive
    let (host, port_str) = host_port
        .rsplit_once(':')
        .ok_or_else(|| ParseError::MalformedUri("no port separator".into()))?;
    if host.is_empty() {
        return Err(ParseError::MalformedUri("empty host".into()));
    }
    let port: u16 = port_str
        .parse()
        .ok()
        .filter(|p| *p > 0)
        .ok_or_else(|| ParseError::MalformedUri(format!("invalid port: {port_str}")))?;

    let (method, password) = decode_userinfo(userinfo)?;

    let resolved_addr = match resolve_host(host, port) {
        Some(ip) => {
            debug!("resolved {} -> {}", host, ip);
            ip.to_string()
        }
        None => {
            warn!("could not resolve {}, relay client will resolve it itself", host);
            host.to_string()
        }
    };

    Ok(ConnectionDescriptor {
        host: host.to_string(),
        port,
        method,
        password,
        resolved_addr,
    })
}

/// Decode the base64 `method:password` credential block.
fn decode_userinfo(userinfo: &str) -> Result<(String, String), ParseError> {
    if userinfo.is_empty() {
        return Err(ParseError::BadCredentialEncoding("empty credential block".into()));
    }

    // Normalize: URL-safe alphabet to standard, then re-pad to a multiple of 4
    let mut normalized: String = userinfo
        .chars()
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            other => other,
        })
        .collect();
    while normalized.len() % 4 != 0 {
        normalized.push('=');
    }

    let decoded = BASE64
        .decode(normalized.as_bytes())
        .map_err(|e| ParseError::BadCredentialEncoding(e.to_string()))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|_| ParseError::BadCredentialEncoding("credentials are not UTF-8".into()))?;

    // Password may itself contain ':', so split on the first one only
    let (method, password) = decoded
        .split_once(':')
        .ok_or_else(|| ParseError::BadCredentialEncoding("no ':' between method and password".into()))?;
    if method.is_empty() || password.is_empty() {
        return Err(ParseError::BadCredentialEncoding("empty method or password".into()));
    }

    Ok((method.to_string(), password.to_string()))
}

fn resolve_host(host: &str, port: u16) -> Option<IpAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Some(ip);
    }
    (host, port)
        .to_socket_addrs()
        .ok()?
        .next()
        .map(|addr| addr.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    // base64("aes-256-gcm:pass")
    const CRED: &str = "YWVzLTI1Ni1nY206cGFzcw==";

    #[test]
    fn test_parse_basic_descriptor() {
        let desc = parse(&format!("ss://{CRED}@127.0.0.1:8388")).unwrap();
        assert_eq!(desc.host, "127.0.0.1");
        assert_eq!(desc.port, 8388);
        assert_eq!(desc.method, "aes-256-gcm");
        assert_eq!(desc.password, "pass");
        assert_eq!(desc.resolved_addr, "127.0.0.1");
    }

    #[test]
    fn test_parse_strips_fragment_query_and_slash() {
        let desc = parse(&format!("ss://{CRED}@127.0.0.1:8388/?plugin=none#home")).unwrap();
        assert_eq!(desc.port, 8388);
        assert_eq!(desc.method, "aes-256-gcm");
    }

    #[test]
    fn test_parse_unpadded_credentials() {
        let unpadded = CRED.trim_end_matches('=');
        let desc = parse(&format!("ss://{unpadded}@127.0.0.1:8388")).unwrap();
        assert_eq!(desc.method, "aes-256-gcm");
        assert_eq!(desc.password, "pass");
    }

    #[test]
    fn test_parse_urlsafe_alphabet() {
        // base64url("chacha20-ietf-poly1305:p?s/w>rd") uses '_' and '-'
        let standard = BASE64.encode("chacha20-ietf-poly1305:p?s/w>rd");
        let urlsafe: String = standard
            .chars()
            .map(|c| match c {
                '+' => '-',
                '/' => '_',
                other => other,
            })
            .collect();
        let urlsafe = urlsafe.trim_end_matches('=');

        let desc = parse(&format!("ss://{urlsafe}@127.0.0.1:8388")).unwrap();
        assert_eq!(desc.method, "chacha20-ietf-poly1305");
        assert_eq!(desc.password, "p?s/w>rd");
    }

    #[test]
    fn test_parse_password_containing_colon() {
        let cred = BASE64.encode("aes-128-gcm:pa:ss:wd");
        let desc = parse(&format!("ss://{cred}@10.0.0.1:443")).unwrap();
        assert_eq!(desc.method, "aes-128-gcm");
        assert_eq!(desc.password, "pa:ss:wd");
    }

    #[test]
    fn test_parse_empty_input() {
        assert_eq!(parse(""), Err(ParseError::EmptyInput));
        assert_eq!(parse("   "), Err(ParseError::EmptyInput));
    }

    #[test]
    fn test_parse_missing_at() {
        let result = parse("ss://bm90LXJlYWw6Y3JlZHM=127.0.0.1:8388");
        assert!(matches!(result, Err(ParseError::MalformedUri(_))));
    }

    #[test]
    fn test_parse_missing_port() {
        let result = parse(&format!("ss://{CRED}@hostwithoutport"));
        assert!(matches!(result, Err(ParseError::MalformedUri(_))));
    }

    #[test]
    fn test_parse_invalid_base64() {
        let result = parse("ss://!!!not-base64!!!@127.0.0.1:8388");
        assert!(matches!(result, Err(ParseError::BadCredentialEncoding(_))));
    }

    #[test]
    fn test_parse_credentials_without_colon() {
        let cred = BASE64.encode("just-a-method-no-password");
        let result = parse(&format!("ss://{cred}@127.0.0.1:8388"));
        assert!(matches!(result, Err(ParseError::BadCredentialEncoding(_))));
    }

    #[test]
    fn test_parse_unresolvable_host_falls_back() {
        let desc = parse(&format!(
            "ss://{CRED}@this-host-definitely-does-not-exist-4242.invalid:8388"
        ))
        .unwrap();
        assert_eq!(
            desc.resolved_addr,
            "this-host-definitely-does-not-exist-4242.invalid"
        );
    }

    #[test]
    fn test_parse_end_to_end_example() {
        // decoded credential is "aes-256-gcm:pass"
        let desc = parse("ss://YWVzLTI1Ni1nY206cGFzcw==@example.com:8388").unwrap();
        assert_eq!(desc.host, "example.com");
        assert_eq!(desc.port, 8388);
        assert_eq!(desc.method, "aes-256-gcm");
        assert_eq!(desc.password, "pass");
    }

    #[test]
    fn test_parse_rejects_port_zero() {
        let result = parse(&format!("ss://{CRED}@127.0.0.1:0"));
        assert!(matches!(result, Err(ParseError::MalformedUri(_))));
    }

    #[test]
    fn test_debug_redacts_password() {
        let desc = parse(&format!("ss://{CRED}@127.0.0.1:8388")).unwrap();
        let rendered = format!("{:?}", desc);
        assert!(!rendered.contains("pass\""));
        assert!(rendered.contains("<redacted>"));
    }
}
