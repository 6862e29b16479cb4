//! Connection URLs: `tcp://[host]:port[?key=value[&key=value...]]`.
//!
//! | Key           | Type   | Default | Meaning                                     |
//! |---------------|--------|---------|---------------------------------------------|
//! | `listen`      | bool   | false   | accept instead of connect                   |
//! | `multiple`    | bool   | false   | keep listening after the first connection   |
//! | `nonblocking` | bool   | false   | single bounded accept attempt               |
//! | `handshake`   | string | empty   | local handshake payload                     |
//! | `timeout`     | int    | config  | connect timeout in seconds, negative = wait |
//!
//! Bools accept `true/false/1/0/yes/no/on/off`. Values are percent-decoded.

use std::str::FromStr;

use thiserror::Error;

use crate::trace::warn;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UrlError {
    #[error("missing '://' scheme separator")]
    MissingScheme,
    #[error("unsupported scheme '{0}', expected 'tcp'")]
    UnsupportedScheme(String),
    #[error("missing ':port'")]
    MissingPort,
    #[error("invalid port '{0}'")]
    InvalidPort(String),
    #[error("invalid host '{0}'")]
    InvalidHost(String),
    #[error("a host is required unless listen=true")]
    MissingHost,
    #[error("invalid boolean '{value}' for '{key}'")]
    InvalidBool { key: String, value: String },
    #[error("invalid timeout '{0}'")]
    InvalidTimeout(String),
}

/// A parsed connection URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionUrl {
    /// Host name or address; IPv6 brackets removed. Empty binds all interfaces.
    pub host: String,
    pub port: u16,
    pub listen: bool,
    pub multiple: bool,
    pub nonblocking: bool,
    pub handshake: String,
    /// Connect timeout in seconds, if the URL set one.
    pub timeout: Option<i64>,
}

fn parse_bool(key: &str, value: &str) -> Result<bool, UrlError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(UrlError::InvalidBool {
            key: key.to_owned(),
            value: value.to_owned(),
        }),
    }
}

fn split_host_port(authority: &str) -> Result<(&str, &str), UrlError> {
    if let Some(bracketed) = authority.strip_prefix('[') {
        let (host, rest) = bracketed
            .split_once(']')
            .ok_or_else(|| UrlError::InvalidHost(authority.to_owned()))?;
        let port = rest.strip_prefix(':').ok_or(UrlError::MissingPort)?;
        return Ok((host, port));
    }
    let (host, port) = authority.rsplit_once(':').ok_or(UrlError::MissingPort)?;
    if host.contains(':') {
        // Bare IPv6 literals are ambiguous without brackets.
        return Err(UrlError::InvalidHost(host.to_owned()));
    }
    Ok((host, port))
}

impl FromStr for ConnectionUrl {
    type Err = UrlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s.split_once("://").ok_or(UrlError::MissingScheme)?;
        if !scheme.eq_ignore_ascii_case("tcp") {
            return Err(UrlError::UnsupportedScheme(scheme.to_owned()));
        }
        let (authority, query) = match rest.split_once('?') {
            Some((authority, query)) => (authority, Some(query)),
            None => (rest, None),
        };
        let authority = authority.trim_end_matches('/');

        let (host, port) = split_host_port(authority)?;
        if host.contains(['/', '@', ' ']) {
            return Err(UrlError::InvalidHost(host.to_owned()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| UrlError::InvalidPort(port.to_owned()))?;

        let mut url = Self {
            host: host.to_owned(),
            port,
            listen: false,
            multiple: false,
            nonblocking: false,
            handshake: String::new(),
            timeout: None,
        };

        for (key, value) in ::url::form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
            match key.as_ref() {
                "listen" => url.listen = parse_bool(&key, &value)?,
                "multiple" => url.multiple = parse_bool(&key, &value)?,
                "nonblocking" => url.nonblocking = parse_bool(&key, &value)?,
                "handshake" => url.handshake = value.into_owned(),
                "timeout" => {
                    url.timeout = Some(
                        value
                            .parse()
                            .map_err(|_| UrlError::InvalidTimeout(value.to_string()))?,
                    );
                }
                other => warn!(key = other, "ignoring unknown connection url parameter"),
            }
        }

        if url.host.is_empty() && !url.listen {
            return Err(UrlError::MissingHost);
        }
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_url_with_defaults() {
        let url: ConnectionUrl = "tcp://localhost:11111".parse().unwrap();
        assert_eq!(url.host, "localhost");
        assert_eq!(url.port, 11111);
        assert!(!url.listen && !url.multiple && !url.nonblocking);
        assert_eq!(url.handshake, "");
        assert_eq!(url.timeout, None);
    }

    #[test]
    fn listen_url_with_empty_host() {
        let url: ConnectionUrl = "tcp://:12345?listen=true&nonblocking=1&multiple=yes"
            .parse()
            .unwrap();
        assert_eq!(url.host, "");
        assert!(url.listen && url.nonblocking && url.multiple);
    }

    #[test]
    fn handshake_is_percent_decoded() {
        let url: ConnectionUrl =
            "tcp://example.org:80?handshake=app-1.0.renderingbackend%2Egl&timeout=-1"
                .parse()
                .unwrap();
        assert_eq!(url.handshake, "app-1.0.renderingbackend.gl");
        assert_eq!(url.timeout, Some(-1));
    }

    #[test]
    fn ipv6_host_in_brackets() {
        let url: ConnectionUrl = "tcp://[::1]:2000".parse().unwrap();
        assert_eq!(url.host, "::1");
        assert_eq!(url.port, 2000);
        assert_eq!(
            "tcp://::1:2000".parse::<ConnectionUrl>(),
            Err(UrlError::InvalidHost("::1".into()))
        );
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let url: ConnectionUrl = "tcp://h:1?colour=blue&listen=off".parse().unwrap();
        assert!(!url.listen);
    }

    #[test]
    fn malformed_urls() {
        assert_eq!(
            "localhost:1".parse::<ConnectionUrl>(),
            Err(UrlError::MissingScheme)
        );
        assert_eq!(
            "udp://h:1".parse::<ConnectionUrl>(),
            Err(UrlError::UnsupportedScheme("udp".into()))
        );
        assert_eq!("tcp://h".parse::<ConnectionUrl>(), Err(UrlError::MissingPort));
        assert_eq!(
            "tcp://h:99999".parse::<ConnectionUrl>(),
            Err(UrlError::InvalidPort("99999".into()))
        );
        assert_eq!("tcp://:1".parse::<ConnectionUrl>(), Err(UrlError::MissingHost));
        assert!(matches!(
            "tcp://h:1?listen=maybe".parse::<ConnectionUrl>(),
            Err(UrlError::InvalidBool { .. })
        ));
        assert_eq!(
            "tcp://h:1?timeout=soon".parse::<ConnectionUrl>(),
            Err(UrlError::InvalidTimeout("soon".into()))
        );
    }
}
