//! Proxy endpoint parsing.

use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

/// Errors from parsing a proxy line.
#[derive(Debug, thiserror::Error)]
pub enum ProxyParseError {
    #[error("proxy '{0}' has no port")]
    MissingPort(String),
    #[error("proxy '{0}' has an invalid port")]
    InvalidPort(String),
    #[error("proxy '{0}' has no host")]
    MissingHost(String),
    #[error("proxy '{input}' uses unsupported scheme '{scheme}'")]
    UnsupportedScheme { input: String, scheme: String },
    #[error("proxy '{input}' is not a valid URL: {source}")]
    InvalidUrl {
        input: String,
        #[source]
        source: url::ParseError,
    },
}

/// Proxy protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyScheme {
    Http,
    Https,
    Socks4,
    Socks5,
    Socks5h,
}

impl ProxyScheme {
    fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "http" => Some(ProxyScheme::Http),
            "https" => Some(ProxyScheme::Https),
            "socks4" => Some(ProxyScheme::Socks4),
            "socks5" => Some(ProxyScheme::Socks5),
            "socks5h" => Some(ProxyScheme::Socks5h),
            _ => None,
        }
    }

    pub fn is_socks(&self) -> bool {
        matches!(
            self,
            ProxyScheme::Socks4 | ProxyScheme::Socks5 | ProxyScheme::Socks5h
        )
    }
}

impl fmt::Display for ProxyScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyScheme::Http => write!(f, "http"),
            ProxyScheme::Https => write!(f, "https"),
            ProxyScheme::Socks4 => write!(f, "socks4"),
            ProxyScheme::Socks5 => write!(f, "socks5"),
            ProxyScheme::Socks5h => write!(f, "socks5h"),
        }
    }
}

/// A parsed proxy. The full URL (credentials included) is only exposed via [`ProxyEndpoint::url`].
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    pub scheme: ProxyScheme,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    password: Option<String>,
    url: String,
}

impl ProxyEndpoint {
    /// Parse `host:port` (plain HTTP proxy) or a full `scheme://[user[:pass]@]host:port` URL.
    pub fn parse(input: &str) -> Result<Self, ProxyParseError> {
        let input = input.trim();

        if !input.contains("://") {
            let (host, port) = input
                .split_once(':')
                .ok_or_else(|| ProxyParseError::MissingPort(input.to_string()))?;
            let host = host.trim();
            if host.is_empty() {
                return Err(ProxyParseError::MissingHost(input.to_string()));
            }
            let port: u16 = port
                .trim()
                .parse()
                .map_err(|_| ProxyParseError::InvalidPort(input.to_string()))?;
            return Ok(Self {
                scheme: ProxyScheme::Http,
                host: host.to_string(),
                port,
                username: None,
                password: None,
                url: format!("http://{}:{}", host, port),
            });
        }

        let parsed = Url::parse(input).map_err(|source| ProxyParseError::InvalidUrl {
            input: input.to_string(),
            source,
        })?;

        let scheme = ProxyScheme::from_scheme(parsed.scheme()).ok_or_else(|| {
            ProxyParseError::UnsupportedScheme {
                input: input.to_string(),
                scheme: parsed.scheme().to_string(),
            }
        })?;
        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ProxyParseError::MissingHost(input.to_string()))?
            .to_string();
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| ProxyParseError::MissingPort(input.to_string()))?;

        let username = Some(parsed.username())
            .filter(|u| !u.is_empty())
            .map(|u| u.to_string());
        let password = parsed.password().map(|p| p.to_string());

        Ok(Self {
            scheme,
            host,
            port,
            username,
            password,
            url: input.to_string(),
        })
    }

    /// Full proxy URL including credentials, for handing to the HTTP client.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn has_credentials(&self) -> bool {
        self.username.is_some() || self.password.is_some()
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.username {
            Some(user) => write!(f, "{}://{}@{}:{}", self.scheme, user, self.host, self.port),
            None => write!(f, "{}://{}:{}", self.scheme, self.host, self.port),
        }
    }
}

impl fmt::Debug for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyEndpoint")
            .field("scheme", &self.scheme)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}
