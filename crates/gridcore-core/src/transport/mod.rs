//! One HTTPS session bound to one server.
//!
//! A [`Transport`] owns a blocking client configured from the trust store
//! and an optional proxy, and speaks the worker's request conventions:
//! every request carries `Authorization`, every PUT/POST body carries
//! `Content-MD5` over the exact bytes sent, and a `Content-MD5` on a
//! response is verified before the body is handed to the caller.

use reqwest::Method;

use crate::codec::md5_hex;
use crate::error::WorkerError;
use crate::trust::{TrustStore, VerifyMode};

/// Default port when the address omits one.
pub const DEFAULT_PORT: u16 = 443;

/// A parsed `[scheme://]host[:port]` server address.
///
/// The scheme defaults to `https`; an explicit `http://` prefix is honored
/// for local development and test servers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddr {
    /// URL scheme, `https` unless explicitly overridden.
    pub scheme: String,
    /// Host name or literal IP.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl ServerAddr {
    /// Parses `[scheme://]host[:port]`.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Network`] on an empty host or unparsable
    /// port.
    pub fn parse(address: &str) -> Result<Self, WorkerError> {
        let (scheme, rest) = match address.split_once("://") {
            Some((s, rest)) => (s.to_string(), rest),
            None => ("https".to_string(), address),
        };
        let rest = rest.trim_end_matches('/');
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|e| WorkerError::Network(format!("bad port in '{address}': {e}")))?;
                (host, port)
            },
            _ => (rest, DEFAULT_PORT),
        };
        if host.is_empty() {
            return Err(WorkerError::Network(format!("empty host in '{address}'")));
        }
        Ok(Self {
            scheme,
            host: host.to_string(),
            port,
        })
    }

    /// Returns the base URL for this address, without a trailing slash.
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }

    /// Selects the TLS verification mode for this host.
    #[must_use]
    pub fn verify_mode(&self) -> VerifyMode {
        VerifyMode::for_host(&self.host)
    }
}

/// Proxy settings for one session: `[user:pass@]host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Proxy host.
    pub host: String,
    /// Proxy port.
    pub port: u16,
    /// Optional basic-auth username.
    pub username: Option<String>,
    /// Optional basic-auth password.
    pub password: Option<String>,
}

impl ProxyConfig {
    /// Parses a `[user:pass@]host:port` proxy string.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Network`] if the host or port is missing or
    /// malformed.
    pub fn parse(spec: &str) -> Result<Self, WorkerError> {
        let (credentials, address) = match spec.rsplit_once('@') {
            Some((creds, addr)) => (Some(creds), addr),
            None => (None, spec),
        };
        let (host, port) = address
            .split_once(':')
            .ok_or_else(|| WorkerError::Network(format!("proxy '{spec}' is missing a port")))?;
        if host.is_empty() {
            return Err(WorkerError::Network(format!("proxy '{spec}' has an empty host")));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| WorkerError::Network(format!("bad proxy port in '{spec}': {e}")))?;
        let (username, password) = match credentials {
            Some(creds) => {
                let (user, pass) = creds.split_once(':').ok_or_else(|| {
                    WorkerError::Network(format!("proxy credentials in '{spec}' must be user:pass"))
                })?;
                (Some(user.to_string()), Some(pass.to_string()))
            },
            None => (None, None),
        };
        Ok(Self {
            host: host.to_string(),
            port,
            username,
            password,
        })
    }

    fn to_reqwest(&self) -> Result<reqwest::Proxy, WorkerError> {
        let mut proxy = reqwest::Proxy::all(format!("http://{}:{}", self.host, self.port))?;
        if let (Some(user), Some(pass)) = (&self.username, &self.password) {
            proxy = proxy.basic_auth(user, pass);
        }
        Ok(proxy)
    }
}

/// A received response: status plus verified body bytes.
#[derive(Debug)]
pub struct Reply {
    /// HTTP status code.
    pub status: u16,
    /// Response body, already checked against its `Content-MD5` if the
    /// server sent one.
    pub body: Vec<u8>,
}

impl Reply {
    /// Returns the body as lossy UTF-8, for error reporting.
    #[must_use]
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// One blocking session bound to one server.
pub struct Transport {
    client: reqwest::blocking::Client,
    base_url: String,
    auth_token: String,
}

impl Transport {
    /// Opens a session against `addr`, authenticating every request with
    /// `auth_token`.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Network`] if the client cannot be built.
    pub fn connect(
        addr: &ServerAddr,
        trust: &TrustStore,
        proxy: Option<&ProxyConfig>,
        auth_token: impl Into<String>,
    ) -> Result<Self, WorkerError> {
        let mut builder = trust
            .client_builder(addr.verify_mode())
            .map_err(|e| WorkerError::Network(format!("tls setup: {e}")))?;
        match proxy {
            Some(proxy) => builder = builder.proxy(proxy.to_reqwest()?),
            None => builder = builder.no_proxy(),
        }
        let client = builder.build()?;
        Ok(Self {
            client,
            base_url: addr.base_url(),
            auth_token: auth_token.into(),
        })
    }

    /// Issues a GET request.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Network`] on transport failure or
    /// [`WorkerError::Integrity`] if the response digest does not match.
    pub fn get(&self, path: &str) -> Result<Reply, WorkerError> {
        self.send(Method::GET, path, None)
    }

    /// Issues a POST with a JSON body and a `Content-MD5` header.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Transport::get`].
    pub fn post(&self, path: &str, body: Vec<u8>) -> Result<Reply, WorkerError> {
        self.send(Method::POST, path, Some(body))
    }

    /// Issues a PUT with a JSON body and a `Content-MD5` header.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Transport::get`].
    pub fn put(&self, path: &str, body: Vec<u8>) -> Result<Reply, WorkerError> {
        self.send(Method::PUT, path, Some(body))
    }

    fn send(&self, method: Method, path: &str, body: Option<Vec<u8>>) -> Result<Reply, WorkerError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .client
            .request(method, url)
            .header("Authorization", &self.auth_token);
        if let Some(body) = body {
            request = request
                .header("Content-MD5", md5_hex(&body))
                .header("Content-Type", "application/json")
                .body(body);
        }
        let response = request.send()?;
        let status = response.status().as_u16();
        let declared_md5 = response
            .headers()
            .get("content-md5")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let body = response.bytes()?.to_vec();
        if let Some(declared) = declared_md5 {
            let actual = md5_hex(&body);
            if !declared.eq_ignore_ascii_case(&actual) {
                return Err(WorkerError::Integrity(format!(
                    "response digest {declared} does not match body digest {actual}"
                )));
            }
        }
        Ok(Reply { status, body })
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_addr_defaults_to_https_443() {
        let addr = ServerAddr::parse("cc.example.org").unwrap();
        assert_eq!(addr.scheme, "https");
        assert_eq!(addr.host, "cc.example.org");
        assert_eq!(addr.port, 443);
        assert_eq!(addr.base_url(), "https://cc.example.org:443");
    }

    #[test]
    fn test_server_addr_with_port() {
        let addr = ServerAddr::parse("127.0.0.1:8980").unwrap();
        assert_eq!(addr.host, "127.0.0.1");
        assert_eq!(addr.port, 8980);
        assert_eq!(addr.verify_mode(), VerifyMode::None);
    }

    #[test]
    fn test_server_addr_with_explicit_scheme() {
        let addr = ServerAddr::parse("http://127.0.0.1:9000/").unwrap();
        assert_eq!(addr.scheme, "http");
        assert_eq!(addr.base_url(), "http://127.0.0.1:9000");
    }

    #[test]
    fn test_server_addr_rejects_empty_host() {
        assert!(ServerAddr::parse("").is_err());
        assert!(ServerAddr::parse(":8080").is_err());
    }

    #[test]
    fn test_proxy_parse_bare() {
        let proxy = ProxyConfig::parse("localhost:8080").unwrap();
        assert_eq!(proxy.host, "localhost");
        assert_eq!(proxy.port, 8080);
        assert!(proxy.username.is_none());
        assert!(proxy.password.is_none());
    }

    #[test]
    fn test_proxy_parse_with_credentials() {
        let proxy = ProxyConfig::parse("donor:hunter2@proxy.lan:3128").unwrap();
        assert_eq!(proxy.host, "proxy.lan");
        assert_eq!(proxy.port, 3128);
        assert_eq!(proxy.username.as_deref(), Some("donor"));
        assert_eq!(proxy.password.as_deref(), Some("hunter2"));
    }

    #[test]
    fn test_proxy_parse_rejects_missing_port() {
        assert!(ProxyConfig::parse("proxy.lan").is_err());
        assert!(ProxyConfig::parse("user:pass@proxy.lan").is_err());
    }

    #[test]
    fn test_proxy_parse_rejects_bare_user() {
        assert!(ProxyConfig::parse("user@proxy.lan:3128").is_err());
    }
}
