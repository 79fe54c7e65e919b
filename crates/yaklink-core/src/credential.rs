//! Engine connection credentials.

use serde::{Deserialize, Serialize};

/// Which path produced the credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineMode {
    /// Engine launched by this supervisor on the local machine.
    Local,
    /// User-supplied address of an engine running elsewhere.
    Remote,
}

impl std::fmt::Display for EngineMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineMode::Local => write!(f, "local"),
            EngineMode::Remote => write!(f, "remote"),
        }
    }
}

/// Everything needed to reach a running engine instance.
///
/// A credential is an immutable snapshot: it is built once (from a successful
/// probe or a user submission), handed to the watchdog, and replaced
/// wholesale on reconnect. Nothing mutates it in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCredential {
    pub host: String,
    pub port: u16,
    /// Local password or remote login secret. Empty when the engine does not
    /// require one.
    pub secret: String,
    pub tls: bool,
    /// CA certificate bytes (PEM) for TLS connections.
    pub ca_pem: Option<Vec<u8>>,
    pub mode: EngineMode,
}

impl EngineCredential {
    /// Credential for a locally launched engine on `127.0.0.1`.
    pub fn local(port: u16, secret: impl Into<String>) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port,
            secret: secret.into(),
            tls: false,
            ca_pem: None,
            mode: EngineMode::Local,
        }
    }

    /// Credential for a remote engine.
    ///
    /// The host string may carry its own port (`"10.0.0.5:8087"`), in which
    /// case the embedded port wins over `port`.
    pub fn remote(
        host: &str,
        port: u16,
        secret: impl Into<String>,
        tls: bool,
        ca_pem: Option<Vec<u8>>,
    ) -> Self {
        let (host, port) = split_host_port(host, port);
        Self {
            host,
            port,
            secret: secret.into(),
            tls,
            ca_pem,
            mode: EngineMode::Remote,
        }
    }

    /// `host:port` address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Split a trailing `:port` out of a host string, falling back to
/// `fallback_port` when the host carries none (or an unparseable one).
pub fn split_host_port(raw: &str, fallback_port: u16) -> (String, u16) {
    match raw.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => match port.parse::<u16>() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (raw.to_string(), fallback_port),
        },
        _ => (raw.to_string(), fallback_port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_credential_defaults() {
        let cred = EngineCredential::local(8087, "s3cret");
        assert_eq!(cred.host, "127.0.0.1");
        assert_eq!(cred.port, 8087);
        assert!(!cred.tls);
        assert_eq!(cred.mode, EngineMode::Local);
        assert_eq!(cred.addr(), "127.0.0.1:8087");
    }

    #[test]
    fn remote_host_with_embedded_port_wins() {
        let cred = EngineCredential::remote("10.0.0.5:8443", 8087, "", true, None);
        assert_eq!(cred.host, "10.0.0.5");
        assert_eq!(cred.port, 8443);
        assert_eq!(cred.mode, EngineMode::Remote);
    }

    #[test]
    fn remote_host_without_port_uses_fallback() {
        let cred = EngineCredential::remote("engine.internal", 8087, "pw", false, None);
        assert_eq!(cred.host, "engine.internal");
        assert_eq!(cred.port, 8087);
    }

    #[test]
    fn split_host_port_rejects_garbage_port() {
        let (host, port) = split_host_port("engine.internal:not-a-port", 9011);
        assert_eq!(host, "engine.internal:not-a-port");
        assert_eq!(port, 9011);
    }
}
