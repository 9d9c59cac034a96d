//! Credential configuration and per-connection authentication state

use std::sync::Arc;

/// Process-wide immutable credential shared by every handler
///
/// The secret is interpreted per protocol: raw key bytes for the
/// shadowsocks family and transparent handlers, the user-id for SOCKS4, and
/// `user:pass` for SOCKS5 subnegotiation and HTTP Basic authentication.
#[derive(Clone, Default)]
pub struct AuthConfig {
    secret: Option<Vec<u8>>,
}

impl AuthConfig {
    /// No credential required
    pub fn none() -> AuthConfig {
        AuthConfig { secret: None }
    }

    /// Require the given shared secret
    pub fn with_secret<S: Into<Vec<u8>>>(secret: S) -> AuthConfig {
        let secret = secret.into();
        AuthConfig {
            secret: if secret.is_empty() { None } else { Some(secret) },
        }
    }

    /// Whether clients must authenticate
    pub fn required(&self) -> bool {
        self.secret.is_some()
    }

    /// Raw secret bytes, if configured
    pub fn secret(&self) -> Option<&[u8]> {
        self.secret.as_deref()
    }

    /// First byte of the secret, used by single-byte header sniffing
    pub fn first_byte(&self) -> Option<u8> {
        self.secret.as_ref().and_then(|s| s.first().copied())
    }

    /// Compare a supplied credential against the configured secret
    ///
    /// Returns true when no credential is configured.
    pub fn verify(&self, supplied: &[u8]) -> bool {
        match self.secret {
            Some(ref secret) => secret.as_slice() == supplied,
            None => true,
        }
    }

    /// Secret split as `user:pass` for SOCKS5 / HTTP Basic
    pub fn user_pass(&self) -> Option<(&str, &str)> {
        let secret = self.secret.as_deref()?;
        let s = std::str::from_utf8(secret).ok()?;
        s.split_once(':')
    }

    /// Check a username/password pair against the configured `user:pass`
    pub fn check_user(&self, user: &str, pass: &str) -> bool {
        match self.user_pass() {
            Some((u, p)) => u == user && p == pass,
            // A secret without ':' still gates, nothing can match it
            None => !self.required(),
        }
    }
}

/// Per-connection authentication flag
///
/// `set_authed` is one-way: once a connection has passed any protocol's
/// credential check, later requests on the same connection skip it (the
/// SOCKS5 no-auth shortcut). A reused connection therefore inherits the
/// first successful authentication; acceptable for single-hop proxy chains,
/// not for multiplexing untrusted users over one connection.
pub struct AuthState {
    config: Arc<AuthConfig>,
    authed: bool,
}

impl AuthState {
    pub fn new(config: Arc<AuthConfig>) -> AuthState {
        AuthState { config, authed: false }
    }

    /// Shared credential configuration
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Whether this connection has already authenticated
    pub fn authed(&self) -> bool {
        self.authed
    }

    /// Mark the connection authenticated
    pub fn set_authed(&mut self) {
        self.authed = true;
    }

    /// True when a credential is configured and not yet supplied
    pub fn needs_auth(&self) -> bool {
        self.config.required() && !self.authed
    }
}
