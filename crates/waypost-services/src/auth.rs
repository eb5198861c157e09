//! Tunnel login check, run out of process by the SSH server's auth hook.
//!
//! Clients prepend their session id to the tunnel password. The id is split
//! off, the password is verified, and the client's region is recorded under
//! the id so the later `/connected` request can be attributed to it.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use thiserror::Error;
use waypost_core::config::AuthConfig;
use waypost_core::secret::constant_time_eq;
use waypost_core::session::SessionId;

use crate::geo::{RegionLookup, SessionGeo};
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("user {0} is not a tunnel account")]
    NotTunnelUser(String),
    #[error("malformed session id in authtok")]
    BadSessionId,
    #[error("credentials rejected")]
    Rejected,
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub trait CredentialVerifier: Send + Sync {
    fn verify(&self, user: &str, password: &str) -> bool;
}

/// Checks passwords against BLAKE3 digests from config.
#[derive(Debug, Clone, Default)]
pub struct DigestCredentialVerifier {
    /// user → 32-byte digest. Users whose configured digest is not valid
    /// hex are left out and can never log in.
    digests: BTreeMap<String, Vec<u8>>,
}

impl DigestCredentialVerifier {
    pub fn from_config(config: &AuthConfig) -> Self {
        let mut digests = BTreeMap::new();
        for (user, digest) in &config.users {
            match hex::decode(digest) {
                Ok(bytes) if bytes.len() == blake3::OUT_LEN => {
                    digests.insert(user.clone(), bytes);
                }
                _ => tracing::warn!(%user, "ignoring user with malformed password digest"),
            }
        }
        Self { digests }
    }

    /// Digest to put in config for `password`.
    pub fn digest(password: &str) -> String {
        blake3::hash(password.as_bytes()).to_hex().to_string()
    }
}

impl CredentialVerifier for DigestCredentialVerifier {
    fn verify(&self, user: &str, password: &str) -> bool {
        let presented = blake3::hash(password.as_bytes());
        match self.digests.get(user) {
            Some(expected) => constant_time_eq(presented.as_bytes(), expected),
            None => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Logged in with a session id; region recorded.
    Session { session_id: SessionId, region: String },
    /// Logged in with a bare password from a client that predates ids.
    Legacy,
}

pub struct SessionAuthenticator {
    verifier: Arc<dyn CredentialVerifier>,
    regions: Arc<dyn RegionLookup>,
    geo: SessionGeo,
    user_prefix: String,
    session_id_hex_len: usize,
    password_hex_len: usize,
}

impl SessionAuthenticator {
    pub fn new(
        config: &AuthConfig,
        verifier: Arc<dyn CredentialVerifier>,
        regions: Arc<dyn RegionLookup>,
        geo: SessionGeo,
    ) -> Self {
        Self {
            verifier,
            regions,
            geo,
            user_prefix: config.user_prefix.clone(),
            session_id_hex_len: config.session_id_bytes * 2,
            password_hex_len: config.password_bytes * 2,
        }
    }

    pub fn authenticate(
        &self,
        user: &str,
        authtok: &str,
        remote_ip: Option<IpAddr>,
        now: u64,
    ) -> Result<AuthOutcome, AuthError> {
        if !user.starts_with(&self.user_prefix) {
            return Err(AuthError::NotTunnelUser(user.to_string()));
        }
        // The auth hook may hand over a trailing NUL or newline.
        let authtok = authtok.trim_end_matches(['\0', '\n', '\r']);

        let (session_id, password) =
            if authtok.len() == self.session_id_hex_len + self.password_hex_len {
                let (id, password) = authtok.split_at(self.session_id_hex_len);
                let id = SessionId::parse(id).map_err(|_| AuthError::BadSessionId)?;
                (Some(id), password)
            } else {
                (None, authtok)
            };

        if !self.verifier.verify(user, password) {
            tracing::info!(%user, "tunnel login rejected");
            return Err(AuthError::Rejected);
        }

        let Some(session_id) = session_id else {
            tracing::info!(%user, "legacy tunnel login");
            return Ok(AuthOutcome::Legacy);
        };

        let region = match remote_ip {
            Some(ip) => self.regions.lookup(ip),
            None => crate::geo::UNKNOWN_REGION.to_string(),
        };
        self.geo.put(&session_id, &region, now)?;
        tracing::info!(%user, session_id = %session_id, %region, "tunnel login");
        Ok(AuthOutcome::Session { session_id, region })
    }
}
