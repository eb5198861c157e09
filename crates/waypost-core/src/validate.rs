//! Request field validation.
//!
//! Every client-supplied string passes a per-field character-set check
//! before anything else looks at it. Rules live in a typed table keyed by
//! field name. The server secret is deliberately absent from that table:
//! it is checked by `verify_server_secret`, which always goes through the
//! constant-time comparison.
//!
//! Historical wire formats handled here:
//!   - `client_id` instead of `propagation_channel_id`
//!   - no `relay_protocol` (means `VPN`)
//!   - `vpn_client_ip_address` instead of `session_id`

use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::secret::constant_time_eq;
use crate::session::SessionId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing field `{0}`")]
    Missing(&'static str),
    #[error("invalid field `{0}`")]
    Invalid(&'static str),
    #[error("server secret mismatch")]
    SecretMismatch,
}

impl ValidationError {
    /// Name of the offending field. Secret mismatches report `server_secret`.
    pub fn field(&self) -> &'static str {
        match self {
            ValidationError::Missing(f) | ValidationError::Invalid(f) => f,
            ValidationError::SecretMismatch => SERVER_SECRET,
        }
    }
}

// ── Character sets ────────────────────────────────────────────────────────────

pub fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_hexdigit())
}

pub fn is_decimal(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Dotted-quad IPv4 only. No hostnames, no IPv6.
pub fn is_ipv4(s: &str) -> bool {
    Ipv4Addr::from_str(s).is_ok()
}

pub fn is_relay_protocol(s: &str) -> bool {
    RelayProtocol::from_str(s).is_ok()
}

pub fn is_flag(s: &str) -> bool {
    s == "0" || s == "1"
}

// ── Validator table ───────────────────────────────────────────────────────────

pub const SERVER_SECRET: &str = "server_secret";
pub const PROPAGATION_CHANNEL_ID: &str = "propagation_channel_id";
pub const LEGACY_CLIENT_ID: &str = "client_id";
pub const SPONSOR_ID: &str = "sponsor_id";
pub const CLIENT_VERSION: &str = "client_version";
pub const RELAY_PROTOCOL: &str = "relay_protocol";
pub const SESSION_ID: &str = "session_id";
pub const VPN_CLIENT_IP_ADDRESS: &str = "vpn_client_ip_address";
pub const ERROR_CODE: &str = "error_code";
pub const CONNECTED: &str = "connected";
pub const KNOWN_SERVER: &str = "known_server";
pub const SEQ: &str = "seq";

/// A named field and the predicate its value must satisfy.
#[derive(Debug, Clone, Copy)]
pub struct FieldRule {
    pub name: &'static str,
    pub check: fn(&str) -> bool,
}

pub const FIELD_VALIDATORS: &[FieldRule] = &[
    FieldRule { name: PROPAGATION_CHANNEL_ID, check: is_hex },
    FieldRule { name: LEGACY_CLIENT_ID, check: is_hex },
    FieldRule { name: SPONSOR_ID, check: is_hex },
    FieldRule { name: CLIENT_VERSION, check: is_decimal },
    FieldRule { name: RELAY_PROTOCOL, check: is_relay_protocol },
    FieldRule { name: SESSION_ID, check: is_hex },
    FieldRule { name: VPN_CLIENT_IP_ADDRESS, check: is_ipv4 },
    FieldRule { name: ERROR_CODE, check: is_decimal },
    FieldRule { name: CONNECTED, check: is_flag },
    FieldRule { name: KNOWN_SERVER, check: is_ipv4 },
    FieldRule { name: SEQ, check: is_decimal },
];

fn rule_for(name: &'static str) -> Result<&'static FieldRule, ValidationError> {
    FIELD_VALIDATORS
        .iter()
        .find(|r| r.name == name)
        .ok_or(ValidationError::Invalid(name))
}

// ── Request parameters ────────────────────────────────────────────────────────

/// Decoded query parameters, in arrival order. Keys may repeat.
#[derive(Debug, Clone, Default)]
pub struct RequestParams {
    pairs: Vec<(String, String)>,
}

impl RequestParams {
    pub fn new(pairs: Vec<(String, String)>) -> Self {
        Self { pairs }
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Every value for `name`, in order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.pairs
            .iter()
            .filter(move |(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Required field, checked against its rule.
    pub fn require(&self, name: &'static str) -> Result<&str, ValidationError> {
        let rule = rule_for(name)?;
        let value = self.get(name).ok_or(ValidationError::Missing(name))?;
        if !(rule.check)(value) {
            return Err(ValidationError::Invalid(name));
        }
        Ok(value)
    }

    /// Optional field; present values must still pass the rule.
    pub fn optional(&self, name: &'static str) -> Result<Option<&str>, ValidationError> {
        let rule = rule_for(name)?;
        match self.get(name) {
            None => Ok(None),
            Some(v) if (rule.check)(v) => Ok(Some(v)),
            Some(_) => Err(ValidationError::Invalid(name)),
        }
    }

    /// All occurrences of a repeated field; one bad value fails the lot.
    pub fn all(&self, name: &'static str) -> Result<Vec<&str>, ValidationError> {
        let rule = rule_for(name)?;
        let values: Vec<&str> = self.get_all(name).collect();
        if values.iter().any(|v| !(rule.check)(v)) {
            return Err(ValidationError::Invalid(name));
        }
        Ok(values)
    }
}

// ── Typed fields ──────────────────────────────────────────────────────────────

/// Tunnel protocol the client used or is reporting on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelayProtocol {
    /// Legacy clients never send the field; they only spoke VPN.
    #[default]
    #[serde(rename = "VPN")]
    Vpn,
    #[serde(rename = "SSH")]
    Ssh,
    #[serde(rename = "OSSH")]
    Ossh,
}

impl RelayProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayProtocol::Vpn => "VPN",
            RelayProtocol::Ssh => "SSH",
            RelayProtocol::Ossh => "OSSH",
        }
    }
}

impl FromStr for RelayProtocol {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "VPN" => Ok(RelayProtocol::Vpn),
            "SSH" => Ok(RelayProtocol::Ssh),
            "OSSH" => Ok(RelayProtocol::Ossh),
            _ => Err(ValidationError::Invalid(RELAY_PROTOCOL)),
        }
    }
}

impl std::fmt::Display for RelayProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifiers every client request carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientIdentity {
    pub propagation_channel_id: String,
    pub sponsor_id: String,
    pub client_version: u32,
}

/// How a lifecycle request names its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionRef {
    Id(SessionId),
    /// Pre-session-id clients report their tunnel address instead.
    LegacyAddress(Ipv4Addr),
}

impl RequestParams {
    pub fn client_identity(&self) -> Result<ClientIdentity, ValidationError> {
        let propagation_channel_id = match self.optional(PROPAGATION_CHANNEL_ID)? {
            Some(v) => v,
            None => self
                .require(LEGACY_CLIENT_ID)
                .map_err(|_| ValidationError::Missing(PROPAGATION_CHANNEL_ID))?,
        };
        let sponsor_id = self.require(SPONSOR_ID)?;
        let client_version = self
            .require(CLIENT_VERSION)?
            .parse()
            .map_err(|_| ValidationError::Invalid(CLIENT_VERSION))?;
        Ok(ClientIdentity {
            propagation_channel_id: propagation_channel_id.to_string(),
            sponsor_id: sponsor_id.to_string(),
            client_version,
        })
    }

    pub fn relay_protocol(&self) -> Result<RelayProtocol, ValidationError> {
        match self.optional(RELAY_PROTOCOL)? {
            Some(v) => v.parse(),
            None => Ok(RelayProtocol::default()),
        }
    }

    pub fn session_ref(&self) -> Result<SessionRef, ValidationError> {
        if let Some(id) = self.optional(SESSION_ID)? {
            return Ok(SessionRef::Id(SessionId::parse(id)?));
        }
        let addr = self
            .optional(VPN_CLIENT_IP_ADDRESS)?
            .ok_or(ValidationError::Missing(SESSION_ID))?;
        addr.parse()
            .map(SessionRef::LegacyAddress)
            .map_err(|_| ValidationError::Invalid(VPN_CLIENT_IP_ADDRESS))
    }

    pub fn session_id(&self) -> Result<SessionId, ValidationError> {
        SessionId::parse(self.require(SESSION_ID)?)
    }

    pub fn known_servers(&self) -> Result<Vec<Ipv4Addr>, ValidationError> {
        self.all(KNOWN_SERVER)?
            .into_iter()
            .map(|v| v.parse().map_err(|_| ValidationError::Invalid(KNOWN_SERVER)))
            .collect()
    }

    pub fn seq(&self) -> Result<Option<u64>, ValidationError> {
        self.optional(SEQ)?
            .map(|v| v.parse().map_err(|_| ValidationError::Invalid(SEQ)))
            .transpose()
    }

    pub fn connected_flag(&self) -> Result<bool, ValidationError> {
        Ok(self.require(CONNECTED)? == "1")
    }

    pub fn error_code(&self) -> Result<u32, ValidationError> {
        self.require(ERROR_CODE)?
            .parse()
            .map_err(|_| ValidationError::Invalid(ERROR_CODE))
    }
}

/// Check the presented server secret: hex charset, then constant-time equality.
pub fn verify_server_secret(params: &RequestParams, expected: &str) -> Result<(), ValidationError> {
    let presented = params
        .get(SERVER_SECRET)
        .ok_or(ValidationError::Missing(SERVER_SECRET))?;
    if !is_hex(presented) {
        return Err(ValidationError::Invalid(SERVER_SECRET));
    }
    if !constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
        return Err(ValidationError::SecretMismatch);
    }
    Ok(())
}
