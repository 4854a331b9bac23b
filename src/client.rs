//! HTTP client for the gateway's local API (the three read endpoints the sampler needs).
//!
//! - Blocking client using `ureq` (no async).
//! - Every request carries the configured bearer token; minting that token is left to the
//!   operator.
//! - Gateways serve self-signed certificates, so certificate verification is disabled.
//! - Timeouts are reported separately from every other failure: gateways of this kind stall
//!   for a while under some network conditions and recover on their own.

use http::StatusCode;
use serde::de::DeserializeOwned;
use std::fmt::{self, Display, Formatter};
use std::io::ErrorKind;
use std::time::Duration;

use crate::models::envoy::{EnsembleGroup, InverterReading, ProductionReport};

const PRODUCTION_PATH: &str = "/production.json?details=1";
const INVERTERS_PATH: &str = "/api/v1/production/inverters";
const INVENTORY_PATH: &str = "/ivp/ensemble/inventory";

#[derive(Debug)]
pub enum DeviceError {
    Timeout(String),
    Transport(String),
    Http { status: u16, message: String },
    Json(serde_path_to_error::Error<serde_json::Error>),
}

impl DeviceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DeviceError::Timeout(_))
    }
}

impl Display for DeviceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::Timeout(s) => write!(f, "timed out: {}", s),
            DeviceError::Transport(s) => write!(f, "transport error: {}", s),
            DeviceError::Http { status, message } => write!(f, "http {}: {}", status, message),
            DeviceError::Json(e) => write!(f, "json error at {}: {}", e.path(), e.inner()),
        }
    }
}

impl std::error::Error for DeviceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DeviceError::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ureq::Error> for DeviceError {
    fn from(value: ureq::Error) -> Self {
        match value {
            e @ ureq::Error::Timeout(_) => DeviceError::Timeout(e.to_string()),
            ureq::Error::Io(io) if matches!(io.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                DeviceError::Timeout(io.to_string())
            }
            ureq::Error::StatusCode(status) => DeviceError::Http {
                status,
                message: StatusCode::from_u16(status)
                    .ok()
                    .and_then(|s| s.canonical_reason())
                    .unwrap_or("unknown status")
                    .to_string(),
            },
            other => DeviceError::Transport(other.to_string()),
        }
    }
}

/// Read access to the gateway, one call per payload.
pub trait DeviceClient {
    fn fetch_snapshot(&self) -> Result<ProductionReport, DeviceError>;

    fn fetch_inverters(&self) -> Result<Vec<InverterReading>, DeviceError>;

    fn fetch_batteries(&self) -> Result<Vec<EnsembleGroup>, DeviceError>;
}

pub struct EnvoyClient {
    agent: ureq::Agent,
    base_url: String,
    token: String,
}

impl EnvoyClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>, timeout: Duration) -> Self {
        let tls = ureq::tls::TlsConfig::builder().disable_verification(true).build();
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .tls_config(tls)
            .build()
            .into();
        EnvoyClient {
            agent,
            base_url: base_url.into(),
            token: token.into(),
        }
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, DeviceError> {
        let url = format!("{}{}", self.base_url, path);
        let mut response = self
            .agent
            .get(&url)
            .header("Accept", "application/json")
            .header("Authorization", format!("Bearer {}", self.token))
            .call()?;
        let body = response.body_mut().read_to_string()?;
        decode(&body)
    }
}

fn decode<T: DeserializeOwned>(body: &str) -> Result<T, DeviceError> {
    let de = &mut serde_json::Deserializer::from_str(body);
    serde_path_to_error::deserialize(de).map_err(DeviceError::Json)
}

impl DeviceClient for EnvoyClient {
    fn fetch_snapshot(&self) -> Result<ProductionReport, DeviceError> {
        self.get_json(PRODUCTION_PATH)
    }

    fn fetch_inverters(&self) -> Result<Vec<InverterReading>, DeviceError> {
        self.get_json(INVERTERS_PATH)
    }

    fn fetch_batteries(&self) -> Result<Vec<EnsembleGroup>, DeviceError> {
        self.get_json(INVENTORY_PATH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_reports_json_path_of_bad_field() {
        let body = r#"{"production": [{"type": "eim", "measurementType": "production", "lines": [{"wNow": "x"}]}]}"#;
        let err = decode::<ProductionReport>(body).unwrap_err();
        assert!(!err.is_transient());
        let message = err.to_string();
        assert!(message.contains("production[0].lines[0]"), "{}", message);
    }

    #[test]
    fn only_timeouts_are_transient() {
        assert!(DeviceError::Timeout("read".into()).is_transient());
        assert!(!DeviceError::Transport("refused".into()).is_transient());
        assert!(!DeviceError::Http { status: 500, message: "Internal Server Error".into() }.is_transient());
    }

    #[test]
    fn status_errors_carry_reason() {
        match DeviceError::from(ureq::Error::StatusCode(401)) {
            DeviceError::Http { status, message } => {
                assert_eq!(status, 401);
                assert_eq!(message, "Unauthorized");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn io_timeouts_are_transient() {
        let io = std::io::Error::new(ErrorKind::TimedOut, "read timed out");
        assert!(DeviceError::from(ureq::Error::Io(io)).is_transient());
    }
}
