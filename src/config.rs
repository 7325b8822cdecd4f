//! Configuration management
//!
//! Sources, lowest precedence first:
//!
//! 1. built-in defaults (the conventional injected-sidecar paths and ports);
//! 2. an optional YAML file;
//! 3. `TRUST_SIDECAR_`-prefixed environment variables, nested with `__`
//!    (e.g. `TRUST_SIDECAR_KEYSET__REFRESH_INTERVAL=1h`);
//! 4. command-line flags and the flat variables the injector sets
//!    (`PROXY_INBOUND_PORT`, `JWKS_FILE`, ...), applied by [`crate::cli`].

use std::{
    net::IpAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::authz::PolicyKind;
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Workload identity, used for log context
    pub identity: IdentityConfig,
    /// Listener and workload ports
    pub ports: PortsConfig,
    /// Trusted issuer keyset
    pub keyset: KeysetConfig,
    /// Authorization policy
    pub policy: PolicyConfig,
    /// Outbound credentials
    pub credentials: CredentialsConfig,
    /// Inbound pipeline switches
    pub inbound: InboundConfig,
    /// Listener and upstream client settings
    pub server: ServerConfig,
}

/// Namespace and service account of the shielded workload
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Kubernetes namespace
    pub namespace: String,
    /// Kubernetes service account
    pub service_account: String,
}

/// Port layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortsConfig {
    /// Port callers reach the workload through
    pub inbound: u16,
    /// Port the workload's outbound traffic is redirected to
    pub outbound: u16,
    /// Port the workload itself listens on (loopback)
    pub service: u16,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            inbound: 8101,
            outbound: 8102,
            service: 80,
        }
    }
}

/// Keyset file settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysetConfig {
    /// JSON map of issuer to JWK array
    pub path: PathBuf,
    /// Re-read interval
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,
}

impl Default for KeysetConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/run/knative/authn/jwks.json"),
            refresh_interval: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Policy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Evaluation strategy
    pub engine: PolicyKind,
    /// Rego module or whitelist JSON
    pub path: PathBuf,
    /// Re-read interval; defaults per engine (rego 30s, whitelist 15s)
    #[serde(with = "humantime_serde::option", skip_serializing_if = "Option::is_none")]
    pub refresh_interval: Option<Duration>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            engine: PolicyKind::Rego,
            path: PathBuf::from("/var/run/knative/authz/policy.rego"),
            refresh_interval: None,
        }
    }
}

/// Outbound credential settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    /// Directory holding one credential file per audience
    pub root: PathBuf,
    /// Re-read interval for each credential file
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/run/knative/tokens"),
            refresh_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Inbound pipeline switches
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InboundConfig {
    /// Buffer request bodies and expose JSON bodies to policy
    pub apply_policy_on_payload: bool,
    /// Stamp successful responses with the unscoped credential
    pub reply_with_identity: bool,
    /// Largest body buffered for payload-aware policy (bytes)
    pub max_body_size: usize,
}

impl Default for InboundConfig {
    fn default() -> Self {
        Self {
            apply_policy_on_payload: false,
            reply_with_identity: false,
            max_body_size: 10 * 1024 * 1024, // 10MB
        }
    }
}

/// Listener and upstream client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address both listeners bind to
    pub host: String,
    /// Upstream request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            request_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("TRUST_SIDECAR_").split("__"));

        figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))
    }

    /// Check values that would otherwise fail at bind or refresh time.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        self.server
            .host
            .parse::<IpAddr>()
            .map_err(|e| Error::Config(format!("Invalid host {:?}: {e}", self.server.host)))?;

        let ports = &self.ports;
        if ports.inbound == 0 || ports.outbound == 0 || ports.service == 0 {
            return Err(Error::Config("Ports must be non-zero".to_string()));
        }
        if ports.inbound == ports.outbound {
            return Err(Error::Config(format!(
                "Inbound and outbound ports must differ (both {})",
                ports.inbound
            )));
        }

        let intervals = [
            ("keyset.refresh_interval", Some(self.keyset.refresh_interval)),
            ("policy.refresh_interval", self.policy.refresh_interval),
            ("credentials.refresh_interval", Some(self.credentials.refresh_interval)),
        ];
        for (name, interval) in intervals {
            if interval.is_some_and(|d| d.is_zero()) {
                return Err(Error::Config(format!("{name} must be greater than zero")));
            }
        }

        if self.inbound.max_body_size == 0 {
            return Err(Error::Config(
                "inbound.max_body_size must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Base URL of the workload the inbound gateway forwards to.
    #[must_use]
    pub fn upstream_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.ports.service)
    }
}

/// Human-readable duration serialization (`"30s"`, `"5m"`, `"100ms"`, `"24h"`)
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Parse `"<n>ms"`, `"<n>s"`, `"<n>m"`, `"<n>h"` or bare seconds.
    ///
    /// # Errors
    ///
    /// Returns the parse error message for malformed input.
    pub fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let parse_u64 = |n: &str| n.trim().parse::<u64>().map_err(|e| format!("{s:?}: {e}"));
        let scaled = |n: &str, factor: u64| {
            parse_u64(n)?
                .checked_mul(factor)
                .map(Duration::from_secs)
                .ok_or_else(|| format!("{s:?}: duration overflows"))
        };

        // "ms" must be checked before "s" and "m".
        if let Some(ms) = s.strip_suffix("ms") {
            parse_u64(ms).map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            parse_u64(secs).map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            scaled(mins, 60)
        } else if let Some(hours) = s.strip_suffix('h') {
            scaled(hours, 60 * 60)
        } else {
            parse_u64(s).map(Duration::from_secs)
        }
    }

    /// `Option<Duration>` variant
    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        /// # Errors
        ///
        /// Returns a serialization error if the serializer fails.
        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => super::serialize(d, serializer),
                None => serializer.serialize_none(),
            }
        }

        /// # Errors
        ///
        /// Returns a deserialization error if the string cannot be parsed as a duration.
        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Option::<String>::deserialize(deserializer)?
                .map(|s| super::parse(&s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}
