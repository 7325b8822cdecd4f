//! Command-line interface
//!
//! Every flag can also be set through the flat environment variable the
//! sidecar injector writes into the pod spec.

use std::path::PathBuf;

use clap::{Parser, Subcommand, builder::BoolishValueParser};

use crate::authz::PolicyKind;
use crate::config::Config;

/// Sidecar proxy enforcing service-to-service trust
#[derive(Parser, Debug)]
#[command(name = "trust-sidecar")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "TRUST_SIDECAR_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port callers reach the workload through
    #[arg(long, env = "PROXY_INBOUND_PORT")]
    pub inbound_port: Option<u16>,

    /// Port the workload's outbound traffic is redirected to
    #[arg(long, env = "PROXY_OUTBOUND_PORT")]
    pub outbound_port: Option<u16>,

    /// Port the workload listens on
    #[arg(long, env = "SERVICE_PORT")]
    pub service_port: Option<u16>,

    /// Namespace of the workload
    #[arg(long, env = "NAMESPACE")]
    pub namespace: Option<String>,

    /// Service account of the workload
    #[arg(long, env = "SERVICE_ACCOUNT")]
    pub service_account: Option<String>,

    /// Issuer keyset file (JSON)
    #[arg(long, env = "JWKS_FILE", global = true)]
    pub jwks_file: Option<PathBuf>,

    /// Policy file (Rego module or whitelist JSON)
    #[arg(long, env = "POLICY_FILE", global = true)]
    pub policy_file: Option<PathBuf>,

    /// Policy engine (rego, whitelist)
    #[arg(long, env = "POLICY_ENGINE", global = true)]
    pub policy_engine: Option<PolicyKind>,

    /// Directory with one credential file per audience
    #[arg(long, env = "TOKEN_ROOT", global = true)]
    pub token_root: Option<PathBuf>,

    /// Expose JSON request bodies to policy
    #[arg(long, env = "ENABLE_PAYLOAD_POLICY", value_parser = BoolishValueParser::new())]
    pub enable_payload_policy: Option<bool>,

    /// Stamp successful responses with the unscoped credential
    #[arg(long, env = "ENABLE_REPLY_IDENTITY", value_parser = BoolishValueParser::new())]
    pub enable_reply_identity: Option<bool>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "LOGGING_LEVEL", global = true)]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the proxy (default)
    Serve,

    /// Load keyset, policy and credentials as startup would, then exit
    Validate {
        /// Evaluate policy for this caller identity with an empty request
        #[arg(long)]
        identity: Option<String>,
    },
}

impl Cli {
    /// Apply flags and flat environment variables on top of `config`.
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(port) = self.inbound_port {
            config.ports.inbound = port;
        }
        if let Some(port) = self.outbound_port {
            config.ports.outbound = port;
        }
        if let Some(port) = self.service_port {
            config.ports.service = port;
        }
        if let Some(ref namespace) = self.namespace {
            config.identity.namespace.clone_from(namespace);
        }
        if let Some(ref account) = self.service_account {
            config.identity.service_account.clone_from(account);
        }
        if let Some(ref path) = self.jwks_file {
            config.keyset.path.clone_from(path);
        }
        if let Some(ref path) = self.policy_file {
            config.policy.path.clone_from(path);
        }
        if let Some(engine) = self.policy_engine {
            config.policy.engine = engine;
        }
        if let Some(ref root) = self.token_root {
            config.credentials.root.clone_from(root);
        }
        if let Some(enabled) = self.enable_payload_policy {
            config.inbound.apply_policy_on_payload = enabled;
        }
        if let Some(enabled) = self.enable_reply_identity {
            config.inbound.reply_with_identity = enabled;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config() {
        let cli = Cli::try_parse_from([
            "trust-sidecar",
            "--inbound-port",
            "9101",
            "--service-port",
            "8080",
            "--policy-engine",
            "whitelist",
            "--policy-file",
            "/tmp/whitelist.json",
            "--enable-payload-policy",
            "true",
            "--enable-reply-identity",
            "no",
        ])
        .unwrap();
        let mut config = Config::default();
        config.inbound.reply_with_identity = true;

        cli.apply_overrides(&mut config);

        assert_eq!(config.ports.inbound, 9101);
        assert_eq!(config.ports.outbound, 8102);
        assert_eq!(config.ports.service, 8080);
        assert_eq!(config.policy.engine, PolicyKind::Whitelist);
        assert_eq!(config.policy.path, PathBuf::from("/tmp/whitelist.json"));
        assert!(config.inbound.apply_policy_on_payload);
        assert!(!config.inbound.reply_with_identity);
    }

    #[test]
    fn validate_subcommand_parses_identity() {
        let cli = Cli::try_parse_from([
            "trust-sidecar",
            "validate",
            "--identity",
            "system:serviceaccount:ns1:curler",
        ])
        .unwrap();

        match cli.command {
            Some(Command::Validate { identity }) => {
                assert_eq!(identity.as_deref(), Some("system:serviceaccount:ns1:curler"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn unknown_engine_is_rejected() {
        assert!(Cli::try_parse_from(["trust-sidecar", "--policy-engine", "cedar"]).is_err());
    }
}
