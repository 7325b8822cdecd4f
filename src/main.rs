//! Trust Sidecar - service-to-service trust enforcement for one workload.

use std::process::ExitCode;

use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span};

use trust_sidecar::{
    authn::KeysetStore,
    authz::{self, RequestContext, Source},
    cli::{Cli, Command},
    config::Config,
    credentials::CredentialStore,
    proxy::Proxy,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Some(Command::Validate { identity }) => run_validate(&config, identity.as_deref()),
        Some(Command::Serve) | None => run_server(config).await,
    }
}

fn load_config(cli: &Cli) -> trust_sidecar::Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;
    cli.apply_overrides(&mut config);
    config.validate()?;
    Ok(config)
}

/// Load every trust source once and report
fn run_validate(config: &Config, identity: Option<&str>) -> ExitCode {
    let mut ok = true;

    match KeysetStore::new(config.keyset.path.clone(), config.keyset.refresh_interval) {
        Ok(keys) => {
            println!("✅ Keyset {}", config.keyset.path.display());
            for issuer in keys.issuers() {
                println!("   {issuer} ({} keys)", keys.key_count(&issuer));
            }
        }
        Err(e) => {
            eprintln!("❌ Keyset: {e}");
            ok = false;
        }
    }

    let policy = match authz::load(&config.policy) {
        Ok(policy) => {
            println!(
                "✅ Policy {} ({})",
                config.policy.path.display(),
                policy.kind()
            );
            Some(policy)
        }
        Err(e) => {
            eprintln!("❌ Policy: {e}");
            ok = false;
            None
        }
    };

    match CredentialStore::new(
        config.credentials.root.clone(),
        config.credentials.refresh_interval,
    ) {
        Ok(credentials) => {
            println!("✅ Credentials {}", config.credentials.root.display());
            for audience in credentials.audiences() {
                println!("   {audience}");
            }
        }
        Err(e) => {
            eprintln!("❌ Credentials: {e}");
            ok = false;
        }
    }

    if let (Some(policy), Some(identity)) = (policy, identity) {
        let source = Source {
            identity: identity.to_string(),
            ..Source::default()
        };
        let decision = if policy.is_allowed(&source, &RequestContext::default()) {
            "allow"
        } else {
            "deny"
        };
        println!("\nDecision for {identity:?}: {decision}");
    }

    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Run the proxy
async fn run_server(config: Config) -> ExitCode {
    let span = info_span!(
        "trust_sidecar",
        namespace = %config.identity.namespace,
        service_account = %config.identity.service_account
    );

    async move {
        let proxy = match Proxy::new(config) {
            Ok(proxy) => proxy,
            Err(e) => {
                error!("Failed to load trust sources: {e}");
                return ExitCode::FAILURE;
            }
        };

        let cancel = CancellationToken::new();
        tokio::spawn(shutdown_signal(cancel.clone()));

        if let Err(e) = proxy.run(cancel).await {
            error!("Proxy error: {e}");
            return ExitCode::FAILURE;
        }

        info!("Shutdown complete");
        ExitCode::SUCCESS
    }
    .instrument(span)
    .await
}

/// Shutdown signal handler
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    cancel.cancel();
}
