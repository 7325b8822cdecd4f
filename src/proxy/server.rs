//! Proxy server

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{Forwarder, InboundGateway, OutboundGateway};
use crate::authn::KeysetStore;
use crate::authz::{self, PolicyEvaluator};
use crate::config::Config;
use crate::credentials::CredentialStore;
use crate::{Error, Result};

/// Both gateways and the stores behind them.
pub struct Proxy {
    config: Config,
    keys: Arc<KeysetStore>,
    policy: Arc<dyn PolicyEvaluator>,
    credentials: Arc<CredentialStore>,
    inbound: Arc<InboundGateway>,
    outbound: Arc<OutboundGateway>,
}

impl Proxy {
    /// Load keys, policy and credentials and wire the gateways.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if any of the three initial loads fails.
    pub fn new(config: Config) -> Result<Self> {
        let keys = Arc::new(KeysetStore::new(
            config.keyset.path.clone(),
            config.keyset.refresh_interval,
        )?);
        let policy = authz::load(&config.policy)?;
        let credentials = Arc::new(CredentialStore::new(
            config.credentials.root.clone(),
            config.credentials.refresh_interval,
        )?);

        let forwarder = Forwarder::new(config.server.request_timeout)?;
        let inbound = Arc::new(InboundGateway::new(
            Arc::clone(&keys),
            Arc::clone(&policy),
            Arc::clone(&credentials),
            forwarder.clone(),
            config.upstream_url(),
            config.inbound.clone(),
        ));
        let outbound = Arc::new(OutboundGateway::new(Arc::clone(&credentials), forwarder));

        Ok(Self {
            config,
            keys,
            policy,
            credentials,
            inbound,
            outbound,
        })
    }

    /// Issuer keyset store.
    #[must_use]
    pub fn keys(&self) -> &Arc<KeysetStore> {
        &self.keys
    }

    /// Configured policy evaluator.
    #[must_use]
    pub fn policy(&self) -> &Arc<dyn PolicyEvaluator> {
        &self.policy
    }

    /// Outbound credential store.
    #[must_use]
    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    /// Router for the inbound port.
    #[must_use]
    pub fn inbound_router(&self) -> Router {
        Arc::clone(&self.inbound).router()
    }

    /// Router for the outbound port.
    #[must_use]
    pub fn outbound_router(&self) -> Router {
        Arc::clone(&self.outbound).router()
    }

    /// Start refresh tasks, bind both listeners and serve until `cancel`
    /// fires or a listener fails.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Server`] if a listener cannot be bound or fails.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let host: IpAddr = self
            .config
            .server
            .host
            .parse()
            .map_err(|e| Error::Config(format!("Invalid host: {e}")))?;
        let inbound_addr = SocketAddr::new(host, self.config.ports.inbound);
        let outbound_addr = SocketAddr::new(host, self.config.ports.outbound);

        let inbound_listener = bind(inbound_addr).await?;
        let outbound_listener = bind(outbound_addr).await?;

        self.keys.start(cancel.child_token());
        self.policy.start(cancel.child_token());
        self.credentials.start(cancel.child_token());

        info!(
            version = env!("CARGO_PKG_VERSION"),
            inbound = %inbound_addr,
            outbound = %outbound_addr,
            upstream = %self.config.upstream_url(),
            policy = %self.policy.kind(),
            issuers = ?self.keys.issuers(),
            audiences = ?self.credentials.audiences(),
            payload_policy = self.config.inbound.apply_policy_on_payload,
            reply_identity = self.config.inbound.reply_with_identity,
            "Trust sidecar listening"
        );

        let servers = async {
            tokio::try_join!(
                serve("inbound", inbound_listener, self.inbound_router(), cancel.clone()),
                serve("outbound", outbound_listener, self.outbound_router(), cancel.clone()),
            )
        };
        let shutdown_timeout = self.config.server.shutdown_timeout;
        let drain_deadline = async {
            cancel.cancelled().await;
            tokio::time::sleep(shutdown_timeout).await;
        };

        let result = tokio::select! {
            result = servers => result.map(|_| ()),
            () = drain_deadline => {
                warn!(timeout = ?shutdown_timeout, "Shutdown timeout elapsed, dropping open connections");
                Ok(())
            }
        };

        // Stops refresh tasks when a listener failed on its own.
        cancel.cancel();
        info!("Trust sidecar stopped");
        result
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("config", &self.config)
            .field("inbound", &self.inbound)
            .field("outbound", &self.outbound)
            .finish_non_exhaustive()
    }
}

async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Server(format!("Failed to bind {addr}: {e}")))
}

async fn serve(
    name: &'static str,
    listener: TcpListener,
    router: Router,
    cancel: CancellationToken,
) -> Result<()> {
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { cancel.cancelled().await })
    .await
    .map_err(|e| Error::Server(format!("{name} listener failed: {e}")))
}
