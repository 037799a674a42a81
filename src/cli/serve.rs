//! `sandboxd serve`: wires the ledger, local backend, orchestrator, control
//! API and gateway together and runs until Ctrl-C.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::{AppState, control_routes, data_plane_routes};
use crate::backend::LocalBackend;
use crate::config::Config;
use crate::gateway::{ApiKeyStore, Gateway, generate_secret};
use crate::orchestrator::Orchestrator;
use crate::resources::ResourceLedger;
use crate::server::{HttpServer, HttpServerConfig};

const KEY_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Args, Debug, Clone, Default)]
pub struct ServeOptions {
    /// Control API listen address
    #[arg(long)]
    pub control_addr: Option<SocketAddr>,

    /// Gateway listen address
    #[arg(long)]
    pub gateway_addr: Option<SocketAddr>,
}

impl ServeOptions {
    pub fn apply(&self, config: &mut Config) {
        if let Some(addr) = self.control_addr {
            config.control_addr = addr;
        }
        if let Some(addr) = self.gateway_addr {
            config.gateway_addr = addr;
        }
    }
}

/// Everything `serve` runs, started and ready to accept traffic.
pub struct Services {
    pub orchestrator: Arc<Orchestrator>,
    pub keys: ApiKeyStore,
    control: HttpServer,
    gateway: HttpServer,
    cancel: CancellationToken,
    sweeper: JoinHandle<()>,
}

impl Services {
    /// Bind both listeners and start the key sweeper.
    pub async fn start(config: &Config) -> crate::Result<Self> {
        config.validate()?;
        let ledger = Arc::new(
            ResourceLedger::new(config.resources.total())
                .with_sandbox_limit(config.resources.max_sandboxes),
        );
        // Local sandbox endpoints are served by the control listener.
        let backend = Arc::new(LocalBackend::new(format!("http://{}", config.control_addr)));
        let orchestrator = Arc::new(
            Orchestrator::new(ledger, backend).with_retention(config.retention.policy()),
        );
        let keys = ApiKeyStore::new();
        let gateway_token = generate_secret();

        let state = AppState::new(Arc::clone(&orchestrator), keys.clone())
            .with_default_key_ttl(config.key_ttl())
            .with_gateway_token(gateway_token.clone());

        let mut control = HttpServer::new(HttpServerConfig {
            name: "control".to_string(),
            addr: config.control_addr,
        });
        control.add_routes(control_routes(state.clone()));
        control.add_routes(data_plane_routes(state));
        control.start().await?;

        let gateway = Gateway::new(Arc::clone(&orchestrator), keys.clone(), config.gateway.policy())
            .and_then(|gateway| gateway.with_upstream_token(&gateway_token));
        let mut gateway_server = HttpServer::new(HttpServerConfig {
            name: "gateway".to_string(),
            addr: config.gateway_addr,
        });
        let started = match gateway {
            Ok(gateway) => {
                gateway_server.add_routes(gateway.routes());
                gateway_server.start().await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = started {
            control.shutdown().await;
            return Err(e.into());
        }

        let cancel = CancellationToken::new();
        let sweeper = tokio::spawn(sweep_expired_keys(keys.clone(), cancel.clone()));

        Ok(Self {
            orchestrator,
            keys,
            control,
            gateway: gateway_server,
            cancel,
            sweeper,
        })
    }

    pub fn control_addr(&self) -> Option<SocketAddr> {
        self.control.local_addr()
    }

    pub fn gateway_addr(&self) -> Option<SocketAddr> {
        self.gateway.local_addr()
    }

    /// Stop accepting proxied traffic, stop every sandbox, then close the
    /// control listener.
    pub async fn shutdown(mut self) {
        self.gateway.shutdown().await;
        let failures = self.orchestrator.shutdown().await;
        for (sandbox_id, reason) in &failures {
            tracing::warn!(sandbox_id = %sandbox_id, reason = %reason, "Sandbox did not stop cleanly");
        }
        self.control.shutdown().await;

        self.cancel.cancel();
        let _ = self.sweeper.await;
    }
}

pub async fn run_serve(config: Config) -> anyhow::Result<()> {
    let services = Services::start(&config).await?;

    tracing::info!(
        control = ?services.control_addr(),
        gateway = ?services.gateway_addr(),
        cpu = config.resources.max_cpu_cores,
        max_sandboxes = config.resources.max_sandboxes,
        "sandboxd ready"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    services.shutdown().await;
    Ok(())
}

async fn sweep_expired_keys(keys: ApiKeyStore, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(KEY_SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let removed = keys.cleanup_expired().await;
                if removed > 0 {
                    tracing::debug!(removed, "Expired API keys removed");
                }
            }
        }
    }
}
