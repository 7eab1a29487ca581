//! Wiring for the `proxy` command.
//!
//! This is the one place where the object graph is assembled: registries,
//! pipelines, servers, and the bridge supervisor are created here from a
//! [`ProxyConfig`] and handed their collaborators explicitly.
//!
//! ```text
//! listen mode                          bridge mode
//! ───────────                          ───────────
//! device server (0.0.0.0:listen)       BridgeSupervisor ──dial──▶ host:port
//!   └─ pipeline: [persistence]           └─ pipeline: [persistence] → chat relay
//!   └─ registers devices ─┐            chat server (127.0.0.1:chat)
//! fanout server           │              └─ bytes ──▶ device slot
//! (127.0.0.1:fanout) ─────┴─ broadcast
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::application::bridge_state::BridgeState;
use crate::application::fanout::FanoutRegistry;
use crate::application::persistence::{persistence_layer, PacketStore, StoreOptions};
use crate::application::pipeline::PipelineBuilder;
use crate::domain::config::{BridgeStatus, ProxyConfig, ProxyMode};
use crate::infrastructure::bridge::{BridgeOptions, BridgeSupervisor, TcpDialer};
use crate::infrastructure::listeners::{chat_handler, device_handler, fanout_handler};
use crate::infrastructure::server::{AcceptHandler, ConnectionServer};

/// Addresses the running proxy is bound to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProxyAddrs {
    pub device: Option<SocketAddr>,
    pub fanout: Option<SocketAddr>,
    pub chat: Option<SocketAddr>,
}

/// A started proxy.  Call [`RunningProxy::shutdown`] to stop it.
pub struct RunningProxy {
    servers: Vec<ConnectionServer>,
    sessions: CancellationToken,
    bridge: Option<JoinHandle<()>>,
    bridge_status: Option<watch::Receiver<BridgeStatus>>,
    addrs: ProxyAddrs,
    config: ProxyConfig,
}

/// Builds and starts everything `config` asks for.
///
/// `store` adds the persistence layer to the device pipeline when present.
///
/// # Errors
///
/// Fails when a listener cannot be bound.  Anything started before the
/// failure is stopped again.
pub async fn start_proxy(
    config: ProxyConfig,
    store: Option<Arc<dyn PacketStore>>,
) -> anyhow::Result<RunningProxy> {
    let sessions = CancellationToken::new();
    let persistence = store.map(|store| persistence_layer(store, StoreOptions::default()));
    let mut running = RunningProxy {
        servers: Vec::new(),
        sessions: sessions.clone(),
        bridge: None,
        bridge_status: None,
        addrs: ProxyAddrs::default(),
        config: config.clone(),
    };

    match &config.mode {
        ProxyMode::Listen {
            listen_addr,
            fanout_addr,
        } => {
            let registry = Arc::new(FanoutRegistry::new());
            let pipeline = PipelineBuilder::new().layer_opt(persistence).build();
            let devices = device_handler(
                config.protocol,
                config.session,
                pipeline,
                Arc::clone(&registry),
            );
            let device = running.serve("device listener", *listen_addr, devices).await?;
            running.addrs.device = Some(device);

            if let Some(addr) = fanout_addr {
                let fanout = fanout_handler(
                    registry,
                    config.protocol,
                    config.session,
                    config.fanout_framed,
                );
                let fanout = running.serve("fanout listener", *addr, fanout).await?;
                running.addrs.fanout = Some(fanout);
            }
        }
        ProxyMode::Bridge { remote, chat_addr } => {
            let state = Arc::new(BridgeState::new());
            if let Some(addr) = chat_addr {
                let chat = chat_handler(Arc::clone(&state), config.session);
                let chat = running.serve("chat listener", *addr, chat).await?;
                running.addrs.chat = Some(chat);
            }

            let supervisor = BridgeSupervisor::new(
                Arc::new(TcpDialer::new(remote.clone())),
                state,
                PipelineBuilder::new().layer_opt(persistence),
                BridgeOptions {
                    protocol: config.protocol,
                    session: config.session,
                    retry_delay: config.retry_delay,
                },
            );
            running.bridge_status = Some(supervisor.subscribe());
            info!("bridging to device at {remote}");
            running.bridge = Some(tokio::spawn(supervisor.run(sessions.child_token())));
        }
    }

    info!("proxy running with protocol {}", config.protocol);
    Ok(running)
}

/// Runs the proxy until `shutdown` fires, then tears it down.
///
/// # Errors
///
/// See [`start_proxy`].
pub async fn run_proxy(
    config: ProxyConfig,
    store: Option<Arc<dyn PacketStore>>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let running = start_proxy(config, store).await?;
    shutdown.cancelled().await;
    info!("shutdown requested");
    running.shutdown().await;
    Ok(())
}

impl RunningProxy {
    pub fn addrs(&self) -> ProxyAddrs {
        self.addrs
    }

    /// Status of the bridge supervisor, in bridge mode.
    pub fn bridge_status(&self) -> Option<watch::Receiver<BridgeStatus>> {
        self.bridge_status.clone()
    }

    async fn serve(
        &mut self,
        name: &str,
        addr: SocketAddr,
        handler: AcceptHandler,
    ) -> anyhow::Result<SocketAddr> {
        let server = ConnectionServer::new(name, addr, handler, self.sessions.clone());
        match server.start().await {
            Ok(bound) => {
                self.servers.push(server);
                Ok(bound)
            }
            Err(e) => {
                self.stop_servers().await;
                Err(e).with_context(|| format!("failed to start {name}"))
            }
        }
    }

    async fn stop_servers(&self) {
        for server in &self.servers {
            if let Err(e) = server.stop().await {
                warn!("{}: {e}", server.name());
            }
        }
    }

    /// Stops accepting, cancels every session and the bridge, and waits at
    /// most the configured shutdown timeout for them to finish.
    pub async fn shutdown(self) {
        self.stop_servers().await;
        self.sessions.cancel();

        let servers = &self.servers;
        let bridge = self.bridge;
        let teardown = async move {
            for server in servers {
                server.wait_sessions().await;
            }
            if let Some(task) = bridge {
                let _ = task.await;
            }
        };
        match tokio::time::timeout(self.config.shutdown_timeout, teardown).await {
            Ok(()) => info!("proxy stopped"),
            Err(_) => warn!(
                "shutdown did not finish within {:?}; exiting anyway",
                self.config.shutdown_timeout
            ),
        }
    }
}

impl std::fmt::Debug for RunningProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningProxy")
            .field("addrs", &self.addrs)
            .field("servers", &self.servers)
            .finish()
    }
}
