//! The process-wide actor system: root actor, registries, listening
//! server, and destroy orchestration.

use crate::actor::{in_memory, ActorRef, CreateOptions};
use crate::behavior::{ActorDefinition, Handlers};
use crate::bus::{socket::spawn_socket_bus, BusConn, BusEvent, BusKind};
use crate::config::{self, ActorConfig, ResolvedOptions, DEFAULT_PORT};
use crate::error::{ActorError, Result};
use crate::inbound::{self, Routed};
use crate::marshal::{resolve_marshaller, Marshaller};
use crate::resource::{initialize_resources, ResourceSet};
use crate::server::{self, ServerHandle};
use canopy_protocol::{ActorId, CreateActorBody};
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::OnceCell;

/// Options for [`ActorSystem::new`].
pub struct SystemOptions {
    /// Behaviour of the root actor; a no-behaviour root by default.
    pub root: Option<ActorDefinition>,
    /// Explicit configuration file path (the default is `actors.json` in
    /// the working directory, if present).
    pub config_path: Option<PathBuf>,
    /// Inline configuration document, extending the file.
    pub config: Option<Map<String, Value>>,
    /// Named clusters: cluster name to `host[:port]` endpoints.
    pub clusters: HashMap<String, Vec<String>>,
    /// Registered marshaller names to instantiate.
    pub marshallers: Vec<String>,
    /// Registered resource names to initialize.
    pub resources: Vec<String>,
    /// Test mode: no process signal handlers.
    pub test: bool,
    pub log_level: Option<String>,
    /// Default heartbeat base interval for remote children.
    pub ping_timeout: Duration,
}

impl Default for SystemOptions {
    fn default() -> Self {
        Self {
            root: None,
            config_path: None,
            config: None,
            clusters: HashMap::new(),
            marshallers: Vec::new(),
            resources: Vec::new(),
            test: false,
            log_level: None,
            ping_timeout: Duration::from_secs(15),
        }
    }
}

pub(crate) struct SystemShared {
    pub config: ActorConfig,
    pub clusters: HashMap<String, Vec<String>>,
    pub marshallers: DashMap<String, Arc<dyn Marshaller>>,
    pub marshaller_names: Vec<String>,
    pub resource_names: Vec<String>,
    resources: OnceCell<ResourceSet>,
    /// Every local actor, by id. The message plane routes inbound
    /// envelopes through this table.
    pub actor_table: DashMap<ActorId, ActorRef>,
    root: OnceCell<ActorRef>,
    root_def: Mutex<Option<ActorDefinition>>,
    pub server: tokio::sync::Mutex<Option<ServerHandle>>,
    advertised: Mutex<Option<(String, u16)>>,
    /// Cached socket buses to other listening systems, for inter-host
    /// reference traffic.
    peer_conns: DashMap<String, BusConn>,
    pub test_mode: bool,
    pub default_ping_timeout: Duration,
    pub log_level: Option<String>,
    destroyed: AtomicBool,
    signals_installed: AtomicBool,
}

impl SystemShared {
    pub async fn resources(&self) -> Result<&ResourceSet> {
        self.resources
            .get_or_try_init(|| initialize_resources(&self.resource_names))
            .await
    }

    pub fn resolve_options(&self, options: &CreateOptions) -> Result<ResolvedOptions> {
        config::resolve(&self.config, &self.clusters, self.default_ping_timeout, options)
    }

    /// Host and port other systems can reach this one at, once listening.
    pub fn advertised_endpoint(&self) -> Option<(String, u16)> {
        self.advertised.lock().ok().and_then(|slot| slot.clone())
    }

    pub(crate) fn set_advertised(&self, endpoint: (String, u16)) {
        if let Ok(mut slot) = self.advertised.lock() {
            *slot = Some(endpoint);
        }
    }

    /// Open (or reuse) a socket bus to another system's listening server.
    pub async fn connect_peer(self: &Arc<Self>, host: &str, port: u16) -> Result<BusConn> {
        let key = format!("{host}:{port}");
        if let Some(conn) = self.peer_conns.get(&key) {
            return Ok(conn.value().clone());
        }

        let stream = tokio::net::TcpStream::connect((host, port))
            .await
            .map_err(|err| ActorError::Transport(format!("cannot reach {key}: {err}")))?;
        let (handle, mut events) = spawn_socket_bus(stream);
        let conn = BusConn::new(handle, BusKind::Socket);
        self.peer_conns.insert(key.clone(), conn.clone());

        let system = self.clone();
        let pump_conn = conn.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    BusEvent::Message(envelope, listener) => {
                        if let Routed::Unhandled(envelope) =
                            inbound::route(&system, &pump_conn, envelope, listener).await
                        {
                            tracing::debug!("peer connection ignoring {}", envelope.payload.kind());
                        }
                    }
                    BusEvent::Exit => {
                        pump_conn.pending.fail_all("peer system disconnected");
                        system.peer_conns.remove(&key);
                        break;
                    }
                }
            }
        });
        Ok(conn)
    }
}

/// A process hosts exactly one actor system (plus one per worker).
pub struct ActorSystem {
    shared: Arc<SystemShared>,
}

impl ActorSystem {
    pub fn new(options: SystemOptions) -> Result<Self> {
        let config = ActorConfig::load(options.config_path.as_deref(), options.config)?;

        let marshallers: DashMap<String, Arc<dyn Marshaller>> = DashMap::new();
        for name in &options.marshallers {
            let marshaller: Arc<dyn Marshaller> = Arc::from(resolve_marshaller(name)?);
            for type_name in marshaller.type_names() {
                marshallers.insert(type_name, marshaller.clone());
            }
        }

        Ok(Self {
            shared: Arc::new(SystemShared {
                config,
                clusters: options.clusters,
                marshallers,
                marshaller_names: options.marshallers,
                resource_names: options.resources,
                resources: OnceCell::new(),
                actor_table: DashMap::new(),
                root: OnceCell::new(),
                root_def: Mutex::new(options.root),
                server: tokio::sync::Mutex::new(None),
                advertised: Mutex::new(None),
                peer_conns: DashMap::new(),
                test_mode: options.test,
                default_ping_timeout: options.ping_timeout,
                log_level: options.log_level,
                destroyed: AtomicBool::new(false),
                signals_installed: AtomicBool::new(false),
            }),
        })
    }

    /// The lazily-created default system.
    pub fn default_system() -> Result<&'static ActorSystem> {
        static DEFAULT: OnceLock<ActorSystem> = OnceLock::new();
        if let Some(system) = DEFAULT.get() {
            return Ok(system);
        }
        let system = ActorSystem::new(SystemOptions::default())?;
        Ok(DEFAULT.get_or_init(|| system))
    }

    /// Build a child system inside a worker process from the bootstrap
    /// envelope.
    pub(crate) fn for_worker(body: &CreateActorBody) -> Result<Self> {
        Self::new(SystemOptions {
            root: None,
            config_path: None,
            config: Some(body.config.clone()),
            clusters: body.clusters.clone(),
            marshallers: body.marshallers.clone(),
            resources: body.resources.clone(),
            test: body.test,
            log_level: body.log_level.clone(),
            ping_timeout: Duration::from_millis(body.ping_timeout.max(1)),
        })
    }

    pub(crate) fn shared(&self) -> &Arc<SystemShared> {
        &self.shared
    }

    /// The root actor, created on first access.
    pub async fn root_actor(&self) -> Result<ActorRef> {
        let shared = self.shared.clone();
        self.shared
            .root
            .get_or_try_init(|| async move {
                if !shared.test_mode
                    && !shared.signals_installed.swap(true, Ordering::SeqCst)
                {
                    install_signal_handlers(&shared);
                }
                let definition = shared
                    .root_def
                    .lock()
                    .ok()
                    .and_then(|mut slot| slot.take())
                    .unwrap_or_else(|| ActorDefinition::from(Handlers::new()));
                in_memory::create(
                    shared.clone(),
                    ActorId::generate(),
                    None,
                    definition,
                    &ResolvedOptions::in_memory(String::new(), Map::new()),
                )
                .await
            })
            .await
            .cloned()
    }

    /// Create a child of the root actor.
    pub async fn create_actor(
        &self,
        definition: impl Into<ActorDefinition>,
        options: CreateOptions,
    ) -> Result<ActorRef> {
        self.root_actor().await?.create_child(definition, options).await
    }

    /// Start the listening server for remote creation requests and
    /// inter-host reference traffic.
    pub async fn listen(&self, port: Option<u16>, host: Option<&str>) -> Result<SocketAddr> {
        let port = port.unwrap_or(DEFAULT_PORT);
        let host = host.unwrap_or("0.0.0.0");
        let addr: SocketAddr = tokio::net::lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| ActorError::Config(format!("cannot resolve listen host {host}")))?;

        let (handle, bound) = server::bind(self.shared.clone(), addr).await?;
        *self.shared.server.lock().await = Some(handle);

        let advertised_host = if host == "0.0.0.0" {
            server::public_ipv4().to_string()
        } else {
            host.to_string()
        };
        self.shared.set_advertised((advertised_host, bound.port()));
        tracing::info!(addr = %bound, "actor system listening");
        Ok(bound)
    }

    /// Destroy the system: root first (which recursively destroys the
    /// tree), then the server, resources and cached connections.
    pub async fn destroy(&self) -> Result<()> {
        destroy_shared(&self.shared).await
    }
}

pub(crate) async fn destroy_shared(shared: &Arc<SystemShared>) -> Result<()> {
    if shared.destroyed.swap(true, Ordering::SeqCst) {
        return Ok(());
    }
    if let Some(root) = shared.root.get() {
        if let Err(err) = root.destroy().await {
            tracing::warn!("root destroy failed: {err}");
        }
    }
    if let Some(server) = shared.server.lock().await.take() {
        if let Err(err) = server.shutdown().await {
            tracing::warn!("server shutdown failed: {err}");
        }
    }
    if let Some(resources) = shared.resources.get() {
        resources.destroy_all().await;
    }
    shared.peer_conns.clear();
    shared.actor_table.clear();
    Ok(())
}

fn install_signal_handlers(shared: &Arc<SystemShared>) {
    let weak = Arc::downgrade(shared);
    tokio::spawn(async move {
        let interrupted = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut terminate =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(signal) => signal,
                    Err(err) => {
                        tracing::warn!("cannot install SIGTERM handler: {err}");
                        return;
                    }
                };
            tokio::select! {
                _ = interrupted => {}
                _ = terminate.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = interrupted.await;
        }

        tracing::info!("termination signal, destroying actor system");
        if let Some(shared) = weak.upgrade() {
            let _ = destroy_shared(&shared).await;
        }
        std::process::exit(0);
    });
}
