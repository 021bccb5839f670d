//! Wires configuration into running components: builds adapters through the
//! type registry, drives initialization with retry, spawns the poll loops
//! and client workers, and owns the bus dispatch between them.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_channel::Sender;
use async_lock::Mutex;
use indexmap::IndexMap;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::client::lastfm::{LastFmClient, LastFmClientData};
use crate::client::listenbrainz::{ListenBrainzClient, ListenBrainzData};
use crate::client::worker::run_worker;
use crate::client::{ClientAdapter, ClientCore, ClientOptions, QueuedScrobble};
use crate::pipeline::bus::{Bus, ComponentKind, EventKind};
use crate::pipeline::lifecycle::InitError;
use crate::pipeline::transform::TransformSet;
use crate::shared::backoff::backoff_delay;
use crate::shared::clock::Clock;
use crate::shared::config::{AppConfig, ComponentDefinition};
use crate::shared::creds::CredentialsStore;
use crate::shared::stop::{stop_channel, StopHandle, StopToken};
use crate::source::ingress::{IngressRoute, IngressRouter};
use crate::source::jellyfin::{JellyfinData, JellyfinSource};
use crate::source::lastfm::{LastFmSource, LastFmSourceData};
use crate::source::poll::run_poll_loop;
use crate::source::webscrobbler::{WebScrobblerData, WebScrobblerSource};
use crate::source::{SourceAdapter, SourceCapabilities, SourceError, SourceHub, SourceOptions};

/// Everything adapters may need at construction time.
pub struct Deps {
    pub creds: Arc<CredentialsStore>,
    pub clock: Arc<dyn Clock>,
}

/// How long a component with a transient init failure waits between
/// attempts, before backoff.
const INIT_RETRY_BASE: Duration = Duration::from_secs(15);
/// How often interactive auth is re-checked for approval.
const AUTH_POLL_INTERVAL: Duration = Duration::from_secs(30);
/// Cadence of the push-source player sweep.
const PLAYER_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// Grace period for tasks to acknowledge a stop.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

type SourceBuilder = fn(&ComponentDefinition, &Deps) -> anyhow::Result<Box<dyn SourceAdapter>>;
type ClientBuilder = fn(&ComponentDefinition, &Deps) -> anyhow::Result<Box<dyn ClientAdapter>>;

pub struct SourceRegistration {
    pub capabilities: SourceCapabilities,
    pub build: SourceBuilder,
}

pub struct ClientRegistration {
    pub requires_auth: bool,
    pub build: ClientBuilder,
}

fn parse_data<T: for<'de> serde::Deserialize<'de>>(definition: &ComponentDefinition) -> anyhow::Result<T> {
    let data = if definition.data.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        definition.data.clone()
    };
    serde_json::from_value(data)
        .with_context(|| format!("invalid data for `{}`", definition.name()))
}

pub fn source_registry() -> IndexMap<&'static str, SourceRegistration> {
    let mut registry: IndexMap<&'static str, SourceRegistration> = IndexMap::new();
    registry.insert(
        "lastfm",
        SourceRegistration {
            capabilities: SourceCapabilities {
                requires_auth: true,
                can_poll: true,
                can_backlog: true,
                ..SourceCapabilities::default()
            },
            build: |definition, deps| {
                let data: LastFmSourceData = parse_data(definition)?;
                Ok(Box::new(LastFmSource::new(
                    definition.name(),
                    data,
                    deps.creds.clone(),
                )))
            },
        },
    );
    registry.insert(
        "webscrobbler",
        SourceRegistration {
            capabilities: SourceCapabilities {
                accepts_ingress: true,
                ..SourceCapabilities::default()
            },
            build: |definition, deps| {
                let data: WebScrobblerData = parse_data(definition)?;
                Ok(Box::new(WebScrobblerSource::new(data, deps.clock.clone())))
            },
        },
    );
    registry.insert(
        "jellyfin",
        SourceRegistration {
            capabilities: SourceCapabilities {
                accepts_ingress: true,
                ..SourceCapabilities::default()
            },
            build: |definition, _deps| {
                let data: JellyfinData = parse_data(definition)?;
                Ok(Box::new(JellyfinSource::new(data)))
            },
        },
    );
    registry
}

pub fn client_registry() -> IndexMap<&'static str, ClientRegistration> {
    let mut registry: IndexMap<&'static str, ClientRegistration> = IndexMap::new();
    registry.insert(
        "lastfm",
        ClientRegistration {
            requires_auth: true,
            build: |definition, deps| {
                let data: LastFmClientData = parse_data(definition)?;
                Ok(Box::new(LastFmClient::new(
                    definition.name(),
                    data,
                    deps.creds.clone(),
                )))
            },
        },
    );
    registry.insert(
        "listenbrainz",
        ClientRegistration {
            requires_auth: true,
            build: |definition, _deps| {
                let data: ListenBrainzData = parse_data(definition)?;
                Ok(Box::new(ListenBrainzClient::new(data)))
            },
        },
    );
    registry
}

struct ClientLane {
    name: String,
    sender: Sender<QueuedScrobble>,
}

/// The running service.
pub struct Supervisor {
    bus: Arc<Bus>,
    stop_handle: Option<StopHandle>,
    stop: StopToken,
    tasks: Vec<smol::Task<()>>,
    router: IngressRouter,
    push_hubs: IndexMap<String, Arc<Mutex<SourceHub>>>,
}

impl Supervisor {
    pub async fn start(config: AppConfig, deps: Deps) -> anyhow::Result<Supervisor> {
        let bus = Arc::new(Bus::new());
        let (stop_handle, stop) = stop_channel();
        let mut supervisor = Supervisor {
            bus: bus.clone(),
            stop_handle: Some(stop_handle),
            stop,
            tasks: Vec::new(),
            router: IngressRouter::new(),
            push_hubs: IndexMap::new(),
        };

        let lanes = supervisor.start_clients(&config, &deps).await;
        supervisor.spawn_dispatcher(lanes).await;
        supervisor.start_sources(&config, &deps).await;
        supervisor.spawn_player_sweeper();
        Ok(supervisor)
    }

    pub fn bus(&self) -> Arc<Bus> {
        self.bus.clone()
    }

    async fn start_clients(&mut self, config: &AppConfig, deps: &Deps) -> Vec<ClientLane> {
        let registry = client_registry();
        let mut lanes = Vec::new();

        for definition in config.clients.iter().filter(|c| c.enable) {
            let name = definition.name().to_string();
            let Some(registration) = registry.get(definition.kind.as_str()) else {
                error!("[{name}] unknown client type `{}`", definition.kind);
                continue;
            };
            debug!(
                "[{name}] building {} client (requires auth: {})",
                definition.kind, registration.requires_auth
            );
            let adapter = match (registration.build)(definition, deps) {
                Ok(adapter) => adapter,
                Err(err) => {
                    error!("[{name}] could not build client: {err:#}");
                    continue;
                }
            };
            let options = definition.options.merged_over(&config.client_defaults);
            let transforms = match TransformSet::compile(options.play_transform.as_ref()) {
                Ok(set) => set,
                Err(err) => {
                    error!("[{name}] invalid playTransform: {err}");
                    continue;
                }
            };

            let core = ClientCore::new(
                name.clone(),
                adapter,
                transforms,
                ClientOptions::resolve(&options),
                self.bus.clone(),
                deps.clock.clone(),
            );
            let (tx, rx) = async_channel::unbounded();
            lanes.push(ClientLane {
                name: name.clone(),
                sender: tx,
            });

            let stop = self.stop.clone();
            self.tasks.push(smol::spawn(async move {
                let mut core = core;
                if initialize_with_retry(&name, &mut core_init_client(&mut core), &stop).await {
                    run_worker(core, rx, stop).await;
                }
            }));
        }
        lanes
    }

    async fn spawn_dispatcher(&mut self, lanes: Vec<ClientLane>) {
        // Subscribe before any source task exists, so no discovery can race
        // past the dispatcher.
        let rx = self.bus.subscribe().await;
        let stop = self.stop.clone();
        self.tasks.push(smol::spawn(async move {
            loop {
                let event = smol::future::or(
                    async { rx.recv().await.ok() },
                    async {
                        stop.stopped().await;
                        None
                    },
                )
                .await;
                let Some(event) = event else { break };
                if event.kind != EventKind::NewPlay || event.from != ComponentKind::Source {
                    continue;
                }
                let Some(play) = event.play else { continue };
                for lane in &lanes {
                    let queued = QueuedScrobble::new(event.name.clone(), play.clone());
                    if lane.sender.send(queued).await.is_err() {
                        debug!("[{}] worker gone, dropping play", lane.name);
                    }
                }
            }
        }));
    }

    async fn start_sources(&mut self, config: &AppConfig, deps: &Deps) {
        let registry = source_registry();

        for definition in config.sources.iter().filter(|s| s.enable) {
            let name = definition.name().to_string();
            let Some(registration) = registry.get(definition.kind.as_str()) else {
                error!("[{name}] unknown source type `{}`", definition.kind);
                continue;
            };
            let adapter = match (registration.build)(definition, deps) {
                Ok(adapter) => adapter,
                Err(err) => {
                    error!("[{name}] could not build source: {err:#}");
                    continue;
                }
            };
            let options = definition.options.merged_over(&config.source_defaults);
            let transforms = match TransformSet::compile(options.play_transform.as_ref()) {
                Ok(set) => set,
                Err(err) => {
                    error!("[{name}] invalid playTransform: {err}");
                    continue;
                }
            };

            let capabilities = registration.capabilities;
            let mut hub = SourceHub::new(
                name.clone(),
                adapter,
                transforms,
                SourceOptions::resolve(&options),
                self.bus.clone(),
                deps.clock.clone(),
            );

            if capabilities.accepts_ingress {
                let route = IngressRoute::for_source_type(&definition.kind)
                    .expect("ingress source without a route");
                self.router.bind(route, definition.slug.clone(), name.clone());

                let stop = self.stop.clone();
                let shared = Arc::new(Mutex::new(hub));
                self.push_hubs.insert(name.clone(), shared.clone());
                self.tasks.push(smol::spawn(async move {
                    let mut hub = shared.lock().await;
                    initialize_with_retry(&name, &mut core_init_source(&mut *hub), &stop).await;
                }));
                continue;
            }

            let stop = self.stop.clone();
            self.tasks.push(smol::spawn(async move {
                if !initialize_with_retry(&name, &mut core_init_source(&mut hub), &stop).await {
                    return;
                }
                if capabilities.can_backlog {
                    if let Err(err) = hub.seed_backlog(false).await {
                        warn!("[{name}] backlog seeding failed: {err}");
                    }
                }
                if capabilities.can_poll {
                    if let Err(err) = run_poll_loop(&mut hub, &stop).await {
                        error!("[{name}] poll loop ended: {err}");
                    }
                }
            }));
        }
    }

    fn spawn_player_sweeper(&mut self) {
        if self.push_hubs.is_empty() {
            return;
        }
        let hubs: Vec<Arc<Mutex<SourceHub>>> = self.push_hubs.values().cloned().collect();
        let stop = self.stop.clone();
        self.tasks.push(smol::spawn(async move {
            while stop.sleep(PLAYER_SWEEP_INTERVAL).await {
                for hub in &hubs {
                    hub.lock().await.sweep_players();
                }
            }
        }));
    }

    /// Entry point the HTTP layer calls for webhook payloads. Returns false
    /// when no configured source matches the route and slug.
    pub async fn ingest(
        &self,
        route: IngressRoute,
        slug: Option<&str>,
        payload: &Value,
    ) -> Result<bool, SourceError> {
        let Some(source) = self.router.resolve(route, slug) else {
            debug!("no source bound for {route} slug {slug:?}");
            return Ok(false);
        };
        let Some(hub) = self.push_hubs.get(source) else {
            return Ok(false);
        };
        let mut hub = hub.lock().await;
        match hub.ingest(payload).await {
            Ok(_) => Ok(true),
            Err(err @ SourceError::Malformed(_)) => {
                // A bad payload only costs that one event.
                warn!("[{source}] dropped malformed payload: {err}");
                Ok(true)
            }
            Err(err) => Err(err),
        }
    }

    /// Signal every task and wait up to the grace period.
    pub async fn shutdown(mut self) {
        info!("shutting down");
        if let Some(handle) = self.stop_handle.take() {
            handle.stop();
        }
        let all = futures::future::join_all(self.tasks.drain(..));
        let finished = smol::future::or(
            async {
                all.await;
                true
            },
            async {
                smol::Timer::after(SHUTDOWN_GRACE).await;
                false
            },
        )
        .await;
        if finished {
            info!("all tasks stopped");
        } else {
            warn!("tasks did not stop within {SHUTDOWN_GRACE:?}, abandoning");
        }
    }
}

/// Drive a component's init until it is ready, giving up on permanent
/// config failures and retrying transient ones with backoff. Interactive
/// auth is polled until the user approves it.
async fn initialize_with_retry<'a>(
    name: &str,
    target: &mut (dyn InitTarget + Send + 'a),
    stop: &StopToken,
) -> bool {
    let mut attempt: u32 = 0;
    loop {
        if stop.is_stopped() {
            return false;
        }
        match target.initialize().await {
            Ok(true) => {
                info!("[{name}] ready");
                return true;
            }
            Ok(false) => {
                if let Some(url) = target.auth_url() {
                    info!("[{name}] waiting for authorization at {url}");
                    if !stop.sleep(AUTH_POLL_INTERVAL).await {
                        return false;
                    }
                    target.reset_for_auth_retry();
                    continue;
                }
                error!("[{name}] failed permanently, not starting");
                return false;
            }
            Err(InitError::Config(err)) => {
                error!("[{name}] invalid config: {err}");
                return false;
            }
            Err(err) => {
                attempt += 1;
                let delay = backoff_delay(INIT_RETRY_BASE, 2.0, attempt.min(6));
                warn!("[{name}] init failed, retrying in {delay:?}: {err}");
                if !stop.sleep(delay).await {
                    return false;
                }
            }
        }
    }
}

/// Unifies hubs and cores for the init driver.
trait InitTarget {
    fn initialize(&mut self) -> futures::future::BoxFuture<'_, Result<bool, InitError>>;
    fn auth_url(&self) -> Option<String>;
    fn reset_for_auth_retry(&mut self);
}

fn core_init_source<'a>(hub: &'a mut SourceHub) -> impl InitTarget + Send + 'a {
    struct T<'a>(&'a mut SourceHub);
    impl InitTarget for T<'_> {
        fn initialize(&mut self) -> futures::future::BoxFuture<'_, Result<bool, InitError>> {
            Box::pin(self.0.initialize())
        }
        fn auth_url(&self) -> Option<String> {
            self.0.auth_interaction_url()
        }
        fn reset_for_auth_retry(&mut self) {
            self.0.reset_init();
        }
    }
    T(hub)
}

fn core_init_client<'a>(core: &'a mut ClientCore) -> impl InitTarget + Send + 'a {
    struct T<'a>(&'a mut ClientCore);
    impl InitTarget for T<'_> {
        fn initialize(&mut self) -> futures::future::BoxFuture<'_, Result<bool, InitError>> {
            Box::pin(self.0.initialize())
        }
        fn auth_url(&self) -> Option<String> {
            self.0.auth_interaction_url()
        }
        fn reset_for_auth_retry(&mut self) {
            self.0.reset_init();
        }
    }
    T(core)
}
