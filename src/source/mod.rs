//! Source side of the pipeline: adapters produce plays, the hub decides
//! which of them are new discoveries and broadcasts those on the bus.

pub mod history;
pub mod ingress;
pub mod jellyfin;
pub mod lastfm;
pub mod player;
pub mod poll;
pub mod webscrobbler;

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::pipeline::bus::{Bus, BusEvent, ComponentKind, EventKind};
use crate::pipeline::compare::compare_plays;
use crate::pipeline::lifecycle::{InitError, InitHooks, Lifecycle};
use crate::pipeline::play::Play;
use crate::pipeline::transform::{TransformSet, TransformStage};
use crate::shared::clock::Clock;
use crate::shared::config::CommonOptions;

use self::history::HistoryGuard;
use self::player::{PlayerRegistry, PlayerUpdate};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("network error: {0}")]
    Network(anyhow::Error),
    #[error("malformed event: {0}")]
    Malformed(String),
    #[error("source is already polling")]
    AlreadyPolling,
    #[error("source is not initialized or not authenticated")]
    NotReady,
    #[error("operation not supported by this source")]
    Unsupported,
}

/// Capability record consulted by the registry and the supervisor.
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceCapabilities {
    pub requires_auth: bool,
    pub can_poll: bool,
    pub can_backlog: bool,
    /// The upstream history list is an unordered scrape; emission goes
    /// through the stability guard.
    pub unordered_history: bool,
    /// Receives pushed webhook payloads through the ingress router.
    pub accepts_ingress: bool,
}

/// What a pushed payload lowered into.
#[derive(Debug)]
pub enum IngestEvent {
    /// A completed listen, ready for discovery.
    Play(Play),
    /// Progress from a per-device player session.
    Player(PlayerUpdate),
    /// Recognized but deliberately not handled.
    Ignored(&'static str),
}

#[async_trait]
pub trait SourceAdapter: InitHooks + Send {
    fn kind(&self) -> &'static str;

    fn capabilities(&self) -> SourceCapabilities;

    /// Current window of the upstream history, newest first. Pollers only.
    async fn fetch_recent(&mut self) -> Result<Vec<Play>, SourceError> {
        Err(SourceError::Unsupported)
    }

    /// Historical plays used to seed the ring at startup.
    async fn fetch_backlog(&mut self) -> Result<Vec<Play>, SourceError> {
        Ok(Vec::new())
    }

    /// Lower a raw webhook payload. Push sources only.
    fn lower(&mut self, _payload: &serde_json::Value) -> Result<IngestEvent, SourceError> {
        Err(SourceError::Unsupported)
    }
}

pub const DEFAULT_RING_CAPACITY: usize = 150;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_STABLE_AFTER: u32 = 1;
pub const DEFAULT_MAX_POLL_RETRIES: u32 = 5;
pub const DEFAULT_RETRY_MULTIPLIER: f64 = 1.5;

/// Source options with every default applied.
#[derive(Debug, Clone)]
pub struct SourceOptions {
    pub interval_secs: u64,
    pub ring_capacity: usize,
    pub stable_after: u32,
    pub max_poll_retries: u32,
    pub retry_multiplier: f64,
}

impl SourceOptions {
    pub fn resolve(options: &CommonOptions) -> Self {
        SourceOptions {
            interval_secs: options.interval.unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
            ring_capacity: options.ring_capacity.unwrap_or(DEFAULT_RING_CAPACITY),
            stable_after: options.stable_after.unwrap_or(DEFAULT_STABLE_AFTER),
            max_poll_retries: options.max_poll_retries.unwrap_or(DEFAULT_MAX_POLL_RETRIES),
            retry_multiplier: options.retry_multiplier.unwrap_or(DEFAULT_RETRY_MULTIPLIER),
        }
    }
}

impl Default for SourceOptions {
    fn default() -> Self {
        SourceOptions::resolve(&CommonOptions::default())
    }
}

/// Owns one source end to end: the adapter, the discovery ring, the player
/// registry for push platforms, and the stability guard for unordered
/// histories. Nothing outside the hub touches any of it.
pub struct SourceHub {
    adapter: Box<dyn SourceAdapter>,
    lifecycle: Lifecycle,
    transforms: TransformSet,
    options: SourceOptions,
    ring: VecDeque<Play>,
    tracks_discovered: u64,
    history: HistoryGuard,
    players: PlayerRegistry,
    polling: bool,
    bus: Arc<Bus>,
}

impl SourceHub {
    pub fn new(
        name: impl Into<String>,
        adapter: Box<dyn SourceAdapter>,
        transforms: TransformSet,
        options: SourceOptions,
        bus: Arc<Bus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let name = name.into();
        SourceHub {
            lifecycle: Lifecycle::new(name, ComponentKind::Source, bus.clone()),
            history: HistoryGuard::new(options.stable_after),
            players: PlayerRegistry::new(clock),
            ring: VecDeque::with_capacity(options.ring_capacity),
            tracks_discovered: 0,
            polling: false,
            adapter,
            transforms,
            options,
            bus,
        }
    }

    pub fn name(&self) -> &str {
        self.lifecycle.name()
    }

    pub fn capabilities(&self) -> SourceCapabilities {
        self.adapter.capabilities()
    }

    pub fn options(&self) -> &SourceOptions {
        &self.options
    }

    pub fn discovered(&self) -> u64 {
        self.tracks_discovered
    }

    /// The discovery ring, oldest first.
    pub fn recent(&self) -> impl Iterator<Item = &Play> {
        self.ring.iter()
    }

    pub fn ready(&self) -> bool {
        self.lifecycle.ready(self.adapter.capabilities().requires_auth)
    }

    /// One-shot, idempotent init through the shared scaffold.
    pub async fn initialize(&mut self) -> Result<bool, InitError> {
        self.lifecycle.initialize(&mut *self.adapter).await
    }

    /// URL the user must visit when auth is pending interaction.
    pub fn auth_interaction_url(&self) -> Option<String> {
        self.lifecycle.auth_interaction_url.clone()
    }

    /// Allow re-running auth after the user approved interaction.
    pub fn reset_init(&mut self) {
        self.lifecycle.reset_for_retry();
    }

    /// Evict player sessions that stopped reporting.
    pub fn sweep_players(&mut self) -> usize {
        self.players.sweep()
    }

    /// Run a play through discovery: source `preCompare`, then the fuzzy
    /// dedup sweep of the ring. Returns the play as emitted, or `None` when
    /// it was dropped or was not new.
    pub async fn discover(&mut self, candidate: Play) -> Option<Play> {
        let mut candidate = candidate;
        candidate.meta.source = self.name().to_string();
        candidate.prune_empty();
        if candidate.data.artists.is_empty() {
            warn!(
                "[{}] dropping play with no artists: {}",
                self.name(),
                candidate.data.track
            );
            return None;
        }

        let play = match self
            .transforms
            .apply(TransformStage::PreCompare, &candidate, self.name())
        {
            Ok(play) => play,
            Err(err) => {
                warn!("[{}] transform dropped play: {err}", self.name());
                return None;
            }
        };

        if self.matches_ring(&play) {
            debug!("[{}] already discovered: {}", self.name(), play.describe());
            return None;
        }

        self.remember(play.clone());
        self.tracks_discovered += 1;
        info!("[{}] discovered: {}", self.name(), play.describe());
        self.bus
            .publish(
                BusEvent::new(EventKind::NewPlay, self.name(), ComponentKind::Source)
                    .with_play(play.clone()),
            )
            .await;
        Some(play)
    }

    /// Comparator sweep against the ring, with `compare`-stage transforms
    /// confined to this check.
    fn matches_ring(&self, play: &Play) -> bool {
        let candidate = self
            .transforms
            .apply(TransformStage::CompareCandidate, play, self.name())
            .unwrap_or_else(|_| play.clone());
        self.ring.iter().any(|entry| {
            let existing = self
                .transforms
                .apply(TransformStage::CompareExisting, entry, self.name())
                .unwrap_or_else(|_| entry.clone());
            compare_plays(&candidate, &existing).is_duplicate()
        })
    }

    fn remember(&mut self, play: Play) {
        if self.ring.len() >= self.options.ring_capacity {
            self.ring.pop_front();
        }
        self.ring.push_back(play);
    }

    /// Accept a pushed payload from the ingress router.
    pub async fn ingest(
        &mut self,
        payload: &serde_json::Value,
    ) -> Result<Option<Play>, SourceError> {
        let event = self.adapter.lower(payload)?;
        match event {
            IngestEvent::Play(play) => Ok(self.discover(play).await),
            IngestEvent::Player(update) => {
                let finished = self.players.update(update);
                self.players.sweep();
                match finished {
                    Some(play) => Ok(self.discover(play).await),
                    None => Ok(None),
                }
            }
            IngestEvent::Ignored(reason) => {
                debug!("[{}] ignoring event: {reason}", self.name());
                Ok(None)
            }
        }
    }

    /// One poll tick: fetch the window and discover what is new. Returns the
    /// number of newly discovered plays.
    pub async fn tick(&mut self) -> Result<usize, SourceError> {
        let fetched = self.adapter.fetch_recent().await?;
        let mut plays = if self.adapter.capabilities().unordered_history {
            self.history.observe(&fetched)
        } else {
            fetched
        };
        plays.sort_by_key(|p| p.data.play_date);

        let mut discovered = 0;
        for play in plays {
            if self.discover(play).await.is_some() {
                discovered += 1;
            }
        }
        Ok(discovered)
    }

    /// Seed the ring from the adapter's backlog. Emits `NewPlay` only when
    /// `emit` is set.
    pub async fn seed_backlog(&mut self, emit: bool) -> Result<usize, SourceError> {
        let mut backlog = self.adapter.fetch_backlog().await?;
        backlog.sort_by_key(|p| p.data.play_date);
        let count = backlog.len();
        for mut play in backlog {
            if emit {
                self.discover(play).await;
            } else {
                play.meta.source = self.name().to_string();
                play.meta.new_from_source = false;
                match self
                    .transforms
                    .apply(TransformStage::PreCompare, &play, self.name())
                {
                    Ok(play) => {
                        if !self.matches_ring(&play) {
                            self.remember(play);
                        }
                    }
                    Err(err) => debug!("[{}] backlog play dropped: {err}", self.name()),
                }
            }
        }
        if count > 0 {
            info!("[{}] seeded {count} backlogged plays", self.name());
        }
        Ok(count)
    }

    fn begin_polling(&mut self) -> Result<(), SourceError> {
        if self.polling {
            return Err(SourceError::AlreadyPolling);
        }
        if !self.ready() || !self.adapter.capabilities().can_poll {
            return Err(SourceError::NotReady);
        }
        self.polling = true;
        Ok(())
    }

    fn end_polling(&mut self) {
        self.polling = false;
    }
}
