//! Client side of the pipeline: receive discovered plays, weed out anything
//! the upstream service already knows about, and scrobble the rest with
//! retry and dead-letter handling.

pub mod dead_letter;
pub mod lastfm;
pub mod listenbrainz;
pub mod worker;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::pipeline::bus::{Bus, BusEvent, ComponentKind, EventKind};
use crate::pipeline::compare::{
    closest_match, temporal_accuracy, PlayComparison, TemporalAccuracy,
};
use crate::pipeline::lifecycle::{InitError, InitHooks, Lifecycle};
use crate::pipeline::play::Play;
use crate::pipeline::transform::{TransformSet, TransformStage};
use crate::shared::clock::Clock;
use crate::shared::config::CommonOptions;
use crate::shared::stop::StopToken;

pub const DEFAULT_SCROBBLE_DELAY_MS: u64 = 1000;
pub const DEFAULT_SCROBBLE_SLEEP_MS: u64 = 10_000;
pub const DEFAULT_DEAD_LETTER_RETRIES: u32 = 3;
pub const DEFAULT_MAX_POLL_RETRIES: u32 = 5;
pub const DEFAULT_RETRY_MULTIPLIER: f64 = 1.5;
/// Bound on the ring of this client's own successful scrobbles.
pub const SCROBBLED_RING_CAPACITY: usize = 40;

#[derive(Debug, Error)]
pub enum ClientError {
    /// The upstream refused this call. A show-stopper means it will keep
    /// refusing, so the worker should stop and escalate instead of
    /// dead-lettering.
    #[error("upstream error: {message}")]
    Upstream { message: String, show_stopper: bool },
    #[error("authentication revoked: {0}")]
    AuthRevoked(String),
    #[error("network error: {0}")]
    Network(anyhow::Error),
}

impl ClientError {
    pub fn upstream(message: impl Into<String>, show_stopper: bool) -> Self {
        ClientError::Upstream {
            message: message.into(),
            show_stopper,
        }
    }

    /// Should the worker abandon the queue and let the supervisor retry?
    pub fn is_show_stopper(&self) -> bool {
        match self {
            ClientError::Upstream { show_stopper, .. } => *show_stopper,
            ClientError::Network(_) => true,
            ClientError::AuthRevoked(_) => false,
        }
    }

    pub fn is_auth_failure(&self) -> bool {
        matches!(self, ClientError::AuthRevoked(_))
    }
}

#[async_trait]
pub trait ClientAdapter: InitHooks + Send {
    fn kind(&self) -> &'static str;

    /// Report one play upstream; the response normalized back into a play.
    async fn scrobble(&mut self, play: &Play) -> Result<Play, ClientError>;

    /// Snapshot of the service's recently scrobbled plays, any order.
    async fn recent_scrobbles(&mut self) -> Result<Vec<Play>, ClientError>;
}

#[derive(Debug, Clone)]
pub struct QueuedScrobble {
    pub id: Uuid,
    pub source: String,
    pub play: Play,
}

impl QueuedScrobble {
    pub fn new(source: impl Into<String>, play: Play) -> Self {
        QueuedScrobble {
            id: Uuid::new_v4(),
            source: source.into(),
            play,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeadLetterScrobble {
    pub queued: QueuedScrobble,
    pub retries: u32,
    pub error: String,
    pub last_retry: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct ScrobbledPlay {
    pub play: Play,
    pub scrobble: Play,
}

/// Client options with every default applied.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub check_existing_scrobbles: bool,
    pub scrobble_delay: Duration,
    pub scrobble_sleep: Duration,
    pub dead_letter_retries: u32,
    pub max_poll_retries: u32,
    pub retry_multiplier: f64,
    pub exclude_sources: Vec<String>,
}

impl ClientOptions {
    pub fn resolve(options: &CommonOptions) -> Self {
        ClientOptions {
            check_existing_scrobbles: options.check_existing_scrobbles.unwrap_or(true),
            scrobble_delay: Duration::from_millis(
                options.scrobble_delay.unwrap_or(DEFAULT_SCROBBLE_DELAY_MS),
            ),
            scrobble_sleep: Duration::from_millis(
                options.scrobble_sleep.unwrap_or(DEFAULT_SCROBBLE_SLEEP_MS),
            ),
            dead_letter_retries: options
                .dead_letter_retries
                .unwrap_or(DEFAULT_DEAD_LETTER_RETRIES),
            max_poll_retries: options.max_poll_retries.unwrap_or(DEFAULT_MAX_POLL_RETRIES),
            retry_multiplier: options
                .retry_multiplier
                .unwrap_or(DEFAULT_RETRY_MULTIPLIER),
            exclude_sources: options.exclude_sources.clone().unwrap_or_default(),
        }
    }

    pub fn accepts_source(&self, source: &str) -> bool {
        !self.exclude_sources.iter().any(|s| s == source)
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions::resolve(&CommonOptions::default())
    }
}

/// Owns one client end to end. Only the worker task touches it.
pub struct ClientCore {
    adapter: Box<dyn ClientAdapter>,
    lifecycle: Lifecycle,
    transforms: TransformSet,
    options: ClientOptions,
    queue: VecDeque<QueuedScrobble>,
    /// Upstream snapshot, ascending play date.
    recent_scrobbles: Vec<Play>,
    scrobbled: VecDeque<ScrobbledPlay>,
    dead_letters: Vec<DeadLetterScrobble>,
    last_scrobble_check: Option<DateTime<Utc>>,
    last_attempt: Option<DateTime<Utc>>,
    /// Best fuzzy match seen during the last existing-scrobble check.
    closest: Option<(Play, PlayComparison)>,
    scrobbling: bool,
    bus: Arc<Bus>,
    clock: Arc<dyn Clock>,
}

impl ClientCore {
    pub fn new(
        name: impl Into<String>,
        adapter: Box<dyn ClientAdapter>,
        transforms: TransformSet,
        options: ClientOptions,
        bus: Arc<Bus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        ClientCore {
            lifecycle: Lifecycle::new(name, ComponentKind::Client, bus.clone()),
            adapter,
            transforms,
            options,
            queue: VecDeque::new(),
            recent_scrobbles: Vec::new(),
            scrobbled: VecDeque::with_capacity(SCROBBLED_RING_CAPACITY),
            dead_letters: Vec::new(),
            last_scrobble_check: None,
            last_attempt: None,
            closest: None,
            scrobbling: false,
            bus,
            clock,
        }
    }

    pub fn name(&self) -> &str {
        self.lifecycle.name()
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn scrobbling(&self) -> bool {
        self.scrobbling
    }

    pub(crate) fn set_scrobbling(&mut self, scrobbling: bool) {
        self.scrobbling = scrobbling;
    }

    pub fn queued(&self) -> impl Iterator<Item = &QueuedScrobble> {
        self.queue.iter()
    }

    pub fn scrobbled(&self) -> impl Iterator<Item = &ScrobbledPlay> {
        self.scrobbled.iter()
    }

    pub fn dead_letters(&self) -> &[DeadLetterScrobble] {
        &self.dead_letters
    }

    pub fn closest_existing_match(&self) -> Option<&(Play, PlayComparison)> {
        self.closest.as_ref()
    }

    pub fn ready(&self) -> bool {
        self.lifecycle.ready(self.adapter.requires_auth())
    }

    pub fn deauth(&mut self) {
        self.lifecycle.deauth();
    }

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

    /// Insert keeping the queue sorted by ascending play date, so scrobbles
    /// go out in listen order.
    pub async fn enqueue(&mut self, queued: QueuedScrobble) {
        let at = self
            .queue
            .partition_point(|q| q.play.data.play_date <= queued.play.data.play_date);
        self.bus
            .publish(
                BusEvent::new(EventKind::ScrobbleQueued, self.name(), ComponentKind::Client)
                    .with_play(queued.play.clone()),
            )
            .await;
        self.queue.insert(at, queued);
    }

    fn needs_refresh(&self) -> bool {
        let Some(newest_queued) = self.queue.back().map(|q| q.play.data.play_date) else {
            return false;
        };
        match self.last_scrobble_check {
            Some(checked) => checked < newest_queued,
            None => true,
        }
    }

    async fn refresh_recent_scrobbles(&mut self) -> Result<(), ClientError> {
        let mut plays = self.adapter.recent_scrobbles().await?;
        plays.sort_by_key(|p| p.data.play_date);
        debug!(
            "[{}] refreshed {} upstream scrobbles",
            self.name(),
            plays.len()
        );
        self.recent_scrobbles = plays;
        self.last_scrobble_check = Some(self.clock.now());
        Ok(())
    }

    /// Oldest upstream scrobble we know of; plays older than this are stale
    /// restarts and must not be re-sent.
    fn timeframe_valid(&self, play: &Play) -> bool {
        match self.recent_scrobbles.first() {
            Some(oldest) => play.data.play_date > oldest.data.play_date,
            None => true,
        }
    }

    /// Two sources of truth, in order: our own recent scrobbles (exact
    /// fields + close time), then the upstream snapshot (fuzzy comparator).
    fn already_scrobbled(&mut self, play: &Play) -> bool {
        if !self.options.check_existing_scrobbles {
            return false;
        }

        let exact = self.scrobbled.iter().any(|s| {
            s.play.data.track == play.data.track
                && s.play.data.artists == play.data.artists
                && s.play.data.album == play.data.album
                && matches!(
                    temporal_accuracy(&s.play, play),
                    TemporalAccuracy::Exact | TemporalAccuracy::Close
                )
        });
        if exact {
            return true;
        }

        self.closest = None;
        if self.recent_scrobbles.is_empty() {
            return false;
        }

        let candidate = self
            .transforms
            .apply(TransformStage::CompareCandidate, play, self.name())
            .unwrap_or_else(|_| play.clone());
        let existing: Vec<Play> = self
            .recent_scrobbles
            .iter()
            .map(|p| {
                self.transforms
                    .apply(TransformStage::CompareExisting, p, self.name())
                    .unwrap_or_else(|_| p.clone())
            })
            .collect();

        let best = closest_match(&candidate, existing.iter());
        if let Some((play, comparison)) = best {
            self.closest = Some((play.clone(), comparison));
            return comparison.is_duplicate();
        }
        false
    }

    /// Keep at least `scrobble_delay` between attempts.
    async fn pace(&mut self) {
        if let Some(last) = self.last_attempt {
            let elapsed = (self.clock.now() - last)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if elapsed < self.options.scrobble_delay {
                smol::Timer::after(self.options.scrobble_delay - elapsed).await;
            }
        }
        self.last_attempt = Some(self.clock.now());
    }

    /// Send one play through `postCompare` and the adapter, recording the
    /// result. Shared by the queue path and the dead-letter path.
    async fn attempt_scrobble(&mut self, play: &Play) -> Result<(), ClientError> {
        let outgoing = match self
            .transforms
            .apply(TransformStage::PostCompare, play, self.name())
        {
            Ok(play) => play,
            Err(err) => {
                // Dropping here is deliberate: a transform that strips the
                // play to nothing is a user rule doing its job.
                warn!("[{}] postCompare dropped scrobble: {err}", self.name());
                return Ok(());
            }
        };

        self.pace().await;
        let scrobble = self.adapter.scrobble(&outgoing).await?;

        if self.scrobbled.len() >= SCROBBLED_RING_CAPACITY {
            self.scrobbled.pop_front();
        }
        info!("[{}] scrobbled {}", self.name(), outgoing.describe());
        self.scrobbled.push_back(ScrobbledPlay {
            play: play.clone(),
            scrobble,
        });
        self.bus
            .publish(
                BusEvent::new(EventKind::Scrobble, self.name(), ComponentKind::Client)
                    .with_play(play.clone()),
            )
            .await;
        Ok(())
    }

    /// Drain the queue. Show-stoppers requeue the play at the front and
    /// surface to the caller; lesser failures dead-letter and move on.
    pub async fn process_queue(&mut self, stop: &StopToken) -> Result<(), ClientError> {
        while !stop.is_stopped() {
            if self.needs_refresh() {
                self.refresh_recent_scrobbles().await?;
            }
            let Some(queued) = self.queue.pop_front() else {
                break;
            };
            self.bus
                .publish(
                    BusEvent::new(
                        EventKind::ScrobbleDequeued,
                        self.name(),
                        ComponentKind::Client,
                    )
                    .with_play(queued.play.clone()),
                )
                .await;

            if !self.timeframe_valid(&queued.play) {
                info!(
                    "[{}] dropping play older than the upstream window: {}",
                    self.name(),
                    queued.play.describe()
                );
                continue;
            }
            if self.already_scrobbled(&queued.play) {
                debug!(
                    "[{}] already scrobbled: {}",
                    self.name(),
                    queued.play.describe()
                );
                continue;
            }

            match self.attempt_scrobble(&queued.play).await {
                Ok(()) => {}
                Err(err) if err.is_auth_failure() => {
                    self.queue.push_front(queued);
                    self.deauth();
                    return Err(err);
                }
                Err(err) if err.is_show_stopper() => {
                    self.queue.push_front(queued);
                    return Err(err);
                }
                Err(err) => {
                    self.add_dead_letter(queued, &err).await;
                }
            }
        }
        Ok(())
    }

    async fn add_dead_letter(&mut self, queued: QueuedScrobble, err: &ClientError) {
        warn!(
            "[{}] dead-lettering {}: {err}",
            self.name(),
            queued.play.describe()
        );
        self.bus
            .publish(
                BusEvent::new(EventKind::DeadLetter, self.name(), ComponentKind::Client)
                    .with_play(queued.play.clone())
                    .with_detail(err.to_string()),
            )
            .await;
        self.dead_letters.push(DeadLetterScrobble {
            queued,
            retries: 0,
            error: err.to_string(),
            last_retry: None,
        });
    }

    pub fn remove_dead_letter(&mut self, id: Uuid) -> bool {
        let before = self.dead_letters.len();
        self.dead_letters.retain(|d| d.queued.id != id);
        before != self.dead_letters.len()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    /// Scripted client adapter; scrobble results are popped oldest first.
    pub struct FakeClient {
        pub scrobbles: VecDeque<Result<(), ClientError>>,
        pub recent: Vec<Play>,
        pub scrobble_calls: Vec<Play>,
        pub recent_calls: usize,
    }

    impl FakeClient {
        pub fn new() -> Self {
            FakeClient {
                scrobbles: VecDeque::new(),
                recent: Vec::new(),
                scrobble_calls: Vec::new(),
                recent_calls: 0,
            }
        }
    }

    #[async_trait]
    impl InitHooks for FakeClient {}

    #[async_trait]
    impl ClientAdapter for FakeClient {
        fn kind(&self) -> &'static str {
            "fake"
        }

        async fn scrobble(&mut self, play: &Play) -> Result<Play, ClientError> {
            self.scrobble_calls.push(play.clone());
            match self.scrobbles.pop_front() {
                Some(Ok(())) | None => Ok(play.clone()),
                Some(Err(err)) => Err(err),
            }
        }

        async fn recent_scrobbles(&mut self) -> Result<Vec<Play>, ClientError> {
            self.recent_calls += 1;
            Ok(self.recent.clone())
        }
    }

    pub fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    pub fn play_at(track: &str, artists: &[&str], at: DateTime<Utc>) -> Play {
        let mut p = Play::new(track, at);
        p.data.artists = artists.iter().map(|s| s.to_string()).collect();
        p
    }

    pub fn core_with(adapter: FakeClient, options: ClientOptions, bus: Arc<Bus>) -> ClientCore {
        ClientCore::new(
            "test-client",
            Box::new(adapter),
            TransformSet::default(),
            ClientOptions {
                scrobble_delay: Duration::ZERO,
                ..options
            },
            bus,
            Arc::new(crate::shared::clock::SystemClock),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{base, core_with, play_at, FakeClient};
    use super::*;
    use crate::shared::stop::stop_channel;
    use chrono::Duration as ChronoDuration;

    fn core(adapter: FakeClient) -> ClientCore {
        core_with(adapter, ClientOptions::default(), Arc::new(Bus::new()))
    }

    #[test]
    fn queue_stays_sorted_by_play_date() {
        smol::block_on(async {
            let mut core = core(FakeClient::new());
            for offset in [30i64, 10, 20] {
                core.enqueue(QueuedScrobble::new(
                    "src",
                    play_at("T", &["A"], base() + ChronoDuration::minutes(offset)),
                ))
                .await;
            }
            let dates: Vec<_> = core.queued().map(|q| q.play.data.play_date).collect();
            let mut sorted = dates.clone();
            sorted.sort();
            assert_eq!(dates, sorted);
        });
    }

    #[test]
    fn successful_queue_drain_scrobbles_everything() {
        smol::block_on(async {
            let (_h, stop) = stop_channel();
            let mut core = core(FakeClient::new());
            core.initialize().await.unwrap();
            for i in 0..3 {
                core.enqueue(QueuedScrobble::new(
                    "src",
                    play_at(
                        &format!("Track {i}"),
                        &["Band"],
                        base() + ChronoDuration::hours(i),
                    ),
                ))
                .await;
            }
            core.process_queue(&stop).await.unwrap();
            assert_eq!(core.queued().count(), 0);
            assert_eq!(core.scrobbled().count(), 3);
        });
    }

    #[test]
    fn fuzzy_existing_scrobble_is_skipped() {
        smol::block_on(async {
            let (_h, stop) = stop_channel();
            let mut adapter = FakeClient::new();
            // Upstream already has the play, reported with both artists.
            adapter.recent = vec![
                play_at("Earlier Listen", &["Someone"], base() - ChronoDuration::hours(1)),
                play_at(
                    "Sonora",
                    &["Nidia Gongora", "The Bongo Hop"],
                    base() + ChronoDuration::minutes(5),
                ),
            ];
            let mut core = core(adapter);
            core.initialize().await.unwrap();
            core.enqueue(QueuedScrobble::new(
                "src",
                play_at("Sonora", &["The Bongo Hop"], base()),
            ))
            .await;
            core.process_queue(&stop).await.unwrap();
            assert_eq!(core.scrobbled().count(), 0);
            let (_, comparison) = core.closest_existing_match().unwrap();
            assert!(comparison.is_duplicate());
        });
    }

    #[test]
    fn check_existing_scrobbles_can_be_disabled() {
        smol::block_on(async {
            let (_h, stop) = stop_channel();
            let mut adapter = FakeClient::new();
            adapter.recent = vec![play_at("Sonora", &["The Bongo Hop"], base())];
            let mut core = core_with(
                adapter,
                ClientOptions {
                    check_existing_scrobbles: false,
                    ..ClientOptions::default()
                },
                Arc::new(Bus::new()),
            );
            core.initialize().await.unwrap();
            core.enqueue(QueuedScrobble::new(
                "src",
                play_at("Sonora", &["The Bongo Hop"], base() + ChronoDuration::minutes(1)),
            ))
            .await;
            core.process_queue(&stop).await.unwrap();
            assert_eq!(core.scrobbled().count(), 1);
        });
    }

    #[test]
    fn own_ring_blocks_a_second_attempt() {
        smol::block_on(async {
            let (_h, stop) = stop_channel();
            let mut core = core(FakeClient::new());
            core.initialize().await.unwrap();
            let play = play_at("Sonora", &["The Bongo Hop"], base());
            core.enqueue(QueuedScrobble::new("src", play.clone())).await;
            core.process_queue(&stop).await.unwrap();

            // The same play arrives again (say, from a second source).
            core.enqueue(QueuedScrobble::new("other", play)).await;
            core.process_queue(&stop).await.unwrap();
            assert_eq!(core.scrobbled().count(), 1);
        });
    }

    #[test]
    fn play_older_than_upstream_window_is_dropped() {
        smol::block_on(async {
            let (_h, stop) = stop_channel();
            let mut adapter = FakeClient::new();
            adapter.recent = vec![play_at("Oldest Known", &["X"], base())];
            let mut core = core(adapter);
            core.initialize().await.unwrap();
            core.enqueue(QueuedScrobble::new(
                "src",
                play_at("Ancient", &["Y"], base() - ChronoDuration::days(30)),
            ))
            .await;
            core.process_queue(&stop).await.unwrap();
            assert_eq!(core.scrobbled().count(), 0);
            assert!(core.dead_letters().is_empty());
        });
    }

    #[test]
    fn non_show_stopper_goes_to_dead_letter() {
        smol::block_on(async {
            let (_h, stop) = stop_channel();
            let mut adapter = FakeClient::new();
            adapter
                .scrobbles
                .push_back(Err(ClientError::upstream("rate limited", false)));
            let mut core = core(adapter);
            core.initialize().await.unwrap();
            core.enqueue(QueuedScrobble::new(
                "src",
                play_at("Sonora", &["The Bongo Hop"], base()),
            ))
            .await;
            core.process_queue(&stop).await.unwrap();

            assert_eq!(core.dead_letters().len(), 1);
            assert_eq!(core.dead_letters()[0].retries, 0);
            assert_eq!(core.scrobbled().count(), 0);
        });
    }

    #[test]
    fn show_stopper_requeues_at_front_and_raises() {
        smol::block_on(async {
            let (_h, stop) = stop_channel();
            let mut adapter = FakeClient::new();
            adapter
                .scrobbles
                .push_back(Err(ClientError::upstream("bad shape", true)));
            let mut core = core(adapter);
            core.initialize().await.unwrap();
            core.enqueue(QueuedScrobble::new(
                "src",
                play_at("Sonora", &["The Bongo Hop"], base()),
            ))
            .await;
            let err = core.process_queue(&stop).await.unwrap_err();
            assert!(err.is_show_stopper());
            assert_eq!(core.queued().count(), 1);
            assert!(core.dead_letters().is_empty());
        });
    }

    #[test]
    fn auth_revocation_deauths_and_raises() {
        smol::block_on(async {
            let (_h, stop) = stop_channel();
            let mut adapter = FakeClient::new();
            adapter
                .scrobbles
                .push_back(Err(ClientError::AuthRevoked("session expired".into())));
            let mut core = core(adapter);
            core.initialize().await.unwrap();
            core.enqueue(QueuedScrobble::new(
                "src",
                play_at("Sonora", &["The Bongo Hop"], base()),
            ))
            .await;
            let err = core.process_queue(&stop).await.unwrap_err();
            assert!(err.is_auth_failure());
            assert_eq!(core.queued().count(), 1);
        });
    }

    #[test]
    fn refresh_is_lazy() {
        smol::block_on(async {
            let mut core = core(FakeClient::new());
            // Nothing queued, nothing to refresh.
            assert!(!core.needs_refresh());

            core.enqueue(QueuedScrobble::new(
                "src",
                play_at("Sonora", &["The Bongo Hop"], base()),
            ))
            .await;
            assert!(core.needs_refresh());

            core.refresh_recent_scrobbles().await.unwrap();
            // The check time now postdates everything queued.
            assert!(!core.needs_refresh());

            core.enqueue(QueuedScrobble::new(
                "src",
                play_at("Newer", &["Band"], Utc::now() + ChronoDuration::hours(1)),
            ))
            .await;
            assert!(core.needs_refresh());
        });
    }

    #[test]
    fn compare_stage_mutations_stay_inside_the_comparator() {
        smol::block_on(async {
            let (_h, stop) = stop_channel();
            let cfg: crate::pipeline::transform::rules::PlayTransformConfig =
                serde_json::from_str(r#"{"compare": {"candidate": {"title": [" xyzremix"]}}}"#)
                    .unwrap();
            let transforms = TransformSet::compile(Some(&cfg)).unwrap();

            let mut adapter = FakeClient::new();
            adapter.recent = vec![
                play_at("Old Entry", &["Someone"], base() - ChronoDuration::hours(1)),
                play_at("Sonora", &["The Bongo Hop"], base() + ChronoDuration::minutes(1)),
            ];
            let mut core = ClientCore::new(
                "test-client",
                Box::new(adapter),
                transforms,
                ClientOptions {
                    scrobble_delay: Duration::ZERO,
                    ..ClientOptions::default()
                },
                Arc::new(Bus::new()),
                Arc::new(crate::shared::clock::SystemClock),
            );
            core.initialize().await.unwrap();

            // The compare rule reduces this to "Sonora", which the upstream
            // already has: dropped as a duplicate.
            core.enqueue(QueuedScrobble::new(
                "src",
                play_at("Sonora xyzremix", &["The Bongo Hop"], base()),
            ))
            .await;
            // This one stays unique even after the rule runs.
            core.enqueue(QueuedScrobble::new(
                "src",
                play_at("Another Tune xyzremix", &["The Bongo Hop"], base() + ChronoDuration::minutes(2)),
            ))
            .await;
            core.process_queue(&stop).await.unwrap();

            let tracks: Vec<_> = core.scrobbled().map(|s| s.scrobble.data.track.clone()).collect();
            // The mutation never reached what was actually sent upstream.
            assert_eq!(tracks, vec!["Another Tune xyzremix".to_string()]);
        });
    }

    #[test]
    fn empty_snapshot_means_no_existing_match() {
        smol::block_on(async {
            let mut core = core(FakeClient::new());
            let play = play_at("Sonora", &["The Bongo Hop"], base());
            assert!(!core.already_scrobbled(&play));
            assert!(core.closest_existing_match().is_none());
        });
    }
}
