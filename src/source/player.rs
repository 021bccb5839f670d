//! Per-device player sessions for push-style platforms. Progress reports
//! accumulate listened time; crossing the scrobble threshold turns the
//! session into a discovered play. Sessions that stop reporting are swept.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::pipeline::play::Play;
use crate::shared::clock::Clock;

/// No session survives this long without an update.
pub const PLAYER_TTL: Duration = Duration::from_secs(300);

/// Shortest track considered scrobblable.
const MIN_SCROBBLE_DURATION_SECS: u64 = 30;
/// Absolute listen time that always qualifies, regardless of track length.
const MAX_SCROBBLE_THRESHOLD_SECS: u64 = 240;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlayerKey {
    pub device_id: String,
    pub user: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerStatus {
    Playing,
    Paused,
    Stopped,
}

#[derive(Debug)]
pub struct PlayerUpdate {
    pub key: PlayerKey,
    pub play: Play,
    pub status: PlayerStatus,
    /// Playback position in seconds, when the platform reports one.
    pub position: Option<u64>,
}

struct PlayerSession {
    play: Play,
    status: PlayerStatus,
    listened: u64,
    last_position: Option<u64>,
    last_seen: DateTime<Utc>,
    reported: bool,
}

impl PlayerSession {
    fn new(play: Play, status: PlayerStatus, now: DateTime<Utc>) -> Self {
        PlayerSession {
            play,
            status,
            listened: 0,
            last_position: None,
            last_seen: now,
            reported: false,
        }
    }

    fn same_track(&self, play: &Play) -> bool {
        match (&self.play.meta.track_id, &play.meta.track_id) {
            (Some(a), Some(b)) => a == b,
            _ => {
                self.play.data.track == play.data.track
                    && self.play.data.artists == play.data.artists
            }
        }
    }

    /// Credit listen time from a position report. Jumps backwards or far
    /// forwards (seeks) credit nothing.
    fn advance(&mut self, position: u64) {
        if let Some(last) = self.last_position {
            if position > last && position - last <= 2 {
                self.listened += position - last;
            }
        }
        self.last_position = Some(position);
    }

    fn crossed_threshold(&self) -> bool {
        let Some(duration) = self.play.data.duration else {
            return self.listened >= MAX_SCROBBLE_THRESHOLD_SECS;
        };
        duration >= MIN_SCROBBLE_DURATION_SECS
            && (self.listened > duration / 2 || self.listened >= MAX_SCROBBLE_THRESHOLD_SECS)
    }
}

pub struct PlayerRegistry {
    players: FxHashMap<PlayerKey, PlayerSession>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl PlayerRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        PlayerRegistry {
            players: FxHashMap::default(),
            ttl: PLAYER_TTL,
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    /// Feed a progress report. Returns a play when this update pushed the
    /// session across the scrobble threshold.
    pub fn update(&mut self, update: PlayerUpdate) -> Option<Play> {
        let now = self.clock.now();
        let session = self
            .players
            .entry(update.key.clone())
            .or_insert_with(|| PlayerSession::new(update.play.clone(), update.status, now));

        if !session.same_track(&update.play) {
            // Track changed; the old session is done for.
            *session = PlayerSession::new(update.play.clone(), update.status, now);
        }

        session.last_seen = now;
        session.status = update.status;
        if let Some(position) = update.position {
            if update.status == PlayerStatus::Playing {
                session.advance(position);
            } else {
                session.last_position = Some(position);
            }
        }

        if session.reported || !session.crossed_threshold() {
            if update.status == PlayerStatus::Stopped {
                self.players.remove(&update.key);
            }
            return None;
        }
        session.reported = true;

        let mut play = session.play.clone();
        play.data.play_date = now;
        play.data.listened_for = Some(session.listened);
        play.meta.device_id = Some(update.key.device_id.clone());
        play.meta.user = Some(update.key.user.clone());
        play.meta.new_from_source = true;

        if update.status == PlayerStatus::Stopped {
            self.players.remove(&update.key);
        }
        Some(play)
    }

    /// Evict sessions that have not reported within the TTL.
    pub fn sweep(&mut self) -> usize {
        let now = self.clock.now();
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::seconds(300));
        let before = self.players.len();
        self.players.retain(|key, session| {
            let alive = now - session.last_seen <= ttl;
            if !alive {
                debug!(
                    "evicting stale player {}/{} ({})",
                    key.device_id, key.user, session.play.data.track
                );
            }
            alive
        });
        before - self.players.len()
    }
}
