//! WebScrobbler browser-extension source. The extension POSTs a JSON event
//! per state change; only `scrobble` events become plays, since the
//! extension has already applied its own listen-threshold logic by then.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::pipeline::lifecycle::{InitError, InitHooks};
use crate::pipeline::play::Play;
use crate::shared::clock::Clock;

use super::{IngestEvent, SourceAdapter, SourceCapabilities, SourceError};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebScrobblerData {
    /// Only events from these connectors are accepted, when non-empty.
    #[serde(default)]
    pub whitelist: Vec<String>,
    /// Events from these connectors are dropped.
    #[serde(default)]
    pub blacklist: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebScrobblerEvent {
    event_name: String,
    #[serde(default)]
    data: Option<EventData>,
}

#[derive(Debug, Deserialize)]
struct EventData {
    song: Song,
}

#[derive(Debug, Deserialize)]
struct Song {
    #[serde(default)]
    processed: SongFields,
    #[serde(default)]
    parsed: SongFields,
    #[serde(default)]
    metadata: Metadata,
    #[serde(default)]
    connector: Option<Connector>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SongFields {
    #[serde(default)]
    track: Option<String>,
    #[serde(default)]
    artist: Option<String>,
    #[serde(default)]
    album: Option<String>,
    #[serde(default)]
    album_artist: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    unique_id: Option<String>,
    #[serde(default)]
    origin_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Metadata {
    #[serde(default)]
    start_timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct Connector {
    #[serde(default)]
    label: Option<String>,
}

pub struct WebScrobblerSource {
    data: WebScrobblerData,
    clock: Arc<dyn Clock>,
}

impl WebScrobblerSource {
    pub fn new(data: WebScrobblerData, clock: Arc<dyn Clock>) -> Self {
        WebScrobblerSource { data, clock }
    }

    fn connector_allowed(&self, label: Option<&str>) -> bool {
        let matches = |list: &[String], label: Option<&str>| {
            label.is_some_and(|l| list.iter().any(|entry| entry.eq_ignore_ascii_case(l)))
        };
        if matches(&self.data.blacklist, label) {
            return false;
        }
        if !self.data.whitelist.is_empty() {
            return matches(&self.data.whitelist, label);
        }
        true
    }

    fn to_play(&self, song: &Song) -> Result<Play, SourceError> {
        let pick = |f: fn(&SongFields) -> Option<&String>| {
            f(&song.processed).or_else(|| f(&song.parsed)).cloned()
        };
        let track = pick(|f| f.track.as_ref())
            .ok_or_else(|| SourceError::Malformed("event has no track".into()))?;
        let artist = pick(|f| f.artist.as_ref())
            .ok_or_else(|| SourceError::Malformed("event has no artist".into()))?;

        let play_date: DateTime<Utc> = song
            .metadata
            .start_timestamp
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
            .unwrap_or_else(|| self.clock.now());

        let mut play = Play::new(track, play_date);
        play.data.artists = vec![artist];
        play.data.album = pick(|f| f.album.as_ref());
        if let Some(album_artist) = pick(|f| f.album_artist.as_ref()) {
            play.data.album_artists = vec![album_artist];
        }
        play.data.duration = song
            .processed
            .duration
            .or(song.parsed.duration)
            .map(|d| d as u64);
        play.meta.track_id = song
            .parsed
            .unique_id
            .clone()
            .or_else(|| song.processed.unique_id.clone());
        play.meta.web_url = song.parsed.origin_url.clone();
        play.meta.new_from_source = true;
        Ok(play)
    }
}

#[async_trait]
impl InitHooks for WebScrobblerSource {
    async fn build_init_data(&mut self) -> Result<Option<String>, InitError> {
        if self
            .data
            .whitelist
            .iter()
            .any(|w| self.data.blacklist.contains(w))
        {
            return Err(InitError::Config(
                "connector appears in both whitelist and blacklist".into(),
            ));
        }
        Ok(Some("awaiting webhook events".into()))
    }
}

#[async_trait]
impl SourceAdapter for WebScrobblerSource {
    fn kind(&self) -> &'static str {
        "webscrobbler"
    }

    fn capabilities(&self) -> SourceCapabilities {
        SourceCapabilities {
            accepts_ingress: true,
            ..SourceCapabilities::default()
        }
    }

    fn lower(&mut self, payload: &Value) -> Result<IngestEvent, SourceError> {
        let event: WebScrobblerEvent = serde_json::from_value(payload.clone())
            .map_err(|e| SourceError::Malformed(format!("not a webscrobbler event: {e}")))?;

        if event.event_name != "scrobble" {
            return Ok(IngestEvent::Ignored("non-scrobble event"));
        }
        let Some(data) = event.data else {
            return Err(SourceError::Malformed("scrobble event with no song".into()));
        };
        let label = data
            .song
            .connector
            .as_ref()
            .and_then(|c| c.label.as_deref());
        if !self.connector_allowed(label) {
            return Ok(IngestEvent::Ignored("connector filtered"));
        }
        Ok(IngestEvent::Play(self.to_play(&data.song)?))
    }
}
