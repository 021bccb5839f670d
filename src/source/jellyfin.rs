//! Jellyfin webhook source. Requires the webhook plugin with "Send All
//! Properties" enabled so the flat payload carries item, user, and session
//! fields. Progress events feed per-device player sessions; the session
//! decides when a play counts.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::pipeline::lifecycle::InitHooks;
use crate::pipeline::play::Play;

use super::player::{PlayerKey, PlayerStatus, PlayerUpdate};
use super::{IngestEvent, SourceAdapter, SourceCapabilities, SourceError};

const TICKS_PER_SECOND: u64 = 10_000_000;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JellyfinData {
    /// Only these users are tracked, when non-empty.
    #[serde(default)]
    pub users: Vec<String>,
    /// Only these devices are tracked, when non-empty.
    #[serde(default)]
    pub devices: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WebhookPayload {
    notification_type: String,
    #[serde(default)]
    item_type: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    album: Option<String>,
    #[serde(default)]
    artists: Option<Vec<String>>,
    #[serde(default)]
    artist: Option<String>,
    #[serde(default)]
    album_artist: Option<String>,
    #[serde(default)]
    run_time_ticks: Option<u64>,
    #[serde(default)]
    playback_position_ticks: Option<u64>,
    #[serde(default)]
    is_paused: Option<bool>,
    #[serde(default)]
    item_id: Option<String>,
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    device_name: Option<String>,
    #[serde(default)]
    notification_username: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
}

pub struct JellyfinSource {
    data: JellyfinData,
}

impl JellyfinSource {
    pub fn new(data: JellyfinData) -> Self {
        JellyfinSource { data }
    }

    fn allowed(&self, user: &str, device: &str) -> bool {
        let permits = |list: &[String], value: &str| {
            list.is_empty() || list.iter().any(|entry| entry.eq_ignore_ascii_case(value))
        };
        permits(&self.data.users, user) && permits(&self.data.devices, device)
    }
}

fn to_play(payload: &WebhookPayload) -> Result<Play, SourceError> {
    let track = payload
        .name
        .clone()
        .ok_or_else(|| SourceError::Malformed("audio event has no Name".into()))?;
    let artists = match (&payload.artists, &payload.artist) {
        (Some(list), _) if !list.is_empty() => list.clone(),
        (_, Some(single)) => vec![single.clone()],
        _ => return Err(SourceError::Malformed("audio event has no artists".into())),
    };

    // The player session stamps the real play date when the listen
    // threshold is crossed.
    let mut play = Play::new(track, chrono::Utc::now());
    play.data.artists = artists;
    play.data.album = payload.album.clone();
    if let Some(album_artist) = &payload.album_artist {
        play.data.album_artists = vec![album_artist.clone()];
    }
    play.data.duration = payload.run_time_ticks.map(|t| t / TICKS_PER_SECOND);
    play.meta.track_id = payload.item_id.clone();
    play.meta.new_from_source = true;
    Ok(play)
}

#[async_trait]
impl InitHooks for JellyfinSource {}

#[async_trait]
impl SourceAdapter for JellyfinSource {
    fn kind(&self) -> &'static str {
        "jellyfin"
    }

    fn capabilities(&self) -> SourceCapabilities {
        SourceCapabilities {
            accepts_ingress: true,
            ..SourceCapabilities::default()
        }
    }

    fn lower(&mut self, payload: &Value) -> Result<IngestEvent, SourceError> {
        let payload: WebhookPayload = serde_json::from_value(payload.clone())
            .map_err(|e| SourceError::Malformed(format!("not a jellyfin webhook: {e}")))?;

        if payload.item_type.as_deref() != Some("Audio") {
            return Ok(IngestEvent::Ignored("not an audio item"));
        }
        let status = match payload.notification_type.as_str() {
            "PlaybackStart" | "PlaybackProgress" => {
                if payload.is_paused == Some(true) {
                    PlayerStatus::Paused
                } else {
                    PlayerStatus::Playing
                }
            }
            "PlaybackStop" => PlayerStatus::Stopped,
            _ => return Ok(IngestEvent::Ignored("not a playback event")),
        };

        let user = payload
            .notification_username
            .clone()
            .or_else(|| payload.user_id.clone())
            .unwrap_or_default();
        let device = payload
            .device_id
            .clone()
            .or_else(|| payload.device_name.clone())
            .unwrap_or_default();
        if !self.allowed(&user, &device) {
            return Ok(IngestEvent::Ignored("user or device filtered"));
        }

        let mut play = to_play(&payload)?;
        play.meta.user = Some(user.clone());
        play.meta.device_id = Some(device.clone());

        Ok(IngestEvent::Player(PlayerUpdate {
            key: PlayerKey {
                device_id: device,
                user,
            },
            play,
            status,
            position: payload
                .playback_position_ticks
                .map(|t| t / TICKS_PER_SECOND),
        }))
    }
}
