use serde::{Deserialize, Serialize};

use crate::pipeline::play::Play;

#[derive(Deserialize)]
pub struct GetToken {
    pub token: String,
}

#[derive(Deserialize)]
pub struct GetSession {
    pub session: Session,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct Session {
    pub name: String,
    pub key: String,
}

/// Error body the API returns instead of the expected payload.
#[derive(Debug, Deserialize)]
pub struct ApiFailure {
    pub error: u32,
    pub message: String,
}

#[derive(Deserialize)]
pub struct RecentTracks {
    pub recenttracks: RecentTracksInner,
}

#[derive(Deserialize)]
pub struct RecentTracksInner {
    #[serde(default)]
    pub track: Vec<RecentTrack>,
}

#[derive(Deserialize)]
pub struct RecentTrack {
    pub name: String,
    pub artist: TextField,
    #[serde(default)]
    pub album: Option<TextField>,
    #[serde(default)]
    pub mbid: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub date: Option<DateField>,
    #[serde(default, rename = "@attr")]
    pub attr: Option<TrackAttr>,
}

#[derive(Deserialize)]
pub struct TextField {
    #[serde(rename = "#text")]
    pub text: String,
}

#[derive(Deserialize)]
pub struct DateField {
    pub uts: String,
}

#[derive(Deserialize)]
pub struct TrackAttr {
    #[serde(default)]
    pub nowplaying: Option<String>,
}

impl RecentTrack {
    pub fn is_now_playing(&self) -> bool {
        self.attr
            .as_ref()
            .and_then(|a| a.nowplaying.as_deref())
            .is_some_and(|v| v == "true")
    }

    /// Lower to a play; `None` when the entry has no usable timestamp
    /// (the now-playing pseudo-entry).
    pub fn to_play(&self) -> Option<Play> {
        let uts: i64 = self.date.as_ref()?.uts.parse().ok()?;
        let play_date = chrono::DateTime::from_timestamp(uts, 0)?;
        let mut play = Play::new(self.name.clone(), play_date);
        play.data.artists = vec![self.artist.text.clone()];
        play.data.album = self
            .album
            .as_ref()
            .map(|a| a.text.clone())
            .filter(|a| !a.is_empty());
        play.meta.track_id = self.mbid.clone().filter(|m| !m.is_empty());
        play.meta.web_url = self.url.clone();
        Some(play)
    }
}

#[derive(Deserialize)]
pub struct ScrobbleResponse {
    pub scrobbles: ScrobblesBody,
}

#[derive(Deserialize)]
pub struct ScrobblesBody {
    #[serde(rename = "@attr")]
    pub attr: ScrobblesAttr,
    pub scrobble: ScrobbledCorrection,
}

#[derive(Deserialize)]
pub struct ScrobblesAttr {
    pub accepted: u32,
    pub ignored: u32,
}

/// The service echoes the scrobble back with any corrections applied.
#[derive(Deserialize)]
pub struct ScrobbledCorrection {
    pub track: TextField,
    pub artist: TextField,
    #[serde(default)]
    pub album: Option<TextField>,
    pub timestamp: String,
    #[serde(default, rename = "ignoredMessage")]
    pub ignored_message: Option<IgnoredMessage>,
}

#[derive(Deserialize)]
pub struct IgnoredMessage {
    #[serde(rename = "code")]
    pub code: String,
    #[serde(rename = "#text")]
    pub text: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recent_track_lowers_to_play() {
        let json = r##"{
            "name": "Sonora",
            "artist": {"#text": "The Bongo Hop"},
            "album": {"#text": "Satingarona Pt. 2"},
            "mbid": "abc-123",
            "url": "https://www.last.fm/music/x",
            "date": {"uts": "1714567800"}
        }"##;
        let track: RecentTrack = serde_json::from_str(json).unwrap();
        let play = track.to_play().unwrap();
        assert_eq!(play.data.track, "Sonora");
        assert_eq!(play.data.artists, vec!["The Bongo Hop"]);
        assert_eq!(play.data.play_date.timestamp(), 1714567800);
    }

    #[test]
    fn now_playing_entry_has_no_play() {
        let json = r##"{
            "name": "Sonora",
            "artist": {"#text": "The Bongo Hop"},
            "@attr": {"nowplaying": "true"}
        }"##;
        let track: RecentTrack = serde_json::from_str(json).unwrap();
        assert!(track.is_now_playing());
        assert!(track.to_play().is_none());
    }

    #[test]
    fn scrobble_response_parses() {
        let json = r##"{
            "scrobbles": {
                "@attr": {"accepted": 1, "ignored": 0},
                "scrobble": {
                    "track": {"#text": "Sonora"},
                    "artist": {"#text": "The Bongo Hop"},
                    "album": {"#text": ""},
                    "timestamp": "1714567800",
                    "ignoredMessage": {"code": "0", "#text": ""}
                }
            }
        }"##;
        let response: ScrobbleResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.scrobbles.attr.accepted, 1);
        assert_eq!(response.scrobbles.scrobble.track.text, "Sonora");
    }
}
