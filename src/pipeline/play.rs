use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The listen itself: what was played and when.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayData {
    pub track: String,
    /// Ordered; the first artist is the primary artist.
    #[serde(default)]
    pub artists: Vec<String>,
    /// Only kept when it differs from `artists`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub album_artists: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub album: Option<String>,
    /// Track length in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    /// The instant the listen was complete or observed.
    pub play_date: DateTime<Utc>,
    /// Seconds actually listened, at most `duration`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listened_for: Option<u64>,
}

/// Where the listen came from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayMeta {
    /// Symbolic name of the originating source.
    #[serde(default)]
    pub source: String,
    /// Platform-specific opaque id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_url: Option<String>,
    /// True when the source observed the play in real time rather than
    /// finding it in a backlog.
    #[serde(default)]
    pub new_from_source: bool,
}

/// A single listen event as it travels the pipeline. Copied, never shared:
/// once a play has been handed to a client it is not mutated again upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Play {
    pub data: PlayData,
    pub meta: PlayMeta,
}

impl Play {
    pub fn new(track: impl Into<String>, play_date: DateTime<Utc>) -> Self {
        Play {
            data: PlayData {
                track: track.into(),
                artists: Vec::new(),
                album_artists: Vec::new(),
                album: None,
                duration: None,
                play_date,
                listened_for: None,
            },
            meta: PlayMeta::default(),
        }
    }

    pub fn primary_artist(&self) -> Option<&str> {
        self.data.artists.first().map(String::as_str)
    }

    /// Unsets any field a transform reduced to the empty string and drops
    /// album artists when they mirror the artist list.
    pub fn prune_empty(&mut self) {
        self.data.artists.retain(|a| !a.trim().is_empty());
        self.data.album_artists.retain(|a| !a.trim().is_empty());
        if self.data.album_artists == self.data.artists {
            self.data.album_artists.clear();
        }
        if let Some(album) = &self.data.album {
            if album.trim().is_empty() {
                self.data.album = None;
            }
        }
    }

    /// Short human form used in log lines: `Artist - Track @ time`.
    pub fn describe(&self) -> String {
        format!(
            "{} - {} @ {}",
            self.primary_artist().unwrap_or("?"),
            self.data.track,
            self.data.play_date.to_rfc3339()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn play() -> Play {
        let mut p = Play::new("Sonora", Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
        p.data.artists = vec!["The Bongo Hop".to_string()];
        p
    }

    #[test]
    fn prune_drops_empty_album() {
        let mut p = play();
        p.data.album = Some("  ".to_string());
        p.prune_empty();
        assert_eq!(p.data.album, None);
    }

    #[test]
    fn prune_drops_album_artists_matching_artists() {
        let mut p = play();
        p.data.album_artists = vec!["The Bongo Hop".to_string()];
        p.prune_empty();
        assert!(p.data.album_artists.is_empty());
    }

    #[test]
    fn prune_removes_blank_artists() {
        let mut p = play();
        p.data.artists.push(String::new());
        p.prune_empty();
        assert_eq!(p.data.artists.len(), 1);
    }
}
