//! ListenBrainz API plumbing: token auth, single-listen submission, and the
//! user's listen history for the existing-scrobble snapshot.

use std::time::Duration;

use isahc::config::Configurable;
use isahc::{AsyncReadResponseExt, Request};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::pipeline::play::Play;

pub const DEFAULT_API_URL: &str = "https://api.listenbrainz.org";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ListenBrainzError {
    #[error("http error: {0}")]
    Http(#[from] isahc::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("listenbrainz rejected the token")]
    InvalidToken,
    #[error("listenbrainz returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("unexpected response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("bad request: {0}")]
    Request(String),
}

impl ListenBrainzError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ListenBrainzError::Http(e) => e.is_timeout(),
            ListenBrainzError::Status { status, .. } => {
                *status == 429 || *status == 502 || *status == 503
            }
            _ => false,
        }
    }

    pub fn is_auth_failure(&self) -> bool {
        matches!(self, ListenBrainzError::InvalidToken)
            || matches!(self, ListenBrainzError::Status { status: 401, .. })
    }
}

#[derive(Serialize)]
struct SubmitListens {
    listen_type: &'static str,
    payload: Vec<Listen>,
}

#[derive(Serialize, Deserialize)]
struct Listen {
    #[serde(skip_serializing_if = "Option::is_none")]
    listened_at: Option<i64>,
    track_metadata: TrackMetadata,
}

#[derive(Serialize, Deserialize)]
struct TrackMetadata {
    artist_name: String,
    track_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    release_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    additional_info: Option<AdditionalInfo>,
}

#[derive(Serialize, Deserialize, Default)]
struct AdditionalInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    duration: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    origin_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    submission_client: Option<String>,
}

#[derive(Deserialize)]
struct ValidateToken {
    valid: bool,
    #[serde(default)]
    user_name: Option<String>,
}

#[derive(Deserialize)]
struct UserListens {
    payload: UserListensPayload,
}

#[derive(Deserialize)]
struct UserListensPayload {
    #[serde(default)]
    listens: Vec<Listen>,
}

fn listen_from_play(play: &Play) -> Listen {
    Listen {
        listened_at: Some(play.data.play_date.timestamp()),
        track_metadata: TrackMetadata {
            artist_name: play.data.artists.join(", "),
            track_name: play.data.track.clone(),
            release_name: play.data.album.clone(),
            additional_info: Some(AdditionalInfo {
                duration: play.data.duration,
                origin_url: play.meta.web_url.clone(),
                submission_client: Some(env!("CARGO_PKG_NAME").to_string()),
            }),
        },
    }
}

fn play_from_listen(listen: &Listen) -> Option<Play> {
    let listened_at = listen.listened_at?;
    let play_date = chrono::DateTime::from_timestamp(listened_at, 0)?;
    let mut play = Play::new(listen.track_metadata.track_name.clone(), play_date);
    play.data.artists = vec![listen.track_metadata.artist_name.clone()];
    play.data.album = listen.track_metadata.release_name.clone();
    if let Some(info) = &listen.track_metadata.additional_info {
        play.data.duration = info.duration;
        play.meta.web_url = info.origin_url.clone();
    }
    Some(play)
}

pub struct ListenBrainzApi {
    base_url: Url,
    token: String,
    timeout: Duration,
}

impl ListenBrainzApi {
    pub fn new(base_url: Option<&str>, token: String) -> Result<Self, ListenBrainzError> {
        let base = base_url.unwrap_or(DEFAULT_API_URL);
        let base_url =
            Url::parse(base).map_err(|e| ListenBrainzError::Request(format!("bad url: {e}")))?;
        Ok(ListenBrainzApi {
            base_url,
            token,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ListenBrainzError> {
        self.base_url
            .join(path)
            .map_err(|e| ListenBrainzError::Request(format!("bad endpoint: {e}")))
    }

    fn check_status(status: u16, body: String) -> Result<String, ListenBrainzError> {
        if status == 401 {
            return Err(ListenBrainzError::InvalidToken);
        }
        if !(200..300).contains(&status) {
            return Err(ListenBrainzError::Status {
                status,
                message: body.chars().take(200).collect(),
            });
        }
        Ok(body)
    }

    /// Validate the token; returns the account name it belongs to.
    pub async fn validate_token(&self) -> Result<String, ListenBrainzError> {
        let request = Request::get(self.endpoint("/1/validate-token")?.as_str())
            .timeout(self.timeout)
            .header("Authorization", format!("Token {}", self.token))
            .body(())
            .map_err(|e| ListenBrainzError::Request(e.to_string()))?;
        let mut response = isahc::send_async(request).await?;
        let body = Self::check_status(response.status().as_u16(), response.text().await?)?;

        let validated: ValidateToken = serde_json::from_str(&body)?;
        if !validated.valid {
            return Err(ListenBrainzError::InvalidToken);
        }
        Ok(validated.user_name.unwrap_or_default())
    }

    /// Submit a single listen. The service echoes nothing useful, so the
    /// caller's play is returned as the record.
    pub async fn submit_listen(&self, play: &Play) -> Result<Play, ListenBrainzError> {
        if play.data.artists.is_empty() {
            return Err(ListenBrainzError::Request("play has no artist".into()));
        }
        let submission = SubmitListens {
            listen_type: "single",
            payload: vec![listen_from_play(play)],
        };
        let request = Request::post(self.endpoint("/1/submit-listens")?.as_str())
            .timeout(self.timeout)
            .header("Authorization", format!("Token {}", self.token))
            .header("Content-Type", "application/json")
            .body(serde_json::to_string(&submission)?)
            .map_err(|e| ListenBrainzError::Request(e.to_string()))?;
        let mut response = isahc::send_async(request).await?;
        Self::check_status(response.status().as_u16(), response.text().await?)?;
        Ok(play.clone())
    }

    /// The user's listen history, newest first.
    pub async fn user_listens(
        &self,
        user: &str,
        count: u32,
    ) -> Result<Vec<Play>, ListenBrainzError> {
        let mut endpoint = self.endpoint(&format!("/1/user/{user}/listens"))?;
        endpoint
            .query_pairs_mut()
            .append_pair("count", &count.to_string());
        let request = Request::get(endpoint.as_str())
            .timeout(self.timeout)
            .header("Authorization", format!("Token {}", self.token))
            .body(())
            .map_err(|e| ListenBrainzError::Request(e.to_string()))?;
        let mut response = isahc::send_async(request).await?;
        let body = Self::check_status(response.status().as_u16(), response.text().await?)?;

        let listens: UserListens = serde_json::from_str(&body)?;
        Ok(listens
            .payload
            .listens
            .iter()
            .filter_map(play_from_listen)
            .collect())
    }
}
