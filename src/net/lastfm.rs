//! Last.fm API v2 plumbing shared by the source (recent-track polling) and
//! the client (scrobbling). Auth is the classic desktop flow: fetch a token,
//! send the user to authorize it, trade it for a session key.

pub mod requests;
pub mod types;

use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::pipeline::play::Play;

use self::requests::RequestBuilder;
use self::types::{GetSession, GetToken, RecentTracks, ScrobbleResponse, Session};

pub const AUTH_URL: &str = "https://www.last.fm/api/auth/";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

// Error codes the API documents.
const CODE_AUTH: &[u32] = &[4, 9, 14, 17];
const CODE_RETRYABLE: &[u32] = &[11, 16, 29];

#[derive(Debug, Error)]
pub enum LastFmError {
    #[error("last.fm api error {code}: {message}")]
    Api { code: u32, message: String },
    #[error("http error: {0}")]
    Http(#[from] isahc::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected response: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("bad request: {0}")]
    Request(String),
    #[error("not authenticated")]
    NoSession,
    #[error("scrobble ignored by last.fm: {0}")]
    Ignored(String),
}

impl LastFmError {
    /// Session key no longer valid; the user must re-authorize.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, LastFmError::Api { code, .. } if CODE_AUTH.contains(code))
            || matches!(self, LastFmError::NoSession)
    }

    /// Worth retrying the same call later.
    pub fn is_retryable(&self) -> bool {
        match self {
            LastFmError::Api { code, .. } => CODE_RETRYABLE.contains(code),
            LastFmError::Http(e) => e.is_timeout(),
            _ => false,
        }
    }
}

/// Outcome of one pass through the desktop auth flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Authed { user: String },
    /// The user must approve the pending token at this URL first.
    InteractionRequired(String),
}

/// The desktop auth flow: reuse a stored session when one exists, otherwise
/// mint a token, hand out the authorize URL, and trade the token for a
/// session on the next pass. Shared by the source and client adapters.
pub struct SessionAuth {
    /// Credentials-store key, `currentCreds-<name>.json`.
    name: String,
    pending_token: Option<String>,
}

impl SessionAuth {
    pub fn new(name: impl Into<String>) -> Self {
        SessionAuth {
            name: name.into(),
            pending_token: None,
        }
    }

    pub async fn authenticate(
        &mut self,
        api: &mut LastFmApi,
        creds: &crate::shared::creds::CredentialsStore,
    ) -> Result<SessionOutcome, crate::pipeline::lifecycle::InitError> {
        use crate::pipeline::lifecycle::InitError;

        if let Some(session) = creds
            .load::<Session>(&self.name)
            .map_err(|e| InitError::Auth(e.to_string()))?
        {
            api.set_session(session.key);
            return Ok(SessionOutcome::Authed { user: session.name });
        }

        // Second pass after the user visited the authorize URL.
        if let Some(token) = self.pending_token.take() {
            match api.get_session(&token).await {
                Ok(session) => {
                    creds
                        .save(&self.name, &session)
                        .await
                        .map_err(|e| InitError::Auth(e.to_string()))?;
                    api.set_session(session.key);
                    return Ok(SessionOutcome::Authed { user: session.name });
                }
                Err(err) if err.is_retryable() => {
                    self.pending_token = Some(token);
                    return Err(InitError::Network(anyhow::Error::new(err)));
                }
                Err(err @ LastFmError::Api { .. }) => {
                    // Token expired or was never approved; start over.
                    debug!("[{}] token exchange failed: {err}", self.name);
                }
                Err(err) => return Err(InitError::Network(anyhow::Error::new(err))),
            }
        }

        let token = api
            .get_token()
            .await
            .map_err(|e| InitError::Network(anyhow::Error::new(e)))?;
        let url = api.authorize_url(&token);
        self.pending_token = Some(token);
        Ok(SessionOutcome::InteractionRequired(url))
    }
}

pub struct LastFmApi {
    api_key: String,
    api_secret: String,
    session_key: Option<String>,
    timeout: Duration,
}

impl LastFmApi {
    pub fn new(api_key: String, api_secret: String) -> Self {
        LastFmApi {
            api_key,
            api_secret,
            session_key: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn set_session(&mut self, key: String) {
        self.session_key = Some(key);
    }

    pub fn has_session(&self) -> bool {
        self.session_key.is_some()
    }

    fn request(&self) -> RequestBuilder {
        RequestBuilder::new(self.api_key.clone(), self.timeout)
    }

    fn session(&self) -> Result<String, LastFmError> {
        self.session_key.clone().ok_or(LastFmError::NoSession)
    }

    pub async fn get_token(&self) -> Result<String, LastFmError> {
        let token: GetToken = self
            .request()
            .method("auth.gettoken")
            .sign(&self.api_secret)
            .get()
            .await?;
        Ok(token.token)
    }

    /// URL the user must visit to approve `token`.
    pub fn authorize_url(&self, token: &str) -> String {
        format!("{AUTH_URL}?api_key={}&token={token}", self.api_key)
    }

    pub async fn get_session(&self, token: &str) -> Result<Session, LastFmError> {
        let session: GetSession = self
            .request()
            .method("auth.getsession")
            .param("token", token.to_string())
            .sign(&self.api_secret)
            .get()
            .await?;
        Ok(session.session)
    }

    /// The user's recent listens, newest first. The transient now-playing
    /// entry is dropped.
    pub async fn recent_tracks(&self, user: &str, limit: u32) -> Result<Vec<Play>, LastFmError> {
        let response: RecentTracks = self
            .request()
            .method("user.getRecentTracks")
            .param("user", user.to_string())
            .param("limit", limit.to_string())
            .sign(&self.api_secret)
            .get()
            .await?;
        Ok(response
            .recenttracks
            .track
            .iter()
            .filter(|t| !t.is_now_playing())
            .filter_map(|t| t.to_play())
            .collect())
    }

    /// Submit one scrobble. Returns the play as the service recorded it,
    /// corrections applied.
    pub async fn scrobble(&self, play: &Play) -> Result<Play, LastFmError> {
        let artist = play
            .primary_artist()
            .ok_or_else(|| LastFmError::Request("play has no artist".into()))?
            .to_string();
        let response: ScrobbleResponse = self
            .request()
            .method("track.scrobble")
            .param("artist[0]", artist)
            .param("track[0]", play.data.track.clone())
            .param("timestamp[0]", play.data.play_date.timestamp().to_string())
            .optional_param("album[0]", play.data.album.clone())
            .optional_param("duration[0]", play.data.duration.map(|d| d.to_string()))
            .param("sk", self.session()?)
            .sign(&self.api_secret)
            .post()
            .await?;

        let body = response.scrobbles;
        if body.attr.accepted == 0 {
            let reason = match body.scrobble.ignored_message {
                Some(m) if !m.text.is_empty() => format!("{} (code {})", m.text, m.code),
                Some(m) => format!("ignored with code {}", m.code),
                None => format!("{} ignored", body.attr.ignored),
            };
            return Err(LastFmError::Ignored(reason));
        }

        let mut recorded = play.clone();
        if let Some(echoed) = body
            .scrobble
            .timestamp
            .parse::<i64>()
            .ok()
            .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0))
        {
            recorded.data.play_date = echoed;
        }
        if !body.scrobble.track.text.is_empty() {
            recorded.data.track = body.scrobble.track.text;
        }
        if !body.scrobble.artist.text.is_empty() {
            recorded.data.artists = vec![body.scrobble.artist.text];
        }
        if let Some(album) = body.scrobble.album {
            recorded.data.album = Some(album.text).filter(|a| !a.is_empty());
        }
        debug!("scrobbled {}", recorded.describe());
        Ok(recorded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u32) -> LastFmError {
        LastFmError::Api {
            code,
            message: String::new(),
        }
    }

    #[test]
    fn auth_codes_are_auth_failures() {
        assert!(api_error(9).is_auth_failure());
        assert!(api_error(17).is_auth_failure());
        assert!(!api_error(11).is_auth_failure());
        assert!(LastFmError::NoSession.is_auth_failure());
    }

    #[test]
    fn transient_codes_are_retryable() {
        assert!(api_error(11).is_retryable());
        assert!(api_error(16).is_retryable());
        assert!(api_error(29).is_retryable());
        assert!(!api_error(6).is_retryable());
    }

    #[test]
    fn authorize_url_carries_key_and_token() {
        let api = LastFmApi::new("key123".into(), "secret".into());
        assert_eq!(
            api.authorize_url("tok456"),
            "https://www.last.fm/api/auth/?api_key=key123&token=tok456"
        );
    }
}
