//! Last.fm as a scrobble client.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::net::lastfm::{LastFmApi, LastFmError, SessionAuth, SessionOutcome};
use crate::pipeline::lifecycle::{AuthOutcome, InitError, InitHooks};
use crate::pipeline::play::Play;
use crate::shared::creds::CredentialsStore;

use super::{ClientAdapter, ClientError};

const RECENT_LIMIT: u32 = 100;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastFmClientData {
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
}

pub struct LastFmClient {
    data: LastFmClientData,
    api: Option<LastFmApi>,
    auth: SessionAuth,
    user: Option<String>,
    creds: Arc<CredentialsStore>,
}

impl LastFmClient {
    pub fn new(
        name: impl Into<String>,
        data: LastFmClientData,
        creds: Arc<CredentialsStore>,
    ) -> Self {
        LastFmClient {
            data,
            api: None,
            auth: SessionAuth::new(name),
            user: None,
            creds,
        }
    }

    fn api(&self) -> Result<&LastFmApi, ClientError> {
        self.api
            .as_ref()
            .filter(|api| api.has_session())
            .ok_or_else(|| ClientError::AuthRevoked("no active session".into()))
    }
}

fn to_client_error(err: LastFmError) -> ClientError {
    if err.is_auth_failure() {
        ClientError::AuthRevoked(err.to_string())
    } else if err.is_retryable() {
        ClientError::upstream(err.to_string(), false)
    } else {
        match err {
            LastFmError::Http(inner) => ClientError::Network(anyhow::Error::new(inner)),
            other => ClientError::upstream(other.to_string(), true),
        }
    }
}

#[async_trait]
impl InitHooks for LastFmClient {
    async fn build_init_data(&mut self) -> Result<Option<String>, InitError> {
        let api_key = self
            .data
            .api_key
            .clone()
            .ok_or_else(|| InitError::Config("lastfm client requires apiKey".into()))?;
        let api_secret = self
            .data
            .api_secret
            .clone()
            .ok_or_else(|| InitError::Config("lastfm client requires apiSecret".into()))?;
        self.api = Some(LastFmApi::new(api_key, api_secret));
        Ok(Some("api client ready".into()))
    }

    fn requires_auth(&self) -> bool {
        true
    }

    async fn authenticate(&mut self) -> Result<AuthOutcome, InitError> {
        let api = self
            .api
            .as_mut()
            .ok_or_else(|| InitError::Config("authenticate before buildInitData".into()))?;
        match self.auth.authenticate(api, &self.creds).await? {
            SessionOutcome::Authed { user } => {
                self.user = Some(user);
                Ok(AuthOutcome::Authed)
            }
            SessionOutcome::InteractionRequired(url) => {
                Ok(AuthOutcome::InteractionRequired(url))
            }
        }
    }
}

#[async_trait]
impl ClientAdapter for LastFmClient {
    fn kind(&self) -> &'static str {
        "lastfm"
    }

    async fn scrobble(&mut self, play: &Play) -> Result<Play, ClientError> {
        self.api()?.scrobble(play).await.map_err(to_client_error)
    }

    async fn recent_scrobbles(&mut self) -> Result<Vec<Play>, ClientError> {
        let user = self
            .user
            .clone()
            .ok_or_else(|| ClientError::AuthRevoked("no session user".into()))?;
        self.api()?
            .recent_tracks(&user, RECENT_LIMIT)
            .await
            .map_err(to_client_error)
    }
}
