//! Last.fm as a source: polls the account's recent tracks so listens
//! recorded by other scrobblers can be fanned out to more clients.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::net::lastfm::{LastFmApi, SessionAuth, SessionOutcome};
use crate::pipeline::lifecycle::{AuthOutcome, InitError, InitHooks};
use crate::pipeline::play::Play;
use crate::shared::creds::CredentialsStore;

use super::{SourceAdapter, SourceCapabilities, SourceError};

const RECENT_LIMIT: u32 = 50;
const BACKLOG_LIMIT: u32 = 200;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastFmSourceData {
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    /// Account to poll. Defaults to the account the session belongs to.
    pub user: Option<String>,
}

pub struct LastFmSource {
    data: LastFmSourceData,
    api: Option<LastFmApi>,
    auth: SessionAuth,
    /// Account the session resolved to.
    user: Option<String>,
    creds: Arc<CredentialsStore>,
}

impl LastFmSource {
    pub fn new(
        name: impl Into<String>,
        data: LastFmSourceData,
        creds: Arc<CredentialsStore>,
    ) -> Self {
        LastFmSource {
            data,
            api: None,
            auth: SessionAuth::new(name),
            user: None,
            creds,
        }
    }

    fn poll_user(&self) -> Result<&str, SourceError> {
        self.data
            .user
            .as_deref()
            .or(self.user.as_deref())
            .ok_or(SourceError::NotReady)
    }

    async fn fetch(&self, limit: u32) -> Result<Vec<Play>, SourceError> {
        let api = self.api.as_ref().ok_or(SourceError::NotReady)?;
        let user = self.poll_user()?.to_string();
        let mut plays = api
            .recent_tracks(&user, limit)
            .await
            .map_err(|e| SourceError::Network(anyhow::Error::new(e)))?;
        for play in plays.iter_mut() {
            play.meta.user = Some(user.clone());
        }
        Ok(plays)
    }
}

#[async_trait]
impl InitHooks for LastFmSource {
    async fn build_init_data(&mut self) -> Result<Option<String>, InitError> {
        let api_key = self
            .data
            .api_key
            .clone()
            .ok_or_else(|| InitError::Config("lastfm source requires apiKey".into()))?;
        let api_secret = self
            .data
            .api_secret
            .clone()
            .ok_or_else(|| InitError::Config("lastfm source requires apiSecret".into()))?;
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
impl SourceAdapter for LastFmSource {
    fn kind(&self) -> &'static str {
        "lastfm"
    }

    fn capabilities(&self) -> SourceCapabilities {
        SourceCapabilities {
            requires_auth: true,
            can_poll: true,
            can_backlog: true,
            ..SourceCapabilities::default()
        }
    }

    async fn fetch_recent(&mut self) -> Result<Vec<Play>, SourceError> {
        self.fetch(RECENT_LIMIT).await
    }

    async fn fetch_backlog(&mut self) -> Result<Vec<Play>, SourceError> {
        self.fetch(BACKLOG_LIMIT).await
    }
}
