//! ListenBrainz as a scrobble client. Token auth, no interactive flow.

use async_trait::async_trait;
use serde::Deserialize;

use crate::net::listenbrainz::{ListenBrainzApi, ListenBrainzError};
use crate::pipeline::lifecycle::{AuthOutcome, InitError, InitHooks};
use crate::pipeline::play::Play;

use super::{ClientAdapter, ClientError};

const RECENT_LIMIT: u32 = 100;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenBrainzData {
    pub token: Option<String>,
    /// Account name; discovered from the token when omitted.
    pub username: Option<String>,
    /// Alternate API root, for self-hosted instances.
    pub url: Option<String>,
}

pub struct ListenBrainzClient {
    data: ListenBrainzData,
    api: Option<ListenBrainzApi>,
    username: Option<String>,
}

impl ListenBrainzClient {
    pub fn new(data: ListenBrainzData) -> Self {
        ListenBrainzClient {
            data,
            api: None,
            username: None,
        }
    }

    fn api(&self) -> Result<&ListenBrainzApi, ClientError> {
        self.api
            .as_ref()
            .ok_or_else(|| ClientError::AuthRevoked("client not authenticated".into()))
    }
}

fn to_client_error(err: ListenBrainzError) -> ClientError {
    if err.is_auth_failure() {
        ClientError::AuthRevoked(err.to_string())
    } else if err.is_retryable() {
        ClientError::upstream(err.to_string(), false)
    } else {
        match err {
            ListenBrainzError::Http(inner) => ClientError::Network(anyhow::Error::new(inner)),
            other => ClientError::upstream(other.to_string(), true),
        }
    }
}

#[async_trait]
impl InitHooks for ListenBrainzClient {
    async fn build_init_data(&mut self) -> Result<Option<String>, InitError> {
        let token = self
            .data
            .token
            .clone()
            .ok_or_else(|| InitError::Config("listenbrainz client requires token".into()))?;
        let api = ListenBrainzApi::new(self.data.url.as_deref(), token)
            .map_err(|e| InitError::Config(e.to_string()))?;
        self.api = Some(api);
        Ok(Some("api client ready".into()))
    }

    fn requires_auth(&self) -> bool {
        true
    }

    async fn authenticate(&mut self) -> Result<AuthOutcome, InitError> {
        let api = self
            .api
            .as_ref()
            .ok_or_else(|| InitError::Config("authenticate before buildInitData".into()))?;
        match api.validate_token().await {
            Ok(account) => {
                self.username = self
                    .data
                    .username
                    .clone()
                    .or(Some(account).filter(|a| !a.is_empty()));
                if self.username.is_none() {
                    return Err(InitError::Config(
                        "token is valid but has no account name; set username".into(),
                    ));
                }
                Ok(AuthOutcome::Authed)
            }
            Err(err) if err.is_auth_failure() => Err(InitError::Auth(err.to_string())),
            Err(err) => Err(InitError::Network(anyhow::Error::new(err))),
        }
    }
}

#[async_trait]
impl ClientAdapter for ListenBrainzClient {
    fn kind(&self) -> &'static str {
        "listenbrainz"
    }

    async fn scrobble(&mut self, play: &Play) -> Result<Play, ClientError> {
        self.api()?.submit_listen(play).await.map_err(to_client_error)
    }

    async fn recent_scrobbles(&mut self) -> Result<Vec<Play>, ClientError> {
        let username = self
            .username
            .clone()
            .ok_or_else(|| ClientError::AuthRevoked("no account name".into()))?;
        self.api()?
            .user_listens(&username, RECENT_LIMIT)
            .await
            .map_err(to_client_error)
    }
}
