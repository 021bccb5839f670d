//! Shared init/auth scaffold for sources and clients: build-data, then
//! connection check, then authentication, with hard config failures pinned
//! and network failures left retryable.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use super::bus::{Bus, BusEvent, ComponentKind, EventKind};

#[derive(Debug, Error)]
pub enum InitError {
    /// The component's configuration can never work; do not retry.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// The other end was unreachable; retry later.
    #[error("connection failed: {0}")]
    Network(anyhow::Error),
    #[error("authentication failed: {0}")]
    Auth(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    NotInitialized,
    Initializing,
    Initialized,
    /// Config was rejected; stays here until the user fixes it.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Component does not authenticate.
    Skipped,
    Authed,
    /// The user must visit a URL before auth can complete.
    InteractionRequired(String),
}

/// The three ordered stages. `Ok(None)` means the stage does not apply,
/// `Ok(Some(detail))` that it passed, `Err` that it failed.
#[async_trait]
pub trait InitHooks {
    async fn build_init_data(&mut self) -> Result<Option<String>, InitError> {
        Ok(None)
    }

    async fn check_connection(&mut self) -> Result<Option<String>, InitError> {
        Ok(None)
    }

    fn requires_auth(&self) -> bool {
        false
    }

    async fn authenticate(&mut self) -> Result<AuthOutcome, InitError> {
        Ok(AuthOutcome::Skipped)
    }
}

/// Per-component lifecycle record. Owned by the source hub / client core,
/// which drives `initialize` against its adapter.
pub struct Lifecycle {
    name: String,
    kind: ComponentKind,
    state: InitState,
    authed: bool,
    /// URL the user must visit when auth needs interaction.
    pub auth_interaction_url: Option<String>,
    last_error: Option<String>,
    bus: Arc<Bus>,
}

impl Lifecycle {
    pub fn new(name: impl Into<String>, kind: ComponentKind, bus: Arc<Bus>) -> Self {
        Lifecycle {
            name: name.into(),
            kind,
            state: InitState::NotInitialized,
            authed: false,
            auth_interaction_url: None,
            last_error: None,
            bus,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> InitState {
        self.state
    }

    pub fn authed(&self) -> bool {
        self.authed
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// A component is usable once initialized and, when auth applies,
    /// authenticated.
    pub fn ready(&self, requires_auth: bool) -> bool {
        self.state == InitState::Initialized && (!requires_auth || self.authed)
    }

    pub fn deauth(&mut self) {
        self.authed = false;
    }

    /// Allow another full initialize pass, e.g. after the user approved an
    /// interactive auth request. Permanently failed components stay failed.
    pub fn reset_for_retry(&mut self) {
        if self.state == InitState::Initialized && !self.authed {
            self.state = InitState::NotInitialized;
        }
    }

    async fn transition(&mut self, state: InitState, detail: Option<String>) {
        self.state = state;
        self.last_error = match state {
            InitState::Failed => detail.clone(),
            _ => None,
        };
        let mut event = BusEvent::new(EventKind::StatusChange, self.name.clone(), self.kind);
        if let Some(detail) = detail {
            event = event.with_detail(detail);
        }
        self.bus.publish(event).await;
    }

    /// Run the scaffold against `target`. Idempotent: an initialized or
    /// permanently failed component is left alone. Returns whether the
    /// component ended up ready; a `Network` error leaves it retryable.
    pub async fn initialize<T: InitHooks + ?Sized + Send>(
        &mut self,
        target: &mut T,
    ) -> Result<bool, InitError> {
        match self.state {
            InitState::Initialized => return Ok(self.ready(target.requires_auth())),
            InitState::Failed => return Ok(false),
            _ => {}
        }
        self.transition(InitState::Initializing, None).await;

        for stage in ["buildInitData", "checkConnection"] {
            let result = match stage {
                "buildInitData" => target.build_init_data().await,
                _ => target.check_connection().await,
            };
            match result {
                Ok(None) => {}
                Ok(Some(detail)) => info!("[{}] {stage}: {detail}", self.name),
                Err(err @ InitError::Config(_)) => {
                    warn!("[{}] {stage} rejected config: {err}", self.name);
                    self.transition(InitState::Failed, Some(err.to_string())).await;
                    return Err(err);
                }
                Err(err) => {
                    warn!("[{}] {stage} failed, will retry: {err}", self.name);
                    self.transition(InitState::NotInitialized, Some(err.to_string()))
                        .await;
                    return Err(err);
                }
            }
        }

        if target.requires_auth() {
            match target.authenticate().await {
                Ok(AuthOutcome::Authed) => {
                    self.authed = true;
                    self.auth_interaction_url = None;
                }
                Ok(AuthOutcome::InteractionRequired(url)) => {
                    self.authed = false;
                    info!("[{}] authentication requires a visit to {url}", self.name);
                    self.auth_interaction_url = Some(url);
                }
                Ok(AuthOutcome::Skipped) => {}
                Err(err @ InitError::Config(_)) => {
                    self.transition(InitState::Failed, Some(err.to_string())).await;
                    return Err(err);
                }
                Err(err) => {
                    self.transition(InitState::NotInitialized, Some(err.to_string()))
                        .await;
                    return Err(err);
                }
            }
        }

        self.transition(InitState::Initialized, None).await;
        Ok(self.ready(target.requires_auth()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Scripted {
        build: Result<Option<String>, InitError>,
        auth: bool,
        auth_result: Result<AuthOutcome, InitError>,
        build_calls: usize,
    }

    impl Scripted {
        fn ok() -> Self {
            Scripted {
                build: Ok(Some("ready".into())),
                auth: false,
                auth_result: Ok(AuthOutcome::Skipped),
                build_calls: 0,
            }
        }
    }

    #[async_trait]
    impl InitHooks for Scripted {
        async fn build_init_data(&mut self) -> Result<Option<String>, InitError> {
            self.build_calls += 1;
            match &self.build {
                Ok(v) => Ok(v.clone()),
                Err(InitError::Config(msg)) => Err(InitError::Config(msg.clone())),
                Err(InitError::Auth(msg)) => Err(InitError::Auth(msg.clone())),
                Err(InitError::Network(e)) => Err(InitError::Network(anyhow::anyhow!("{e}"))),
            }
        }

        fn requires_auth(&self) -> bool {
            self.auth
        }

        async fn authenticate(&mut self) -> Result<AuthOutcome, InitError> {
            match &self.auth_result {
                Ok(v) => Ok(v.clone()),
                Err(InitError::Auth(msg)) => Err(InitError::Auth(msg.clone())),
                _ => unreachable!(),
            }
        }
    }

    fn lifecycle() -> Lifecycle {
        Lifecycle::new("test", ComponentKind::Source, Arc::new(Bus::new()))
    }

    #[test]
    fn happy_path_initializes() {
        smol::block_on(async {
            let mut lc = lifecycle();
            let mut target = Scripted::ok();
            assert!(lc.initialize(&mut target).await.unwrap());
            assert_eq!(lc.state(), InitState::Initialized);
        });
    }

    #[test]
    fn initialize_is_idempotent() {
        smol::block_on(async {
            let mut lc = lifecycle();
            let mut target = Scripted::ok();
            lc.initialize(&mut target).await.unwrap();
            lc.initialize(&mut target).await.unwrap();
            assert_eq!(target.build_calls, 1);
        });
    }

    #[test]
    fn config_error_pins_the_component() {
        smol::block_on(async {
            let mut lc = lifecycle();
            let mut target = Scripted::ok();
            target.build = Err(InitError::Config("missing apiKey".into()));
            assert!(lc.initialize(&mut target).await.is_err());
            assert_eq!(lc.state(), InitState::Failed);
            // Does not retry a failed config.
            assert!(!lc.initialize(&mut target).await.unwrap());
            assert_eq!(target.build_calls, 1);
        });
    }

    #[test]
    fn network_error_stays_retryable() {
        smol::block_on(async {
            let mut lc = lifecycle();
            let mut target = Scripted::ok();
            target.build = Err(InitError::Network(anyhow::anyhow!("connection refused")));
            assert!(lc.initialize(&mut target).await.is_err());
            assert_eq!(lc.state(), InitState::NotInitialized);

            target.build = Ok(None);
            assert!(lc.initialize(&mut target).await.unwrap());
            assert_eq!(lc.state(), InitState::Initialized);
        });
    }

    #[test]
    fn auth_interaction_is_surfaced() {
        smol::block_on(async {
            let mut lc = lifecycle();
            let mut target = Scripted::ok();
            target.auth = true;
            target.auth_result = Ok(AuthOutcome::InteractionRequired(
                "https://example.test/auth".into(),
            ));
            let ready = lc.initialize(&mut target).await.unwrap();
            assert!(!ready);
            assert_eq!(
                lc.auth_interaction_url.as_deref(),
                Some("https://example.test/auth")
            );
        });
    }
}
