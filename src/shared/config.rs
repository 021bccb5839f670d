//! Configuration loading. A single `config.json` under the config dir plus
//! optional per-type files (`lastfm.json`, `jellyfin.json`, ...) that are
//! merged in. Everything is parsed up front; adapters receive their `data`
//! blob and fail initialization (not parsing) on bad contents.

use std::path::{Path, PathBuf};
use std::{env, fs};

use globwalk::GlobWalkerBuilder;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::pipeline::transform::rules::PlayTransformConfig;

/// Source types that may appear in config.
pub const SOURCE_TYPES: &[&str] = &["lastfm", "webscrobbler", "jellyfin"];
/// Client types that may appear in config.
pub const CLIENT_TYPES: &[&str] = &["lastfm", "listenbrainz"];

pub const DEFAULT_PORT: u16 = 9078;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)]
    pub sources: Vec<ComponentDefinition>,
    #[serde(default)]
    pub clients: Vec<ComponentDefinition>,
    #[serde(default)]
    pub source_defaults: CommonOptions,
    #[serde(default)]
    pub client_defaults: CommonOptions,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

/// One configured source or client.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentDefinition {
    /// Defaults to the type name when the config omits it.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_enable")]
    pub enable: bool,
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Webhook slug for push sources; see the ingress slug rule.
    #[serde(default)]
    pub slug: Option<String>,
    /// Adapter-specific settings, interpreted by the adapter at init.
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub options: CommonOptions,
}

fn default_enable() -> bool {
    true
}

impl ComponentDefinition {
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.kind)
    }
}

/// Options shared by sources and clients. Unset fields inherit from
/// `sourceDefaults` / `clientDefaults`, then from built-in defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommonOptions {
    #[serde(default)]
    pub play_transform: Option<PlayTransformConfig>,
    pub check_existing_scrobbles: Option<bool>,
    pub max_poll_retries: Option<u32>,
    pub retry_multiplier: Option<f64>,
    /// Minimum milliseconds between scrobble attempts.
    pub scrobble_delay: Option<u64>,
    /// Milliseconds the worker sleeps once the queue is drained.
    pub scrobble_sleep: Option<u64>,
    pub dead_letter_retries: Option<u32>,
    /// Poll interval in seconds.
    pub interval: Option<u64>,
    /// Consecutive clean history diffs required before emission resumes.
    pub stable_after: Option<u32>,
    /// Discovery ring capacity.
    pub ring_capacity: Option<usize>,
    /// Source names this client refuses plays from.
    #[serde(default)]
    pub exclude_sources: Option<Vec<String>>,
}

impl CommonOptions {
    /// Entry options layered over defaults; the transform and exclusion list
    /// are taken wholesale from whichever layer defines them.
    pub fn merged_over(&self, defaults: &CommonOptions) -> CommonOptions {
        CommonOptions {
            play_transform: self
                .play_transform
                .clone()
                .or_else(|| defaults.play_transform.clone()),
            check_existing_scrobbles: self
                .check_existing_scrobbles
                .or(defaults.check_existing_scrobbles),
            max_poll_retries: self.max_poll_retries.or(defaults.max_poll_retries),
            retry_multiplier: self.retry_multiplier.or(defaults.retry_multiplier),
            scrobble_delay: self.scrobble_delay.or(defaults.scrobble_delay),
            scrobble_sleep: self.scrobble_sleep.or(defaults.scrobble_sleep),
            dead_letter_retries: self.dead_letter_retries.or(defaults.dead_letter_retries),
            interval: self.interval.or(defaults.interval),
            stable_after: self.stable_after.or(defaults.stable_after),
            ring_capacity: self.ring_capacity.or(defaults.ring_capacity),
            exclude_sources: self
                .exclude_sources
                .clone()
                .or_else(|| defaults.exclude_sources.clone()),
        }
    }
}

/// Shape of a per-type config file.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypeFile {
    #[serde(default)]
    sources: Vec<ComponentDefinition>,
    #[serde(default)]
    clients: Vec<ComponentDefinition>,
}

/// Resolve the config directory: `CONFIG_DIR`, then `/config` under Docker,
/// then the platform config dir.
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = env::var("CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    if env::var("IS_DOCKER").map(|v| v == "true" || v == "1") == Ok(true) {
        return PathBuf::from("/config");
    }
    directories::ProjectDirs::from("", "", "scrobble-relay")
        .map(|dirs| dirs.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

pub fn load(dir: &Path) -> Result<AppConfig, ConfigError> {
    let main_path = dir.join("config.json");
    let mut config = if main_path.exists() {
        parse_file(&main_path)?
    } else {
        AppConfig::default()
    };

    for definition in config.sources.iter_mut().chain(config.clients.iter_mut()) {
        if definition.kind.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "component `{}` in config.json has no type",
                definition.name.as_deref().unwrap_or("?")
            )));
        }
    }

    merge_type_files(dir, &mut config)?;
    validate(&config)?;
    Ok(config)
}

fn parse_file<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn merge_type_files(dir: &Path, config: &mut AppConfig) -> Result<(), ConfigError> {
    let Ok(walker) = GlobWalkerBuilder::from_patterns(dir, &["*.json"])
        .max_depth(1)
        .build()
    else {
        return Ok(());
    };

    for entry in walker.flatten() {
        let path = entry.path();
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if stem == "config" || stem.starts_with("currentCreds-") {
            continue;
        }
        let known_source = SOURCE_TYPES.contains(&stem);
        let known_client = CLIENT_TYPES.contains(&stem);
        if !known_source && !known_client {
            debug!("ignoring unrecognized config file {}", path.display());
            continue;
        }

        let type_file: TypeFile = parse_file(path)?;
        for mut definition in type_file.sources {
            definition.kind = stem.to_string();
            config.sources.push(definition);
        }
        for mut definition in type_file.clients {
            definition.kind = stem.to_string();
            config.clients.push(definition);
        }
    }
    Ok(())
}

fn validate(config: &AppConfig) -> Result<(), ConfigError> {
    for (definitions, kinds, side) in [
        (&config.sources, SOURCE_TYPES, "source"),
        (&config.clients, CLIENT_TYPES, "client"),
    ] {
        let mut seen = Vec::new();
        for definition in definitions.iter() {
            if !kinds.contains(&definition.kind.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "unknown {side} type `{}`",
                    definition.kind
                )));
            }
            let name = definition.name().to_string();
            if seen.contains(&name) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate {side} name `{name}`"
                )));
            }
            seen.push(name);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, contents: &str) {
        fs::write(dir.join(name), contents).unwrap();
    }

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = env::temp_dir().join(format!("scrobble-relay-config-{tag}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn missing_config_yields_defaults() {
        let dir = temp_dir("empty");
        let config = load(&dir).unwrap();
        assert!(config.sources.is_empty());
        assert_eq!(config.port, DEFAULT_PORT);
    }

    #[test]
    fn main_and_type_files_merge() {
        let dir = temp_dir("merge");
        write(
            &dir,
            "config.json",
            r#"{"sources": [{"type": "webscrobbler", "name": "browser"}]}"#,
        );
        write(
            &dir,
            "listenbrainz.json",
            r#"{"clients": [{"data": {"token": "t", "username": "u"}}]}"#,
        );
        let config = load(&dir).unwrap();
        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.clients.len(), 1);
        assert_eq!(config.clients[0].kind, "listenbrainz");
        assert_eq!(config.clients[0].name(), "listenbrainz");
    }

    #[test]
    fn unknown_type_is_rejected() {
        let dir = temp_dir("badtype");
        write(&dir, "config.json", r#"{"sources": [{"type": "winamp"}]}"#);
        assert!(matches!(load(&dir), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let dir = temp_dir("dupe");
        write(
            &dir,
            "config.json",
            r#"{"clients": [
                {"type": "listenbrainz", "name": "lb"},
                {"type": "listenbrainz", "name": "lb"}
            ]}"#,
        );
        assert!(matches!(load(&dir), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn options_merge_layers() {
        let defaults: CommonOptions = serde_json::from_str(
            r#"{"scrobbleDelay": 2000, "maxPollRetries": 7}"#,
        )
        .unwrap();
        let entry: CommonOptions = serde_json::from_str(r#"{"scrobbleDelay": 500}"#).unwrap();
        let merged = entry.merged_over(&defaults);
        assert_eq!(merged.scrobble_delay, Some(500));
        assert_eq!(merged.max_poll_retries, Some(7));
    }

    #[test]
    fn creds_files_are_ignored() {
        let dir = temp_dir("creds");
        write(&dir, "currentCreds-lastfm.json", r#"{"sessionKey": "abc"}"#);
        let config = load(&dir).unwrap();
        assert!(config.sources.is_empty());
        assert!(config.clients.is_empty());
    }
}
