//! The `playTransform` configuration shape. These types mirror the JSON the
//! user writes; `TransformSet::compile` normalizes them into the rule tree
//! the hot path walks, so none of this flexibility is interpreted per play.

use serde::Deserialize;

/// Accepts `X` or `[X, ...]` wherever the config allows either.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(v) => vec![v],
            OneOrMany::Many(v) => v,
        }
    }
}

impl<T> Default for OneOrMany<T> {
    fn default() -> Self {
        OneOrMany::Many(Vec::new())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayTransformConfig {
    #[serde(default)]
    pub pre_compare: Option<OneOrMany<HookConfig>>,
    #[serde(default)]
    pub compare: Option<CompareHooksConfig>,
    #[serde(default)]
    pub post_compare: Option<OneOrMany<HookConfig>>,
    #[serde(default)]
    pub log: LogConfig,
}

/// Hooks whose mutations are visible only to the comparator.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompareHooksConfig {
    #[serde(default)]
    pub candidate: Option<OneOrMany<HookConfig>>,
    #[serde(default)]
    pub existing: Option<OneOrMany<HookConfig>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HookConfig {
    /// OR across clauses; within a clause all present fields must match.
    #[serde(default)]
    pub when: Option<Vec<WhenClauseConfig>>,
    #[serde(default)]
    pub title: Option<Vec<RuleConfig>>,
    #[serde(default)]
    pub artists: Option<Vec<RuleConfig>>,
    #[serde(default)]
    pub album: Option<Vec<RuleConfig>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WhenClauseConfig {
    #[serde(default)]
    pub artist: Option<String>,
    #[serde(default)]
    pub album: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

/// A plain string removes every match; the object form substitutes.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RuleConfig {
    Remove(String),
    Replace {
        search: String,
        replace: String,
        #[serde(default)]
        when: Option<Vec<WhenClauseConfig>>,
    },
}

/// `log: false | true | "all"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "LogConfigRaw")]
pub enum LogConfig {
    Off,
    /// One before/after diff per stage invocation.
    Summary,
    /// One diff per hook in an array.
    EveryHook,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig::Off
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LogConfigRaw {
    Flag(bool),
    Mode(String),
}

impl TryFrom<LogConfigRaw> for LogConfig {
    type Error = String;

    fn try_from(raw: LogConfigRaw) -> Result<Self, Self::Error> {
        match raw {
            LogConfigRaw::Flag(false) => Ok(LogConfig::Off),
            LogConfigRaw::Flag(true) => Ok(LogConfig::Summary),
            LogConfigRaw::Mode(s) if s == "all" => Ok(LogConfig::EveryHook),
            LogConfigRaw::Mode(other) => Err(format!("unknown transform log mode `{other}`")),
        }
    }
}
