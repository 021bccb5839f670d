//! The play-transform engine. Transform configuration is compiled once when a
//! component initializes; applying a stage to a play is pure string work with
//! no config interpretation left on the hot path.

pub mod matcher;
pub mod rules;

use std::fmt;

use thiserror::Error;
use tracing::info;

use self::matcher::Matcher;
use self::rules::{
    HookConfig, LogConfig, PlayTransformConfig, RuleConfig, WhenClauseConfig,
};
use super::play::Play;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("invalid transform pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        source: regex::Error,
    },
    #[error("unsupported regex flag `{flag}` in `{pattern}`")]
    InvalidFlag { pattern: String, flag: char },
    #[error("transform removed every artist")]
    NoArtistsLeft,
    #[error("transform removed the track title")]
    NoTitleLeft,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformStage {
    PreCompare,
    CompareCandidate,
    CompareExisting,
    PostCompare,
}

impl fmt::Display for TransformStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransformStage::PreCompare => "preCompare",
            TransformStage::CompareCandidate => "compare.candidate",
            TransformStage::CompareExisting => "compare.existing",
            TransformStage::PostCompare => "postCompare",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
struct WhenClause {
    artist: Option<Matcher>,
    album: Option<Matcher>,
    title: Option<Matcher>,
}

impl WhenClause {
    fn compile(cfg: &WhenClauseConfig) -> Result<Self, TransformError> {
        Ok(WhenClause {
            artist: cfg.artist.as_deref().map(Matcher::parse).transpose()?,
            album: cfg.album.as_deref().map(Matcher::parse).transpose()?,
            title: cfg.title.as_deref().map(Matcher::parse).transpose()?,
        })
    }

    /// All present fields must match.
    fn matches(&self, play: &Play) -> bool {
        if let Some(artist) = &self.artist {
            if !play.data.artists.iter().any(|a| artist.is_match(a)) {
                return false;
            }
        }
        if let Some(album) = &self.album {
            match &play.data.album {
                Some(a) if album.is_match(a) => {}
                _ => return false,
            }
        }
        if let Some(title) = &self.title {
            if !title.is_match(&play.data.track) {
                return false;
            }
        }
        true
    }
}

/// OR across clauses; an empty list means unconditional.
fn when_allows(clauses: &[WhenClause], play: &Play) -> bool {
    clauses.is_empty() || clauses.iter().any(|c| c.matches(play))
}

#[derive(Debug, Clone)]
struct Rule {
    search: Matcher,
    replace: String,
    when: Vec<WhenClause>,
}

impl Rule {
    fn compile(cfg: &RuleConfig) -> Result<Self, TransformError> {
        match cfg {
            RuleConfig::Remove(search) => Ok(Rule {
                search: Matcher::parse(search)?,
                replace: String::new(),
                when: Vec::new(),
            }),
            RuleConfig::Replace {
                search,
                replace,
                when,
            } => Ok(Rule {
                search: Matcher::parse(search)?,
                replace: replace.clone(),
                when: compile_clauses(when.as_deref())?,
            }),
        }
    }

    fn apply(&self, value: &str, play: &Play) -> String {
        if !when_allows(&self.when, play) {
            return value.to_string();
        }
        self.search.replace_all(value, &self.replace)
    }
}

fn compile_clauses(cfg: Option<&[WhenClauseConfig]>) -> Result<Vec<WhenClause>, TransformError> {
    cfg.unwrap_or_default()
        .iter()
        .map(WhenClause::compile)
        .collect()
}

#[derive(Debug, Clone)]
struct Hook {
    when: Vec<WhenClause>,
    title: Vec<Rule>,
    artists: Vec<Rule>,
    album: Vec<Rule>,
}

impl Hook {
    fn compile(cfg: &HookConfig) -> Result<Self, TransformError> {
        let compile_rules = |rules: Option<&Vec<RuleConfig>>| {
            rules
                .map(|r| r.iter().map(Rule::compile).collect::<Result<Vec<_>, _>>())
                .transpose()
                .map(Option::unwrap_or_default)
        };
        Ok(Hook {
            when: compile_clauses(cfg.when.as_deref())?,
            title: compile_rules(cfg.title.as_ref())?,
            artists: compile_rules(cfg.artists.as_ref())?,
            album: compile_rules(cfg.album.as_ref())?,
        })
    }

    fn apply(&self, play: &mut Play) {
        if !when_allows(&self.when, play) {
            return;
        }
        // Rules see the play as it stood when the hook started, so a rule
        // rewriting the title does not change what a sibling `when` observes.
        let snapshot = play.clone();

        for rule in &self.title {
            play.data.track = rule.apply(&play.data.track, &snapshot);
        }
        for rule in &self.album {
            if let Some(album) = play.data.album.take() {
                play.data.album = Some(rule.apply(&album, &snapshot));
            }
        }
        // Artist rules run against each artist independently; an artist
        // reduced to nothing is removed afterwards by prune_empty.
        for rule in &self.artists {
            for artist in play.data.artists.iter_mut() {
                *artist = rule.apply(artist, &snapshot);
            }
        }

        trim_fields(play);
    }
}

fn trim_fields(play: &mut Play) {
    play.data.track = play.data.track.trim().to_string();
    if let Some(album) = &play.data.album {
        play.data.album = Some(album.trim().to_string());
    }
    for artist in play.data.artists.iter_mut() {
        *artist = artist.trim().to_string();
    }
}

/// All hooks for one component, compiled and ready to run.
#[derive(Debug, Clone, Default)]
pub struct TransformSet {
    pre: Vec<Hook>,
    compare_candidate: Vec<Hook>,
    compare_existing: Vec<Hook>,
    post: Vec<Hook>,
    log: LogConfig,
}

impl TransformSet {
    pub fn compile(cfg: Option<&PlayTransformConfig>) -> Result<Self, TransformError> {
        let Some(cfg) = cfg else {
            return Ok(TransformSet::default());
        };
        let compile_stage = |hooks: Option<&rules::OneOrMany<HookConfig>>| {
            hooks
                .cloned()
                .map(|h| {
                    h.into_vec()
                        .iter()
                        .map(Hook::compile)
                        .collect::<Result<Vec<_>, _>>()
                })
                .transpose()
                .map(Option::unwrap_or_default)
        };

        Ok(TransformSet {
            pre: compile_stage(cfg.pre_compare.as_ref())?,
            compare_candidate: compile_stage(
                cfg.compare.as_ref().and_then(|c| c.candidate.as_ref()),
            )?,
            compare_existing: compile_stage(
                cfg.compare.as_ref().and_then(|c| c.existing.as_ref()),
            )?,
            post: compile_stage(cfg.post_compare.as_ref())?,
            log: cfg.log,
        })
    }

    fn hooks(&self, stage: TransformStage) -> &[Hook] {
        match stage {
            TransformStage::PreCompare => &self.pre,
            TransformStage::CompareCandidate => &self.compare_candidate,
            TransformStage::CompareExisting => &self.compare_existing,
            TransformStage::PostCompare => &self.post,
        }
    }

    /// Run one stage over a play, returning the transformed copy. The input
    /// play is never mutated. Fails when the stage strips the play of every
    /// artist or of its title, which callers treat as a drop signal.
    pub fn apply(
        &self,
        stage: TransformStage,
        play: &Play,
        owner: &str,
    ) -> Result<Play, TransformError> {
        let hooks = self.hooks(stage);
        if hooks.is_empty() {
            return Ok(play.clone());
        }

        let log = self.log;
        let mut work = play.clone();
        for hook in hooks {
            let before_hook = work.clone();
            hook.apply(&mut work);
            if log == LogConfig::EveryHook && work != before_hook {
                info!(
                    "[{owner}] {stage} hook: {} -> {}",
                    before_hook.describe(),
                    work.describe()
                );
            }
        }

        work.prune_empty();
        if work.data.artists.is_empty() && !play.data.artists.is_empty() {
            return Err(TransformError::NoArtistsLeft);
        }
        if work.data.track.is_empty() {
            return Err(TransformError::NoTitleLeft);
        }

        if log == LogConfig::Summary && work != *play {
            info!(
                "[{owner}] {stage} transform: {} -> {}",
                play.describe(),
                work.describe()
            );
        }
        Ok(work)
    }
}
