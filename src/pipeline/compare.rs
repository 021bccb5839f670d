//! Weighted fuzzy matching between two plays. Used by source discovery dedup
//! and by the client-side existing-scrobble check.

use strsim::normalized_levenshtein;

use super::normalize::{normalize_artist, normalize_title};
use super::play::Play;

pub const ARTIST_WEIGHT: f64 = 0.3;
pub const TITLE_WEIGHT: f64 = 0.4;
pub const TIME_WEIGHT: f64 = 0.3;

/// Combined score at or above this is a duplicate.
pub const DUP_SCORE_THRESHOLD: f64 = 0.8;

/// Tunable temporal tolerances. CLOSE catches clock drift between services;
/// FUZZY catches one service stamping a play at track start while another
/// stamps it at track end, a skew as large as the track itself.
pub const CLOSE_SECONDS: i64 = 10;
pub const FUZZY_SECONDS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemporalAccuracy {
    Exact,
    Close,
    Fuzzy,
    NoMatch,
}

impl TemporalAccuracy {
    pub fn score(self) -> f64 {
        match self {
            TemporalAccuracy::Exact | TemporalAccuracy::Close => 1.0,
            TemporalAccuracy::Fuzzy => 0.6,
            TemporalAccuracy::NoMatch => 0.0,
        }
    }
}

pub fn temporal_accuracy(a: &Play, b: &Play) -> TemporalAccuracy {
    let diff = (a.data.play_date - b.data.play_date).num_seconds().abs();
    if diff == 0 {
        TemporalAccuracy::Exact
    } else if diff <= CLOSE_SECONDS {
        TemporalAccuracy::Close
    } else if diff <= FUZZY_SECONDS {
        TemporalAccuracy::Fuzzy
    } else {
        TemporalAccuracy::NoMatch
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArtistMatch {
    /// Set similarity in [0, 1].
    pub score: f64,
    /// Pairs that were equal after normalization.
    pub whole_matches: usize,
}

/// Similarity of two artist sets: a greedy maximum-weight pairing of
/// normalized artist strings, scored against the larger set so missing
/// artists count against the match.
pub fn artist_similarity(a: &[String], b: &[String]) -> ArtistMatch {
    if a.is_empty() || b.is_empty() {
        return ArtistMatch {
            score: 0.0,
            whole_matches: 0,
        };
    }

    let norm_a: Vec<String> = a.iter().map(|s| normalize_artist(s)).collect();
    let norm_b: Vec<String> = b.iter().map(|s| normalize_artist(s)).collect();

    let mut pairs: Vec<(usize, usize, f64)> = Vec::with_capacity(norm_a.len() * norm_b.len());
    for (i, left) in norm_a.iter().enumerate() {
        for (j, right) in norm_b.iter().enumerate() {
            pairs.push((i, j, normalized_levenshtein(left, right)));
        }
    }
    pairs.sort_by(|x, y| y.2.total_cmp(&x.2));

    let mut used_a = vec![false; norm_a.len()];
    let mut used_b = vec![false; norm_b.len()];
    let mut sum = 0.0;
    let mut whole_matches = 0;
    for (i, j, sim) in pairs {
        if used_a[i] || used_b[j] {
            continue;
        }
        used_a[i] = true;
        used_b[j] = true;
        sum += sim;
        if norm_a[i] == norm_b[j] {
            whole_matches += 1;
        }
    }

    ArtistMatch {
        score: sum / norm_a.len().max(norm_b.len()) as f64,
        whole_matches,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlayComparison {
    pub title: f64,
    pub artist: f64,
    pub time: f64,
    /// Weighted total in [0, 1], bonus applied.
    pub score: f64,
}

impl PlayComparison {
    pub fn is_duplicate(&self) -> bool {
        self.score >= DUP_SCORE_THRESHOLD
    }
}

/// Score two plays. Symmetric up to the multi-artist bonus, which may raise
/// the score when one side reports only the primary artist of a
/// multi-artist track.
pub fn compare_plays(a: &Play, b: &Play) -> PlayComparison {
    let title = normalized_levenshtein(
        &normalize_title(&a.data.track),
        &normalize_title(&b.data.track),
    );
    let artists = artist_similarity(&a.data.artists, &b.data.artists);
    let time = temporal_accuracy(a, b).score();

    let mut score =
        TITLE_WEIGHT * title + ARTIST_WEIGHT * artists.score + TIME_WEIGHT * time;

    let multi_artist = a.data.artists.len() + b.data.artists.len() > 2;
    if score < 1.0
        && time > 0.0
        && title > 0.98
        && artists.score > 0.1
        && artists.whole_matches > 0
        && multi_artist
    {
        let bonus = (artists.score * 0.5)
            .max((1.0 - artists.score) * 0.75)
            .max(0.1);
        score = TITLE_WEIGHT * title
            + TIME_WEIGHT * time
            + (ARTIST_WEIGHT + 0.05) * (artists.score + bonus);
    }

    PlayComparison {
        title,
        artist: artists.score,
        time,
        score: score.min(1.0),
    }
}

/// Best-scoring play from `candidates`, ties broken by most recent play date.
pub fn closest_match<'a, I>(play: &Play, candidates: I) -> Option<(&'a Play, PlayComparison)>
where
    I: IntoIterator<Item = &'a Play>,
{
    let mut best: Option<(&'a Play, PlayComparison)> = None;
    for candidate in candidates {
        let cmp = compare_plays(play, candidate);
        let better = match &best {
            None => true,
            Some((existing, best_cmp)) => {
                cmp.score > best_cmp.score
                    || (cmp.score == best_cmp.score
                        && candidate.data.play_date > existing.data.play_date)
            }
        };
        if better {
            best = Some((candidate, cmp));
        }
    }
    best
}
