//! Stability guard for sources whose upstream history is a scraped,
//! occasionally reshuffled list. A tick whose diff is not a coherent prepend
//! marks the list unstable; emission resumes only after enough consecutive
//! clean ticks, trading a possibly missed play for no spurious duplicates.

use tracing::{debug, warn};

use crate::pipeline::normalize::{normalize_artist, normalize_title};
use crate::pipeline::play::Play;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Fingerprint(String);

fn fingerprint(play: &Play) -> Fingerprint {
    if let Some(id) = &play.meta.track_id {
        return Fingerprint(format!("id:{id}"));
    }
    Fingerprint(format!(
        "{}|{}",
        normalize_title(&play.data.track),
        play.primary_artist().map(normalize_artist).unwrap_or_default()
    ))
}

pub struct HistoryGuard {
    prev: Vec<Fingerprint>,
    /// Consecutive coherent ticks, including the current one.
    ok_streak: u32,
    /// The N in "N+1 consecutive OK ticks before emission".
    stable_after: u32,
}

impl HistoryGuard {
    pub fn new(stable_after: u32) -> Self {
        HistoryGuard {
            prev: Vec::new(),
            ok_streak: 0,
            stable_after,
        }
    }

    pub fn is_stable(&self) -> bool {
        self.ok_streak >= self.stable_after + 1
    }

    /// Observe this tick's list (newest first). Returns the plays that are
    /// safe to treat as newly discovered.
    pub fn observe(&mut self, list: &[Play]) -> Vec<Play> {
        let fingerprints: Vec<Fingerprint> = list.iter().map(fingerprint).collect();

        if self.prev.is_empty() {
            // First sighting seeds the baseline; nothing is new yet.
            self.prev = fingerprints;
            self.ok_streak = 1;
            return Vec::new();
        }

        let new_count = match coherent_prepend_len(&self.prev, &fingerprints) {
            Some(count) => count,
            None => {
                warn!("history list diff is inconsistent, suppressing this tick");
                self.ok_streak = 0;
                self.prev = fingerprints;
                return Vec::new();
            }
        };

        self.ok_streak += 1;
        self.prev = fingerprints;

        if !self.is_stable() {
            if new_count > 0 {
                debug!(
                    "history list not yet stable ({}/{} ticks), holding {new_count} plays",
                    self.ok_streak,
                    self.stable_after + 1
                );
            }
            return Vec::new();
        }
        list[..new_count].to_vec()
    }
}

/// Number of entries prepended to `prev` in `next`, or `None` when `next` is
/// not `prev` with items prepended (and possibly truncated at the tail).
fn coherent_prepend_len(prev: &[Fingerprint], next: &[Fingerprint]) -> Option<usize> {
    let Some(idx) = next.iter().position(|fp| *fp == prev[0]) else {
        // The previous head fell off entirely; only coherent when the whole
        // window rolled over, which is indistinguishable from a reshuffle.
        return None;
    };
    let overlap = (next.len() - idx).min(prev.len());
    if next[idx..idx + overlap] != prev[..overlap] {
        return None;
    }
    // A "new" entry that was already somewhere in the old list means the
    // list was reordered, not prepended to.
    if next[..idx].iter().any(|fp| prev.contains(fp)) {
        return None;
    }
    Some(idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn play(track: &str) -> Play {
        let mut p = Play::new(
            track,
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + Duration::minutes(1),
        );
        p.data.artists = vec!["Band".to_string()];
        p
    }

    fn list(tracks: &[&str]) -> Vec<Play> {
        tracks.iter().map(|t| play(t)).collect()
    }

    #[test]
    fn first_tick_seeds_without_emitting() {
        let mut guard = HistoryGuard::new(1);
        assert!(guard.observe(&list(&["a", "b", "c"])).is_empty());
    }

    #[test]
    fn stable_prepends_are_emitted() {
        let mut guard = HistoryGuard::new(1);
        guard.observe(&list(&["a", "b", "c"]));
        // Second coherent tick reaches N+1 = 2.
        let emitted = guard.observe(&list(&["new", "a", "b", "c"]));
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].data.track, "new");
    }

    #[test]
    fn unchanged_list_emits_nothing() {
        let mut guard = HistoryGuard::new(1);
        guard.observe(&list(&["a", "b", "c"]));
        assert!(guard.observe(&list(&["a", "b", "c"])).is_empty());
    }

    #[test]
    fn reshuffle_suppresses_and_recovery_takes_two_ticks() {
        let mut guard = HistoryGuard::new(1);
        // tick 1: ok (seed)
        guard.observe(&list(&["a", "b", "c"]));
        // tick 2: reordered inconsistently; its prepend is suppressed.
        let emitted = guard.observe(&list(&["x", "c", "a", "b"]));
        assert!(emitted.is_empty());
        assert!(!guard.is_stable());
        // tick 3: coherent again, but only the first OK tick.
        let emitted = guard.observe(&list(&["x", "c", "a", "b"]));
        assert!(emitted.is_empty());
        // tick 4: second consecutive OK tick; new prepends flow again.
        let emitted = guard.observe(&list(&["y", "x", "c", "a", "b"]));
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].data.track, "y");
    }

    #[test]
    fn tail_truncation_is_coherent() {
        let mut guard = HistoryGuard::new(1);
        guard.observe(&list(&["a", "b", "c"]));
        // Window slides: one new entry, oldest dropped.
        let emitted = guard.observe(&list(&["new", "a", "b"]));
        assert_eq!(emitted.len(), 1);
    }

    #[test]
    fn track_ids_beat_title_fingerprints() {
        let mut guard = HistoryGuard::new(0);
        let mut a = play("Same Title");
        a.meta.track_id = Some("id-1".into());
        let mut b = play("Same Title");
        b.meta.track_id = Some("id-2".into());
        guard.observe(&[a.clone()]);
        let emitted = guard.observe(&[b.clone(), a]);
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].meta.track_id.as_deref(), Some("id-2"));
    }
}
