//! Dead-letter replay. Each heartbeat walks the failed scrobbles oldest
//! listen first and pushes them back through the same checks and adapter
//! call as the main queue.

use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::shared::stop::StopToken;

use super::{ClientCore, ClientError};

/// Pause between consecutive replay attempts.
const RETRY_SLEEP: Duration = Duration::from_secs(1);

impl ClientCore {
    /// Replay every dead letter still under the retry limit. Entries that
    /// hit the limit stay visible but are never retried again automatically.
    pub async fn process_dead_letters(&mut self, stop: &StopToken) -> Result<(), ClientError> {
        let max_retries = self.options().dead_letter_retries;
        let mut pending: Vec<Uuid> = {
            let mut entries: Vec<_> = self
                .dead_letters()
                .iter()
                .filter(|d| d.retries < max_retries)
                .map(|d| (d.queued.play.data.play_date, d.queued.id))
                .collect();
            entries.sort_by_key(|(play_date, _)| *play_date);
            entries.into_iter().map(|(_, id)| id).collect()
        };

        if pending.is_empty() {
            return Ok(());
        }
        debug!(
            "[{}] retrying {} dead-lettered scrobbles",
            self.name(),
            pending.len()
        );

        let mut first = true;
        for id in pending.drain(..) {
            if stop.is_stopped() {
                break;
            }
            if !first && !stop.sleep(RETRY_SLEEP).await {
                break;
            }
            first = false;
            self.retry_dead_letter(id).await?;
        }
        Ok(())
    }

    async fn retry_dead_letter(&mut self, id: Uuid) -> Result<(), ClientError> {
        let Some(entry) = self.dead_letters.iter().find(|d| d.queued.id == id).cloned() else {
            return Ok(());
        };
        let play = entry.queued.play.clone();

        if !self.timeframe_valid(&play) {
            info!(
                "[{}] dead letter fell outside the upstream window, dropping: {}",
                self.name(),
                play.describe()
            );
            self.remove_dead_letter(id);
            return Ok(());
        }
        if self.already_scrobbled(&play) {
            debug!(
                "[{}] dead letter already scrobbled elsewhere, dropping: {}",
                self.name(),
                play.describe()
            );
            self.remove_dead_letter(id);
            return Ok(());
        }

        match self.attempt_scrobble(&play).await {
            Ok(()) => {
                self.remove_dead_letter(id);
                Ok(())
            }
            Err(err) if err.is_auth_failure() => {
                self.deauth();
                Err(err)
            }
            Err(err) => {
                warn!(
                    "[{}] dead letter retry failed ({}/{}): {err}",
                    self.name(),
                    entry.retries + 1,
                    self.options().dead_letter_retries
                );
                let now = self.clock.now();
                if let Some(entry) = self.dead_letters.iter_mut().find(|d| d.queued.id == id) {
                    entry.retries += 1;
                    entry.error = err.to_string();
                    entry.last_retry = Some(now);
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{base, core_with, play_at, FakeClient};
    use super::super::{ClientOptions, QueuedScrobble};
    use super::*;
    use crate::pipeline::bus::Bus;
    use chrono::Duration as ChronoDuration;
    use std::sync::Arc;

    fn options(dead_letter_retries: u32) -> ClientOptions {
        ClientOptions {
            dead_letter_retries,
            ..ClientOptions::default()
        }
    }

    #[test]
    fn failed_scrobble_recovers_on_next_heartbeat() {
        smol::block_on(async {
            let (_h, stop) = crate::shared::stop::stop_channel();
            let mut adapter = FakeClient::new();
            adapter
                .scrobbles
                .push_back(Err(ClientError::upstream("temporary 503", false)));
            let mut core = core_with(adapter, options(3), Arc::new(Bus::new()));
            core.initialize().await.unwrap();

            core.enqueue(QueuedScrobble::new(
                "src",
                play_at("Sonora", &["The Bongo Hop"], base()),
            ))
            .await;
            core.process_queue(&stop).await.unwrap();
            assert_eq!(core.dead_letters().len(), 1);
            assert_eq!(core.dead_letters()[0].retries, 0);

            // Next heartbeat: the adapter works again.
            core.process_dead_letters(&stop).await.unwrap();
            assert!(core.dead_letters().is_empty());
            assert_eq!(core.scrobbled().count(), 1);
        });
    }

    #[test]
    fn retries_cap_and_entry_stays_visible() {
        smol::block_on(async {
            let (_h, stop) = crate::shared::stop::stop_channel();
            let mut adapter = FakeClient::new();
            for _ in 0..5 {
                adapter
                    .scrobbles
                    .push_back(Err(ClientError::upstream("still down", false)));
            }
            let mut core = core_with(adapter, options(2), Arc::new(Bus::new()));
            core.initialize().await.unwrap();

            core.enqueue(QueuedScrobble::new(
                "src",
                play_at("Sonora", &["The Bongo Hop"], base()),
            ))
            .await;
            core.process_queue(&stop).await.unwrap();

            for _ in 0..4 {
                core.process_dead_letters(&stop).await.unwrap();
            }
            assert_eq!(core.dead_letters().len(), 1);
            let entry = &core.dead_letters()[0];
            assert_eq!(entry.retries, 2);
            assert!(entry.last_retry.is_some());
            assert_eq!(entry.error, "upstream error: still down");
            // Two queue attempts happened in total: initial + 2 retries.
            assert_eq!(core.scrobbled().count(), 0);
        });
    }

    #[test]
    fn oldest_play_retries_first() {
        smol::block_on(async {
            let (_h, stop) = crate::shared::stop::stop_channel();
            let mut adapter = FakeClient::new();
            for _ in 0..2 {
                adapter
                    .scrobbles
                    .push_back(Err(ClientError::upstream("down", false)));
            }
            let mut core = core_with(adapter, options(3), Arc::new(Bus::new()));
            core.initialize().await.unwrap();

            // Enqueue newer first so the dead-letter list is out of order.
            core.enqueue(QueuedScrobble::new(
                "src",
                play_at("Newer", &["Band"], base() + ChronoDuration::hours(1)),
            ))
            .await;
            core.enqueue(QueuedScrobble::new(
                "src",
                play_at("Older", &["Band"], base()),
            ))
            .await;
            core.process_queue(&stop).await.unwrap();
            assert_eq!(core.dead_letters().len(), 2);

            // Both succeed now; the replay order is by listen time.
            core.process_dead_letters(&stop).await.unwrap();
            let scrobbled: Vec<_> = core
                .scrobbled()
                .map(|s| s.play.data.track.clone())
                .collect();
            assert_eq!(scrobbled, vec!["Older", "Newer"]);
        });
    }

    #[test]
    fn manual_removal_works() {
        smol::block_on(async {
            let (_h, stop) = crate::shared::stop::stop_channel();
            let mut adapter = FakeClient::new();
            adapter
                .scrobbles
                .push_back(Err(ClientError::upstream("down", false)));
            let mut core = core_with(adapter, options(3), Arc::new(Bus::new()));
            core.initialize().await.unwrap();
            core.enqueue(QueuedScrobble::new(
                "src",
                play_at("Sonora", &["The Bongo Hop"], base()),
            ))
            .await;
            core.process_queue(&stop).await.unwrap();

            let id = core.dead_letters()[0].queued.id;
            assert!(core.remove_dead_letter(id));
            assert!(core.dead_letters().is_empty());
            assert!(!core.remove_dead_letter(id));
        });
    }
}
