//! The per-client worker task: drain the inbox into the sorted queue, work
//! the queue, replay dead letters on a heartbeat, and back off when the
//! upstream is refusing service.

use std::time::Duration;

use async_channel::Receiver;
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::shared::backoff::backoff_delay;
use crate::shared::stop::StopToken;

use super::{ClientCore, QueuedScrobble};

/// How often dead letters are replayed.
pub const DEAD_LETTER_HEARTBEAT: Duration = Duration::from_secs(30);

/// Run a client until stopped, until auth is revoked, or until consecutive
/// show-stoppers exhaust `max_poll_retries`. Returns the core for
/// inspection and graceful teardown.
pub async fn run_worker(
    mut core: ClientCore,
    inbox: Receiver<QueuedScrobble>,
    stop: StopToken,
) -> ClientCore {
    core.set_scrobbling(true);
    info!("[{}] worker started", core.name());

    let scrobble_sleep = core.options().scrobble_sleep;
    let max_retries = core.options().max_poll_retries;
    let multiplier = core.options().retry_multiplier;
    let mut attempt: u32 = 0;
    let mut last_heartbeat: Option<DateTime<Utc>> = None;

    while !stop.is_stopped() {
        while let Ok(queued) = inbox.try_recv() {
            if core.options().accepts_source(&queued.source) {
                core.enqueue(queued).await;
            }
        }

        let mut failed = match core.process_queue(&stop).await {
            Ok(()) => {
                attempt = 0;
                false
            }
            Err(err) if err.is_auth_failure() => {
                error!("[{}] stopping worker, re-auth required: {err}", core.name());
                break;
            }
            Err(err) => {
                attempt += 1;
                if attempt > max_retries {
                    error!(
                        "[{}] giving up after {max_retries} consecutive failures: {err}",
                        core.name()
                    );
                    break;
                }
                warn!(
                    "[{}] queue processing failed (attempt {attempt}/{max_retries}): {err}",
                    core.name()
                );
                true
            }
        };

        let heartbeat_interval = chrono::Duration::from_std(DEAD_LETTER_HEARTBEAT)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let heartbeat_due =
            last_heartbeat.is_none_or(|at| core.clock.now() - at >= heartbeat_interval);
        if !failed && heartbeat_due && !core.dead_letters().is_empty() {
            last_heartbeat = Some(core.clock.now());
            match core.process_dead_letters(&stop).await {
                Ok(()) => {}
                Err(err) if err.is_auth_failure() => {
                    error!("[{}] stopping worker, re-auth required: {err}", core.name());
                    break;
                }
                Err(err) => {
                    warn!("[{}] dead letter processing failed: {err}", core.name());
                    failed = true;
                }
            }
        }

        let sleep = if failed {
            backoff_delay(scrobble_sleep, multiplier, attempt)
        } else {
            scrobble_sleep
        };
        // Wake early when a new play lands.
        let woken = async {
            match inbox.recv().await {
                Ok(queued) => Some(queued),
                Err(_) => None,
            }
        };
        let slept = async {
            smol::Timer::after(sleep).await;
            None
        };
        let stopped = async {
            stop.stopped().await;
            None
        };
        if let Some(queued) = smol::future::or(woken, smol::future::or(slept, stopped)).await {
            if core.options().accepts_source(&queued.source) {
                core.enqueue(queued).await;
            }
        }
    }

    core.set_scrobbling(false);
    info!("[{}] worker stopped", core.name());
    core
}

#[cfg(test)]
mod tests {
    use super::super::testing::{base, core_with, play_at, FakeClient};
    use super::super::{ClientError, ClientOptions};
    use super::*;
    use crate::pipeline::bus::Bus;
    use crate::pipeline::play::Play;
    use std::sync::Arc;
    use std::time::Duration;

    fn options() -> ClientOptions {
        ClientOptions {
            scrobble_sleep: Duration::from_millis(5),
            ..ClientOptions::default()
        }
    }

    fn queued(track: &str, source: &str) -> QueuedScrobble {
        QueuedScrobble::new(source, play_at(track, &["Band"], base()))
    }

    #[test]
    fn worker_scrobbles_incoming_plays_and_stops() {
        smol::block_on(async {
            let (tx, rx) = async_channel::unbounded();
            let (handle, stop) = crate::shared::stop::stop_channel();
            let mut core = core_with(FakeClient::new(), options(), Arc::new(Bus::new()));
            core.initialize().await.unwrap();

            let task = smol::spawn(run_worker(core, rx, stop));
            tx.send(queued("Sonora", "src")).await.unwrap();
            smol::Timer::after(Duration::from_millis(100)).await;
            handle.stop();

            let core = task.await;
            assert!(!core.scrobbling());
            assert_eq!(core.scrobbled().count(), 1);
        });
    }

    #[test]
    fn excluded_sources_are_filtered() {
        smol::block_on(async {
            let (tx, rx) = async_channel::unbounded();
            let (handle, stop) = crate::shared::stop::stop_channel();
            let mut core = core_with(
                FakeClient::new(),
                ClientOptions {
                    exclude_sources: vec!["spotify".into()],
                    ..options()
                },
                Arc::new(Bus::new()),
            );
            core.initialize().await.unwrap();

            let task = smol::spawn(run_worker(core, rx, stop));
            tx.send(queued("From Spotify", "spotify")).await.unwrap();
            tx.send(queued("From Jellyfin", "jellyfin")).await.unwrap();
            smol::Timer::after(Duration::from_millis(100)).await;
            handle.stop();

            let core = task.await;
            let tracks: Vec<String> = core
                .scrobbled()
                .map(|s| s.play.data.track.clone())
                .collect();
            assert_eq!(tracks, vec!["From Jellyfin".to_string()]);
        });
    }

    #[test]
    fn auth_revocation_stops_the_worker() {
        smol::block_on(async {
            let (tx, rx) = async_channel::unbounded();
            let (_handle, stop) = crate::shared::stop::stop_channel();
            let mut adapter = FakeClient::new();
            adapter
                .scrobbles
                .push_back(Err(ClientError::AuthRevoked("expired".into())));
            let mut core = core_with(adapter, options(), Arc::new(Bus::new()));
            core.initialize().await.unwrap();

            let task = smol::spawn(run_worker(core, rx, stop));
            tx.send(queued("Sonora", "src")).await.unwrap();

            // The worker exits on its own; no stop signal needed.
            let core = task.await;
            assert!(!core.scrobbling());
            assert!(!core.ready());
            // The play is still queued for after re-auth.
            assert_eq!(core.queued().count(), 1);
        });
    }

    #[test]
    fn show_stoppers_exhaust_retries_and_stop() {
        smol::block_on(async {
            let (tx, rx) = async_channel::unbounded();
            let (_handle, stop) = crate::shared::stop::stop_channel();
            let mut adapter = FakeClient::new();
            for _ in 0..3 {
                adapter
                    .scrobbles
                    .push_back(Err(ClientError::upstream("always refused", true)));
            }
            let mut core = core_with(
                adapter,
                ClientOptions {
                    scrobble_sleep: Duration::from_millis(1),
                    max_poll_retries: 2,
                    retry_multiplier: 1.0,
                    ..ClientOptions::default()
                },
                Arc::new(Bus::new()),
            );
            core.initialize().await.unwrap();

            let task = smol::spawn(run_worker(core, rx, stop));
            tx.send(queued("Sonora", "src")).await.unwrap();

            let core = task.await;
            // Still queued: the play was never dead-lettered or dropped.
            assert_eq!(core.queued().count(), 1);
            assert_eq!(core.scrobbled().count(), 0);
        });
    }

    #[test]
    fn source_play_is_copied_not_shared() {
        smol::block_on(async {
            // A client receiving a play cannot observe later upstream edits.
            let play: Play = play_at("Original", &["Band"], base());
            let q = QueuedScrobble::new("src", play.clone());
            let mut upstream = play;
            upstream.data.track = "Mutated".into();
            assert_eq!(q.play.data.track, "Original");
        });
    }
}
