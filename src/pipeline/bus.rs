//! In-process pub/sub connecting sources to clients and surfacing status to
//! observers. Subscribers receive their own copy of each event; nothing on
//! the bus aliases a component's private buffers.

use async_channel::{Receiver, Sender};
use async_lock::Mutex;
use serde::Serialize;

use super::play::Play;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ComponentKind {
    Source,
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    NewPlay,
    Scrobble,
    ScrobbleQueued,
    ScrobbleDequeued,
    DeadLetter,
    StatusChange,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BusEvent {
    pub kind: EventKind,
    /// Component name the event originated from.
    pub name: String,
    pub from: ComponentKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub play: Option<Play>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl BusEvent {
    pub fn new(kind: EventKind, name: impl Into<String>, from: ComponentKind) -> Self {
        BusEvent {
            kind,
            name: name.into(),
            from,
            play: None,
            detail: None,
        }
    }

    pub fn with_play(mut self, play: Play) -> Self {
        self.play = Some(play);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Fan-out bus. Publishing clones the event into every live subscriber
/// channel; subscribers that dropped their receiver are pruned on the next
/// publish. Delivery order from a single publisher is the channel order.
#[derive(Default)]
pub struct Bus {
    subscribers: Mutex<Vec<Sender<BusEvent>>>,
}

impl Bus {
    pub fn new() -> Self {
        Bus::default()
    }

    pub async fn subscribe(&self) -> Receiver<BusEvent> {
        let (tx, rx) = async_channel::unbounded();
        self.subscribers.lock().await.push(tx);
        rx
    }

    pub async fn publish(&self, event: BusEvent) {
        let mut subscribers = self.subscribers.lock().await;
        subscribers.retain(|tx| tx.try_send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn fan_out_reaches_every_subscriber() {
        smol::block_on(async {
            let bus = Bus::new();
            let a = bus.subscribe().await;
            let b = bus.subscribe().await;

            bus.publish(
                BusEvent::new(EventKind::NewPlay, "spotify", ComponentKind::Source)
                    .with_play(Play::new("Sonora", Utc::now())),
            )
            .await;

            assert_eq!(a.recv().await.unwrap().kind, EventKind::NewPlay);
            assert_eq!(b.recv().await.unwrap().kind, EventKind::NewPlay);
        });
    }

    #[test]
    fn subscribers_receive_copies() {
        smol::block_on(async {
            let bus = Bus::new();
            let rx = bus.subscribe().await;

            let play = Play::new("Sonora", Utc::now());
            bus.publish(
                BusEvent::new(EventKind::NewPlay, "spotify", ComponentKind::Source)
                    .with_play(play.clone()),
            )
            .await;

            let mut received = rx.recv().await.unwrap().play.unwrap();
            received.data.track = "Mutated".to_string();
            assert_eq!(play.data.track, "Sonora");
        });
    }

    #[test]
    fn dropped_subscriber_is_pruned() {
        smol::block_on(async {
            let bus = Bus::new();
            let rx = bus.subscribe().await;
            drop(rx);

            bus.publish(BusEvent::new(
                EventKind::StatusChange,
                "x",
                ComponentKind::Client,
            ))
            .await;
            assert!(bus.subscribers.lock().await.is_empty());
        });
    }

    #[test]
    fn per_publisher_order_is_preserved() {
        smol::block_on(async {
            let bus = Bus::new();
            let rx = bus.subscribe().await;
            for kind in [
                EventKind::ScrobbleQueued,
                EventKind::Scrobble,
                EventKind::ScrobbleDequeued,
            ] {
                bus.publish(BusEvent::new(kind, "c", ComponentKind::Client)).await;
            }
            assert_eq!(rx.recv().await.unwrap().kind, EventKind::ScrobbleQueued);
            assert_eq!(rx.recv().await.unwrap().kind, EventKind::Scrobble);
            assert_eq!(rx.recv().await.unwrap().kind, EventKind::ScrobbleDequeued);
        });
    }
}
