//! Process-wide in-memory event broker, keyed by run id.
//!
//! Publish is lock-protected but never blocks: each run gets its own
//! `tokio::sync::broadcast` channel, whose bounded ring buffer silently
//! drops the oldest entry for subscribers that fall behind instead of
//! back-pressuring the publisher.

use futures_util::stream::{self, Stream};
use orc_core::{BrokerEvent, Id};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

/// Per-subscriber buffer depth (Section 4.1).
const SUBSCRIBER_BUFFER: usize = 256;

#[derive(Debug, Default)]
pub struct Broker {
    channels: Mutex<HashMap<Id, broadcast::Sender<BrokerEvent>>>,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_for(&self, run_id: &Id) -> broadcast::Sender<BrokerEvent> {
        let mut channels = self.channels.lock().expect("broker mutex poisoned");
        channels
            .entry(run_id.clone())
            .or_insert_with(|| broadcast::channel(SUBSCRIBER_BUFFER).0)
            .clone()
    }

    /// Publish an event for `run_id`. Never blocks; if there are no
    /// subscribers the event is simply dropped.
    pub fn publish(&self, run_id: &Id, event: BrokerEvent) {
        let closes = event.closes_stream();
        let sender = self.sender_for(run_id);
        // `send` only fails when there are no receivers, which is not an error here.
        let _ = sender.send(event);
        if closes {
            self.prune(run_id);
        }
    }

    /// Drop the channel table entry for a run once it has gone terminal and
    /// has no live subscribers, so the map does not grow across many
    /// finished runs.
    fn prune(&self, run_id: &Id) {
        let mut channels = self.channels.lock().expect("broker mutex poisoned");
        if let Some(sender) = channels.get(run_id) {
            if sender.receiver_count() == 0 {
                channels.remove(run_id);
            }
        }
    }

    /// Subscribe to live events for `run_id`. The returned stream yields
    /// events in publish order and ends naturally once a terminal `status`
    /// event has been delivered, or once the subscriber is dropped.
    pub fn subscribe(&self, run_id: &Id) -> impl Stream<Item = BrokerEvent> {
        let receiver = self.sender_for(run_id).subscribe();
        stream::unfold(Some(receiver), |state| async move {
            let mut receiver = state?;
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        let next_state = if event.closes_stream() {
                            None
                        } else {
                            Some(receiver)
                        };
                        return Some((event, next_state));
                    }
                    // A slow subscriber drops the oldest buffered events
                    // rather than stalling the publisher; keep reading.
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
    }
}
