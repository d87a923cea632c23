//! Merges the ego updates of several front-end peers into one tick.

use crate::communication::messages::{Message, MessageBody};
use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

pub struct PeerAggregator<P> {
    incoming: mpsc::UnboundedReceiver<(P, Message)>,
    deferred: VecDeque<(P, Message)>,
    peers: usize,
    window: Duration,
}

impl<P: Eq + Hash + Clone> PeerAggregator<P> {
    pub fn new(incoming: mpsc::UnboundedReceiver<(P, Message)>, peers: usize, window: Duration) -> Self {
        PeerAggregator {
            incoming,
            deferred: VecDeque::new(),
            peers: peers.max(1),
            window,
        }
    }

    /// Wait for the next tick and return its merged vehicle message.
    ///
    /// Blocks until the first peer reports, then waits at most `window` for
    /// the others. A second message of the same peer goes to the next tick.
    /// Returns `None` once every sender is gone and nothing is left.
    pub async fn next_message(&mut self) -> Option<Message> {
        let (first_peer, first) = match self.deferred.pop_front() {
            Some(pending) => pending,
            None => self.incoming.recv().await?,
        };
        let mut merged = match first.body {
            MessageBody::Vehicle(vehicle) => vehicle,
            body => return Some(Message { id: first.id, body }),
        };
        let mut seen = HashSet::from([first_peer]);

        let mut later = VecDeque::new();
        while let Some((peer, message)) = self.deferred.pop_front() {
            match message.body {
                MessageBody::Vehicle(vehicle) if seen.len() < self.peers && !seen.contains(&peer) => {
                    merged.commands.extend(vehicle.commands);
                    seen.insert(peer);
                }
                body => later.push_back((peer, Message { id: message.id, body })),
            }
        }
        self.deferred = later;

        let deadline = Instant::now() + self.window;
        while seen.len() < self.peers {
            match tokio::time::timeout_at(deadline, self.incoming.recv()).await {
                Ok(Some((peer, message))) => match message.body {
                    MessageBody::Vehicle(vehicle) if !seen.contains(&peer) => {
                        merged.commands.extend(vehicle.commands);
                        seen.insert(peer);
                    }
                    body => self.deferred.push_back((peer, Message { id: message.id, body })),
                },
                Ok(None) => break,
                Err(_) => {
                    log::debug!(
                        "Aggregation window closed with {} of {} peers",
                        seen.len(),
                        self.peers
                    );
                    break;
                }
            }
        }

        Some(Message {
            id: first.id,
            body: MessageBody::Vehicle(merged),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::messages::{VehicleCommand, VehicleMessage};

    fn unregister(time_s: f64, vehicle_id: u32) -> Message {
        Message::new(MessageBody::Vehicle(VehicleMessage {
            time_s,
            commands: vec![VehicleCommand::UnregisterVehicleCommand { vehicle_id }],
        }))
    }

    fn vehicle_ids(message: &Message) -> Vec<u32> {
        match &message.body {
            MessageBody::Vehicle(vehicle) => vehicle
                .commands
                .iter()
                .map(|command| match command {
                    VehicleCommand::UnregisterVehicleCommand { vehicle_id } => *vehicle_id,
                    other => panic!("unexpected {:?}", other),
                })
                .collect(),
            other => panic!("expected vehicle message, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn merges_one_message_per_peer() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut aggregator = PeerAggregator::new(rx, 2, Duration::from_millis(50));
        tx.send(("a", unregister(0.0, 1))).unwrap();
        tx.send(("a", unregister(0.1, 2))).unwrap();
        tx.send(("b", unregister(0.0, 3))).unwrap();

        let merged = aggregator.next_message().await.unwrap();
        assert_eq!(vehicle_ids(&merged), vec![1, 3]);

        // peer a's second message starts the next tick, b stays silent
        let started = Instant::now();
        let next = aggregator.next_message().await.unwrap();
        assert_eq!(vehicle_ids(&next), vec![2]);
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn late_peer_misses_the_window() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut aggregator = PeerAggregator::new(rx, 2, Duration::from_millis(50));
        tx.send(("a", unregister(0.0, 1))).unwrap();
        let late = tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(80)).await;
            late.send(("b", unregister(0.0, 2))).unwrap();
        });

        assert_eq!(vehicle_ids(&aggregator.next_message().await.unwrap()), vec![1]);
        assert_eq!(vehicle_ids(&aggregator.next_message().await.unwrap()), vec![2]);
        drop(tx);
    }

    #[tokio::test]
    async fn closed_channel_ends_aggregation() {
        let (tx, rx) = mpsc::unbounded_channel::<(&str, Message)>();
        let mut aggregator = PeerAggregator::new(rx, 3, Duration::from_millis(50));
        drop(tx);
        assert!(aggregator.next_message().await.is_none());
    }
}
