//! In-memory V2X simulator for tests.

use crate::communication::framing::{join_frames, split_frames};
use crate::communication::messages::{Message, MessageBody, SessionMessage};
use crate::v2x::transport::{ReqRepTransport, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Default)]
struct MockState {
    time_s: f64,
    sync_interval_s: f64,
    delay: Duration,
    time_skew_s: f64,
    extra_replies: Vec<Message>,
    requests: Vec<Message>,
    notifications: Vec<Message>,
    closed: bool,
}

/// Acknowledges every traffic update with the advanced time.
///
/// Clones share state so a test can inspect what the coordinator sent.
#[derive(Clone, Default)]
pub struct MockV2x {
    state: Arc<Mutex<MockState>>,
}

impl MockV2x {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn set_delay(&self, delay: Duration) {
        self.state().delay = delay;
    }

    /// Acknowledge a time off by `skew_s` from the expected one.
    pub fn skew_time(&self, skew_s: f64) {
        self.state().time_skew_s = skew_s;
    }

    /// Append `message` to the next reply.
    pub fn queue_reply(&self, message: Message) {
        self.state().extra_replies.push(message);
    }

    pub fn requests(&self) -> Vec<Message> {
        self.state().requests.clone()
    }

    pub fn notifications(&self) -> Vec<Message> {
        self.state().notifications.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    fn decode(body: &[u8]) -> Vec<Message> {
        split_frames(body)
            .unwrap()
            .iter()
            .map(|frame| Message::from_frame(frame).unwrap())
            .collect()
    }
}

#[async_trait]
impl ReqRepTransport for MockV2x {
    async fn request(&mut self, body: Bytes) -> Result<Bytes, TransportError> {
        let delay = self.state().delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if state.closed {
            return Err(TransportError::Closed);
        }
        let mut reply = Vec::new();
        for message in Self::decode(&body) {
            match &message.body {
                MessageBody::Session(SessionMessage::Netinit(init)) => {
                    state.sync_interval_s = init.sync_interval_s;
                    state.time_s = 0.0;
                }
                MessageBody::Vehicle(_) => {
                    state.time_s += state.sync_interval_s;
                    let time_s = state.time_s + state.time_skew_s;
                    reply.push(Message::new(MessageBody::Session(SessionMessage::TimeReached {
                        time_s,
                    })));
                    reply.append(&mut state.extra_replies);
                }
                _ => {}
            }
            state.requests.push(message);
        }
        let frames = reply
            .iter()
            .map(|message| message.to_frame().unwrap())
            .collect::<Vec<_>>();
        Ok(join_frames(&frames).unwrap())
    }

    async fn notify(&mut self, body: Bytes) -> Result<(), TransportError> {
        let mut state = self.state();
        if state.closed {
            return Err(TransportError::Closed);
        }
        state.notifications.extend(Self::decode(&body));
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.state().closed = true;
        Ok(())
    }
}
