//! Routes each request to the handlers responsible for it and streams their
//! replies back as they complete.

use crate::communication::messages::Message;
use crate::monitoring::event_tracer::SharedTracer;
use crate::simulation_engine::TrafficError;
use crate::v2x::V2xError;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Traffic(#[from] TrafficError),
    #[error(transparent)]
    V2x(#[from] V2xError),
    #[error("handler was already torn down")]
    Closed,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("request handler failed: {0}")]
    Handler(#[from] HandlerError),
    #[error("request handler panicked: {0}")]
    Panicked(#[from] JoinError),
}

/// One kind of request processing.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    fn is_responsible(&self, message: &Message) -> bool;

    async fn process(&self, message: &Message) -> Result<Vec<Message>, HandlerError>;
}

/// Replies of one finished handler, in the order they should go out.
pub type ReplySender = mpsc::UnboundedSender<Vec<Message>>;

pub struct RequestDispatcher {
    handlers: Vec<Arc<dyn RequestHandler>>,
    shutdown: CancellationToken,
    tracer: SharedTracer,
}

impl RequestDispatcher {
    pub fn new(
        handlers: Vec<Arc<dyn RequestHandler>>,
        shutdown: CancellationToken,
        tracer: SharedTracer,
    ) -> Self {
        RequestDispatcher {
            handlers,
            shutdown,
            tracer,
        }
    }

    pub fn shutdown(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Run every responsible handler concurrently and send each one's
    /// replies as soon as it finishes.
    ///
    /// Shutdown aborts the handlers still running. A failing handler is
    /// fatal: shutdown is triggered and the error returned.
    pub async fn process(&self, message: Message, replies: &ReplySender) -> Result<(), DispatchError> {
        let kind = message.kind();
        let message = Arc::new(message);
        let mut running = JoinSet::new();
        for handler in self.handlers.iter().filter(|h| h.is_responsible(&message)) {
            let handler = Arc::clone(handler);
            let message = Arc::clone(&message);
            running.spawn(async move { handler.process(&message).await });
        }
        if running.is_empty() {
            log::warn!(
                "Could not process message of type {}, no handler responsible",
                kind
            );
            return Ok(());
        }

        self.tracer.begin("process", "request");
        let outcome = self.collect(&mut running, replies).await;
        self.tracer
            .end("process", "request", Some(json!({ "msgtype": kind })));
        outcome
    }

    async fn collect(
        &self,
        running: &mut JoinSet<Result<Vec<Message>, HandlerError>>,
        replies: &ReplySender,
    ) -> Result<(), DispatchError> {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    log::warn!("Shutdown triggered while processing request.");
                    running.abort_all();
                    return Ok(());
                }
                done = running.join_next() => {
                    let Some(done) = done else {
                        break;
                    };
                    self.tracer.instant("taskDone", "request");
                    let outcome = match done {
                        Ok(outcome) => outcome.map_err(DispatchError::from),
                        Err(err) => Err(DispatchError::from(err)),
                    };
                    match outcome {
                        Ok(handler_replies) => {
                            if !handler_replies.is_empty() && replies.send(handler_replies).is_err() {
                                log::warn!("Reply channel closed, dropping replies.");
                            }
                        }
                        Err(err) => {
                            log::error!("Task processing failed, shutting down!");
                            self.shutdown.cancel();
                            return Err(err);
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
