//! Datagram server for the real-time peer protocol.
//!
//! Every datagram holds one framed message. Each decoded request is
//! dispatched in its own task; replies go out one message per datagram with
//! strictly increasing ids.

use crate::communication::framing::hex_dump;
use crate::communication::messages::{Message, MessageBody, MessageError};
use crate::control_system::dispatcher::{DispatchError, ReplySender, RequestDispatcher};
use crate::control_system::peer_aggregation::PeerAggregator;
use crate::global_variables::{MAX_MSG_SIZE, PEER_AGGREGATION_WINDOW_MS};
use crate::monitoring::event_tracer::SharedTracer;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{lookup_host, ToSocketAddrs, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};

const TID: &str = "peer";
const RECEIVE_BUFFER: usize = 65_536;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("datagram socket failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("undecodable datagram from {peer}: {source}")]
    Decode {
        peer: SocketAddr,
        #[source]
        source: MessageError,
    },
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("dispatch task was lost: {0}")]
    Lost(#[from] JoinError),
    #[error("cannot resolve remote host override '{0}'")]
    Resolve(String),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Send replies to this host instead of the sender's.
    pub override_remote_host: Option<String>,
    /// Send replies to this port instead of the sender's.
    pub override_remote_port: Option<u16>,
    /// Number of front-end peers whose ego updates are merged per tick.
    pub peers: usize,
    pub aggregation_window: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            override_remote_host: None,
            override_remote_port: None,
            peers: 1,
            aggregation_window: Duration::from_millis(PEER_AGGREGATION_WINDOW_MS),
        }
    }
}

/// Where datagrams came from and where replies go.
#[derive(Debug, Default)]
struct Remotes {
    sources: Vec<SocketAddr>,
    targets: Vec<SocketAddr>,
    next_reply_id: u32,
}

pub struct DatagramServer {
    socket: UdpSocket,
    dispatcher: Arc<RequestDispatcher>,
    config: ServerConfig,
    tracer: SharedTracer,
}

impl DatagramServer {
    pub async fn bind<A: ToSocketAddrs>(
        local: A,
        dispatcher: Arc<RequestDispatcher>,
        config: ServerConfig,
        tracer: SharedTracer,
    ) -> Result<Self, ServerError> {
        let socket = UdpSocket::bind(local).await?;
        Ok(DatagramServer {
            socket,
            dispatcher,
            config,
            tracer,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serve requests until shutdown is signalled or a request fails.
    pub async fn serve(self) -> Result<(), ServerError> {
        let shutdown = self.dispatcher.shutdown().clone();
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (merged_tx, mut merged_rx) = mpsc::unbounded_channel();
        if self.config.peers > 1 {
            let mut aggregator = PeerAggregator::new(peer_rx, self.config.peers, self.config.aggregation_window);
            tokio::spawn(async move {
                while let Some(message) = aggregator.next_message().await {
                    if merged_tx.send(message).is_err() {
                        break;
                    }
                }
            });
        }

        let mut remotes = Remotes::default();
        let mut dispatches = JoinSet::new();
        let mut buf = vec![0u8; RECEIVE_BUFFER];
        log::info!("Waiting for real-time peers on {}", self.local_addr()?);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    log::debug!("Closing real-time peer socket");
                    // a failed dispatch is what triggered shutdown
                    while let Some(done) = dispatches.join_next().await {
                        done??;
                    }
                    return Ok(());
                }
                received = self.socket.recv_from(&mut buf) => {
                    let (len, source) = received?;
                    self.tracer.begin("receive", TID);
                    self.learn_remote(&mut remotes, source).await?;
                    log::debug!(target: "proto", "fromPeer,{}", hex_dump(&buf[..len]));
                    let message = match Message::decode(&buf[..len]) {
                        Ok(message) => message,
                        Err(source_err) => {
                            shutdown.cancel();
                            return Err(ServerError::Decode { peer: source, source: source_err });
                        }
                    };
                    if self.config.peers > 1 && matches!(message.body, MessageBody::Vehicle(_)) {
                        let _ = peer_tx.send((source, message));
                    } else {
                        self.dispatch(&mut dispatches, message, &reply_tx);
                    }
                    self.tracer.end("receive", TID, None);
                }
                Some(message) = merged_rx.recv() => {
                    self.dispatch(&mut dispatches, message, &reply_tx);
                }
                Some(replies) = reply_rx.recv() => {
                    self.send_replies(&mut remotes, replies).await?;
                }
                Some(done) = dispatches.join_next() => {
                    done??;
                }
            }
        }
    }

    fn dispatch(
        &self,
        dispatches: &mut JoinSet<Result<(), DispatchError>>,
        message: Message,
        replies: &ReplySender,
    ) {
        let dispatcher = Arc::clone(&self.dispatcher);
        let replies = replies.clone();
        dispatches.spawn(async move { dispatcher.process(message, &replies).await });
    }

    async fn reply_target(&self, source: SocketAddr) -> Result<SocketAddr, ServerError> {
        let port = self.config.override_remote_port.unwrap_or(source.port());
        let mut target = SocketAddr::new(source.ip(), port);
        if let Some(host) = &self.config.override_remote_host {
            target = lookup_host((host.as_str(), port))
                .await?
                .next()
                .ok_or_else(|| ServerError::Resolve(host.clone()))?;
            log::info!("Overriding remote host to {}", host);
        }
        if self.config.override_remote_port.is_some() {
            log::info!("Overriding remote port to {}", port);
        }
        Ok(target)
    }

    async fn learn_remote(&self, remotes: &mut Remotes, source: SocketAddr) -> Result<(), ServerError> {
        if remotes.sources.contains(&source) {
            return Ok(());
        }
        if remotes.sources.len() < self.config.peers {
            log::info!("Established connection to remote address {}", source);
            let target = self.reply_target(source).await?;
            remotes.sources.push(source);
            remotes.targets.push(target);
            return Ok(());
        }

        let expected = remotes.sources[0];
        let host_unexpected = expected.ip() != source.ip() && self.config.override_remote_host.is_none();
        let port_unexpected = expected.port() != source.port() && self.config.override_remote_port.is_none();
        if host_unexpected || port_unexpected {
            log::warn!(
                "Received message from different remote address. Expected: {:?}; Received from: {}",
                remotes.sources,
                source
            );
        }
        Ok(())
    }

    async fn send_replies(&self, remotes: &mut Remotes, replies: Vec<Message>) -> Result<(), ServerError> {
        if remotes.targets.is_empty() {
            log::warn!("No remote address known, dropping {} replies", replies.len());
            return Ok(());
        }
        self.tracer.begin("reply", TID);
        for mut reply in replies {
            reply.id = remotes.next_reply_id;
            remotes.next_reply_id += 1;
            let encoded = {
                let _span = self.tracer.complete("encode", TID);
                match reply.encode() {
                    Ok(encoded) => encoded,
                    Err(err) => {
                        log::error!("Dropping reply {} that cannot be encoded: {}", reply.id, err);
                        continue;
                    }
                }
            };
            if encoded.len() > MAX_MSG_SIZE {
                log::warn!(
                    "message exceeds maximum message size ({} of {} bytes)",
                    encoded.len(),
                    MAX_MSG_SIZE
                );
            }
            log::debug!(target: "proto", "toPeer,{}", hex_dump(&encoded));
            for target in &remotes.targets {
                self.socket.send_to(&encoded, target).await?;
            }
        }
        self.tracer.end("reply", TID, None);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::framing::Frame;
    use crate::communication::messages::{HorizonMessage, HorizonRequest, SessionMessage};
    use crate::control_system::dispatcher::{HandlerError, RequestHandler};
    use crate::control_system::handlers::HorizonDummyHandler;
    use crate::monitoring::event_tracer::EventTracer;
    use tokio_util::sync::CancellationToken;

    fn horizon_request(request_id: u32) -> Message {
        Message::new(MessageBody::Horizon(HorizonMessage {
            time_s: 1.0,
            requests: vec![HorizonRequest {
                request_id,
                vehicle_id: 0,
                variables: Vec::new(),
            }],
            responses: Vec::new(),
        }))
    }

    struct Failing;

    #[async_trait::async_trait]
    impl RequestHandler for Failing {
        fn is_responsible(&self, _message: &Message) -> bool {
            true
        }

        async fn process(&self, _message: &Message) -> Result<Vec<Message>, HandlerError> {
            Err(HandlerError::InvalidRequest("broken".to_string()))
        }
    }

    async fn server(shutdown: CancellationToken) -> DatagramServer {
        server_with(Arc::new(HorizonDummyHandler), shutdown).await
    }

    async fn server_with(handler: Arc<dyn RequestHandler>, shutdown: CancellationToken) -> DatagramServer {
        let dispatcher = Arc::new(RequestDispatcher::new(
            vec![handler],
            shutdown,
            EventTracer::disabled(),
        ));
        DatagramServer::bind("127.0.0.1:0", dispatcher, ServerConfig::default(), EventTracer::disabled())
            .await
            .unwrap()
    }

    async fn receive(peer: &UdpSocket) -> Message {
        let mut buf = vec![0u8; RECEIVE_BUFFER];
        let len = tokio::time::timeout(Duration::from_secs(5), peer.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        Message::decode(&buf[..len]).unwrap()
    }

    #[tokio::test]
    async fn replies_carry_increasing_ids() {
        let shutdown = CancellationToken::new();
        let server = server(shutdown.clone()).await;
        let address = server.local_addr().unwrap();
        let serving = tokio::spawn(server.serve());

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.connect(address).await.unwrap();
        peer.send(&horizon_request(1).encode().unwrap()).await.unwrap();
        let first = receive(&peer).await;
        peer.send(&horizon_request(2).encode().unwrap()).await.unwrap();
        let second = receive(&peer).await;
        assert_eq!((first.id, second.id), (0, 1));

        // no handler for session messages, the server keeps going
        let teardown = Message::new(MessageBody::Session(SessionMessage::Teardown));
        peer.send(&teardown.encode().unwrap()).await.unwrap();
        peer.send(&horizon_request(3).encode().unwrap()).await.unwrap();
        assert_eq!(receive(&peer).await.id, 2);

        shutdown.cancel();
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn truncated_datagram_is_fatal() {
        let shutdown = CancellationToken::new();
        let server = server(shutdown.clone()).await;
        let address = server.local_addr().unwrap();
        let serving = tokio::spawn(server.serve());

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let frame = Frame::new(0, &b"{\"id\":0}"[..]).encode().unwrap();
        peer.send_to(&frame[..frame.len() - 3], address).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), serving).await.unwrap().unwrap();
        assert!(matches!(result, Err(ServerError::Decode { .. })));
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failing_handler_error_is_returned() {
        for _ in 0..20 {
            let shutdown = CancellationToken::new();
            let server = server_with(Arc::new(Failing), shutdown.clone()).await;
            let address = server.local_addr().unwrap();
            let serving = tokio::spawn(server.serve());

            let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            peer.send_to(&horizon_request(1).encode().unwrap(), address).await.unwrap();

            let result = tokio::time::timeout(Duration::from_secs(5), serving).await.unwrap().unwrap();
            assert!(matches!(
                result,
                Err(ServerError::Dispatch(DispatchError::Handler(HandlerError::InvalidRequest(_))))
            ));
            assert!(shutdown.is_cancelled());
        }
    }
}
