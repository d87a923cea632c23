//! Synchronizes the V2X network simulator with the traffic simulation.
//!
//! Every sync interval the fellow vehicles go out as one request and the
//! simulator answers once it reached the advanced time. Like the traffic
//! side, `advance` is pipelined one step ahead.

use crate::communication::framing::{hex_dump, join_frames, split_frames, FrameError};
use crate::communication::id_mapper::{IdMapper, SharedIdMapper};
use crate::communication::messages::{
    build_traffic_message, ApiVersion, Message, MessageBody, MessageError, NetInit,
    NetworkBoundaries, Point2D, SessionMessage, WirePolygon,
};
use crate::filtering::{FellowChangeSet, FellowSelection, TrafficFilter};
use crate::global_variables::{V2X_API_VERSION, V2X_SERVER_NAME, V2X_TEARDOWN_GRACE_MS};
use crate::models::VehicleSet;
use crate::monitoring::event_tracer::SharedTracer;
use crate::pipeline::{Pipeline, PipelineError};
use crate::shared_data::{NetworkInitData, V2xResult};
use crate::v2x::load_control::{LoadController, PhaseFractions};
use crate::v2x::transport::{ReqRepTransport, TransportError};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::{MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use thiserror::Error;

const TID: &str = "veins";

#[derive(Debug, Error)]
pub enum V2xError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("V2X simulator reached {reached} s, expected {expected} s")]
    TimeMismatch { expected: f64, reached: f64 },
    #[error("V2X reply lacks the time reached acknowledgment for {0} s")]
    MissingTimeReached(f64),
}

#[derive(Debug, Clone)]
pub struct V2xConfig {
    pub sync_interval: Duration,
    pub max_vehicles: Option<usize>,
    pub fellow_selection: FellowSelection,
    /// Target share of the sync interval the simulator may spend per exchange.
    pub threshold: Option<f64>,
}

type ExchangeResult = Result<V2xResult, V2xError>;

fn is_close(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-9 * a.abs().max(b.abs()).max(1.0)
}

fn lock(ids: &SharedIdMapper) -> MutexGuard<'_, IdMapper> {
    ids.lock().unwrap_or_else(PoisonError::into_inner)
}

fn encode(messages: &[Message]) -> Result<bytes::Bytes, V2xError> {
    let frames = messages
        .iter()
        .map(Message::to_frame)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(join_frames(&frames)?)
}

fn proto_enabled() -> bool {
    log::log_enabled!(target: "proto", log::Level::Debug)
}

/// Everything a background exchange works on.
struct VeinsState<T: ReqRepTransport> {
    transport: T,
    filter: TrafficFilter,
    /// Unfiltered twin of `filter`, only kept while protocol dumps are enabled.
    repro_filter: Option<TrafficFilter>,
    load: Option<LoadController>,
    current_time_s: f64,
    sync_interval: Duration,
    ids: SharedIdMapper,
    tracer: SharedTracer,
}

impl<T: ReqRepTransport> VeinsState<T> {
    async fn simulation_step(mut self, egos: VehicleSet, traffic: VehicleSet) -> (Self, ExchangeResult) {
        self.tracer.begin("simulateStep", TID);
        let result = self.step(&egos, &traffic).await;
        if let Err(err) = &result {
            log::error!("Veins step failed: {}", err);
        }
        self.tracer.end("simulateStep", TID, None);
        (self, result)
    }

    async fn step(&mut self, egos: &VehicleSet, traffic: &VehicleSet) -> ExchangeResult {
        let started = Instant::now();
        let changes = {
            let _span = self.tracer.complete("filter", TID);
            self.filter.derive_changes(traffic, egos)
        };
        log::info!(
            "Sending traffic to Veins at {:.1}s ({} new, {} updated, {} removed vehicles, includes {} ego vehicles)",
            self.current_time_s,
            changes.added.len(),
            changes.modified.len(),
            changes.removed.len(),
            egos.len()
        );

        let ego_ids: BTreeSet<String> = egos.keys().cloned().collect();
        let body = {
            let _span = self.tracer.complete("makeMessage", TID);
            let message = build_traffic_message(&changes, self.current_time_s, &ego_ids, &mut lock(&self.ids));
            encode(&[message])?
        };
        self.dump_all_traffic(traffic, egos, &ego_ids)?;

        let sent = Instant::now();
        self.tracer.begin("simulate", TID);
        let reply = self.transport.request(body).await?;
        let replied = Instant::now();
        let num_vehicles =
            changes.added.len() as i64 + changes.modified.len() as i64 - changes.removed.len() as i64;
        self.tracer
            .end("simulate", TID, Some(json!({ "num_vehicles": num_vehicles })));
        self.current_time_s += self.sync_interval.as_secs_f64();

        let result = {
            let _span = self.tracer.complete("processReply", TID);
            self.process_reply(&reply)?
        };
        let finished = Instant::now();

        let _span = self.tracer.complete("computeThreshold", TID);
        let fractions = PhaseFractions::measure(
            sent - started,
            replied - sent,
            finished - replied,
            self.sync_interval,
        );
        log::debug!(
            "Veins step ratios: pre {:.3}, simulation {:.3}, post {:.3}, total {:.3}",
            fractions.prepare,
            fractions.exchange,
            fractions.process,
            fractions.total()
        );
        self.adjust_load(&changes, egos, fractions.exchange);
        Ok(result)
    }

    /// Collect the reply's commands and check the simulator reached the expected time.
    fn process_reply(&self, reply: &[u8]) -> ExchangeResult {
        let mut result = V2xResult::default();
        let mut time_reached = false;
        for frame in split_frames(reply)? {
            let message = Message::from_frame(&frame)?;
            match &message.body {
                MessageBody::Session(SessionMessage::TimeReached { time_s }) => {
                    if !is_close(*time_s, self.current_time_s) {
                        return Err(V2xError::TimeMismatch {
                            expected: self.current_time_s,
                            reached: *time_s,
                        });
                    }
                    time_reached = true;
                }
                MessageBody::Visualization(_) | MessageBody::Vehicle(_) => result.absorb(&message),
                _ => log::warn!("Ignoring {} message in Veins reply", message.kind()),
            }
        }
        if !time_reached {
            return Err(V2xError::MissingTimeReached(self.current_time_s));
        }
        Ok(result)
    }

    fn adjust_load(&mut self, changes: &FellowChangeSet, egos: &VehicleSet, exchange_fraction: f64) {
        let Some(load) = self.load else {
            return;
        };
        let current = self.filter.max_vehicles().unwrap_or_else(|| {
            changes
                .added
                .iter()
                .chain(&changes.modified)
                .filter(|vehicle| !egos.contains_key(&vehicle.id))
                .count()
        });
        if let Some(next) = load.adjust(current, exchange_fraction) {
            self.filter.set_max_vehicles(Some(next));
        }
    }

    fn dump_all_traffic(
        &mut self,
        traffic: &VehicleSet,
        egos: &VehicleSet,
        ego_ids: &BTreeSet<String>,
    ) -> Result<(), V2xError> {
        let Some(filter) = self.repro_filter.as_mut() else {
            return Ok(());
        };
        let changes = filter.derive_changes(traffic, egos);
        let message = build_traffic_message(&changes, self.current_time_s, ego_ids, &mut lock(&self.ids));
        log::debug!(target: "proto", "allTraffic,{}", hex_dump(&encode(&[message])?));
        Ok(())
    }
}

/// Keeps a V2X simulator in lockstep with the traffic simulation.
pub struct NetworkSimCoordinator<T: ReqRepTransport> {
    pipeline: Pipeline<VeinsState<T>, ExchangeResult>,
    tracer: SharedTracer,
}

impl<T: ReqRepTransport> NetworkSimCoordinator<T> {
    /// Start the session: network geometry, start time and sync interval.
    pub async fn init(
        mut transport: T,
        config: V2xConfig,
        start_time_ms: i64,
        network: &NetworkInitData,
        ids: SharedIdMapper,
        tracer: SharedTracer,
    ) -> Result<Self, V2xError> {
        let ((left, bottom), (right, top)) = network.boundary;
        if network.polygons.is_empty() {
            log::warn!("No polygons found to send to Veins!");
        }
        let init = Message::new(MessageBody::Session(SessionMessage::Netinit(NetInit {
            version: ApiVersion {
                api: V2X_API_VERSION,
                server: V2X_SERVER_NAME.to_string(),
            },
            network_boundaries: NetworkBoundaries {
                topleft: Point2D { x: left, y: bottom },
                bottomright: Point2D { x: right, y: top },
            },
            polygons: network
                .polygons
                .iter()
                .map(|polygon| WirePolygon {
                    id: polygon.id.clone(),
                    polygon_type: polygon.polygon_type.clone(),
                    shape: polygon.shape.iter().map(|&(x, y)| Point2D { x, y }).collect(),
                })
                .collect(),
            init_time_s: start_time_ms as f64 / 1000.0,
            sync_interval_s: config.sync_interval.as_secs_f64(),
        })));
        let body = encode(&[init])?;
        log::debug!(target: "proto", "networkInit,{}", hex_dump(&body));
        transport.request(body).await?;
        log::info!("Connection to Veins established.");

        let repro_filter = proto_enabled().then(|| TrafficFilter::new(FellowSelection::PassAll, false, None));
        let state = VeinsState {
            transport,
            filter: TrafficFilter::new(config.fellow_selection, false, config.max_vehicles),
            repro_filter,
            load: config.threshold.map(LoadController::new),
            current_time_s: 0.0,
            sync_interval: config.sync_interval,
            ids,
            tracer: tracer.clone(),
        };
        Ok(NetworkSimCoordinator {
            pipeline: Pipeline::new("Veins", state, Ok(V2xResult::default())),
            tracer,
        })
    }

    pub fn stalls(&self) -> u64 {
        self.pipeline.stalls()
    }

    /// Current vehicle budget, after any running exchange.
    pub async fn max_vehicles(&mut self) -> Result<Option<usize>, V2xError> {
        Ok(self.pipeline.state_mut().await?.filter.max_vehicles())
    }

    /// Return the commands of the previous exchange and schedule the next one.
    ///
    /// The first call has nothing to report and returns an empty result.
    pub async fn advance(&mut self, egos: VehicleSet, traffic: VehicleSet) -> ExchangeResult {
        self.pipeline
            .advance(move |state| state.simulation_step(egos, traffic))
            .await?
    }

    /// Best effort: the teardown message is skipped if the running exchange
    /// does not finish within a short grace period.
    pub async fn teardown(self) -> Result<(), V2xError> {
        let _span = self.tracer.complete("teardown", TID);
        let grace = Duration::from_millis(V2X_TEARDOWN_GRACE_MS);
        match tokio::time::timeout(grace, self.pipeline.into_state()).await {
            Ok(Ok((mut state, _))) => {
                let body = encode(&[Message::new(MessageBody::Session(SessionMessage::Teardown))])?;
                log::debug!(target: "proto", "teardown,{}", hex_dump(&body));
                state.transport.notify(body).await?;
                state.transport.close().await?;
            }
            Ok(Err(err)) => log::warn!("Could not send teardown messages to Veins: {}", err),
            Err(_) => log::warn!("Could not send teardown messages to Veins."),
        }
        log::info!("Veins teardown complete.");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::messages::{VehicleCommand, VisualizationMessage};
    use crate::models::{vehicle_set, Vehicle};
    use crate::monitoring::event_tracer::EventTracer;
    use crate::shared_data::Polygon;
    use crate::v2x::mock::MockV2x;

    fn config(max_vehicles: Option<usize>, threshold: Option<f64>) -> V2xConfig {
        V2xConfig {
            sync_interval: Duration::from_millis(100),
            max_vehicles,
            fellow_selection: FellowSelection::EquallyDistributed,
            threshold,
        }
    }

    fn network() -> NetworkInitData {
        NetworkInitData {
            boundary: ((0.0, 0.0), (1000.0, 500.0)),
            polygons: vec![Polygon {
                id: "house".to_string(),
                polygon_type: "building".to_string(),
                shape: vec![(1.0, 1.0), (2.0, 1.0), (2.0, 2.0)],
            }],
        }
    }

    async fn coordinator(mock: &MockV2x, config: V2xConfig) -> NetworkSimCoordinator<MockV2x> {
        NetworkSimCoordinator::init(mock.clone(), config, 2500, &network(), IdMapper::shared(), EventTracer::disabled())
            .await
            .unwrap()
    }

    fn egos() -> VehicleSet {
        vehicle_set([Vehicle::new("ego", 0.0, 0.0)])
    }

    fn traffic() -> VehicleSet {
        vehicle_set([
            Vehicle::new("near", 1.0, 0.0),
            Vehicle::new("mid", 5.0, 0.0),
            Vehicle::new("far", 50.0, 0.0),
        ])
    }

    fn registered(message: &Message) -> Vec<(u32, bool)> {
        match &message.body {
            MessageBody::Vehicle(vehicle) => vehicle
                .commands
                .iter()
                .filter_map(|command| match command {
                    VehicleCommand::RegisterVehicleCommand(register) => {
                        Some((register.vehicle_id, register.is_ego_vehicle))
                    }
                    _ => None,
                })
                .collect(),
            other => panic!("expected vehicle message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn init_sends_network_and_timing() {
        let mock = MockV2x::new();
        coordinator(&mock, config(None, None)).await;
        let requests = mock.requests();
        assert_eq!(requests.len(), 1);
        match &requests[0].body {
            MessageBody::Session(SessionMessage::Netinit(init)) => {
                assert_eq!(init.version.server, "evi");
                assert_eq!(init.init_time_s, 2.5);
                assert!((init.sync_interval_s - 0.1).abs() < 1e-12);
                assert_eq!(init.network_boundaries.bottomright, Point2D { x: 1000.0, y: 500.0 });
                assert_eq!(init.polygons[0].polygon_type, "building");
                assert_eq!(init.polygons[0].shape.len(), 3);
            }
            other => panic!("expected netinit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn first_advance_is_empty_then_results_follow() {
        let mock = MockV2x::new();
        let mut v2x = coordinator(&mock, config(None, None)).await;
        mock.queue_reply(Message::new(MessageBody::Visualization(VisualizationMessage {
            time_s: 0.1,
            commands: vec![json!({ "marker": 1 })],
        })));

        assert!(v2x.advance(egos(), traffic()).await.unwrap().is_empty());
        let result = v2x.advance(egos(), traffic()).await.unwrap();
        assert_eq!(result.visualization, vec![json!({ "marker": 1 })]);

        // netinit plus the exchanges scheduled so far
        v2x.max_vehicles().await.unwrap();
        let requests = mock.requests();
        assert_eq!(requests.len(), 3);
        let first = registered(&requests[1]);
        assert_eq!(first.len(), 4);
        assert_eq!(first.iter().filter(|(_, is_ego)| *is_ego).count(), 1);
        assert!(registered(&requests[2]).is_empty());
    }

    #[tokio::test]
    async fn budget_limits_reported_fellows() {
        let mock = MockV2x::new();
        let mut v2x = coordinator(&mock, config(Some(1), None)).await;
        v2x.advance(egos(), traffic()).await.unwrap();
        v2x.max_vehicles().await.unwrap();

        let ids = IdMapper::shared();
        let near = lock(&ids).to_uint("near");
        let ego = lock(&ids).to_uint("ego");
        let mut first = registered(&mock.requests()[1]);
        first.sort();
        let mut expected = vec![(near, false), (ego, true)];
        expected.sort();
        assert_eq!(first, expected);
    }

    #[tokio::test]
    async fn wrong_time_ack_is_a_protocol_violation() {
        let mock = MockV2x::new();
        let mut v2x = coordinator(&mock, config(None, None)).await;
        mock.skew_time(0.05);
        v2x.advance(egos(), traffic()).await.unwrap();
        let err = v2x.advance(egos(), traffic()).await.unwrap_err();
        assert!(matches!(err, V2xError::TimeMismatch { .. }), "{:?}", err);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_simulator_shrinks_budget() {
        let mock = MockV2x::new();
        mock.set_delay(Duration::from_millis(80));
        let mut v2x = coordinator(&mock, config(Some(10), Some(0.4))).await;
        v2x.advance(egos(), traffic()).await.unwrap();
        // 0.8 of the interval for 10 vehicles, 0.4 allows 5
        assert_eq!(v2x.max_vehicles().await.unwrap(), Some(5));
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_advance_waits_for_running_exchange() {
        let mock = MockV2x::new();
        mock.set_delay(Duration::from_millis(50));
        let mut v2x = coordinator(&mock, config(None, None)).await;
        v2x.advance(egos(), traffic()).await.unwrap();
        v2x.advance(egos(), traffic()).await.unwrap();
        assert_eq!(v2x.stalls(), 1);
    }

    #[tokio::test]
    async fn teardown_notifies_and_closes() {
        let mock = MockV2x::new();
        let mut v2x = coordinator(&mock, config(None, None)).await;
        v2x.advance(egos(), traffic()).await.unwrap();
        v2x.teardown().await.unwrap();
        assert_eq!(
            mock.notifications(),
            vec![Message::new(MessageBody::Session(SessionMessage::Teardown))]
        );
        assert!(mock.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_skips_message_when_exchange_hangs() {
        let mock = MockV2x::new();
        let mut v2x = coordinator(&mock, config(None, None)).await;
        mock.set_delay(Duration::from_secs(5));
        v2x.advance(egos(), traffic()).await.unwrap();
        v2x.teardown().await.unwrap();
        assert!(mock.notifications().is_empty());
        assert!(!mock.is_closed());
    }
}
