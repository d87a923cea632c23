use crate::communication::id_mapper::{IdMapper, SharedIdMapper};
use crate::communication::messages::{
    build_traffic_message, build_trafficlight_message, vehicle_from_state, HorizonItem,
    HorizonMessage, HorizonResponse, Message, MessageBody, VehicleCommand, VehicleMessage,
    VisualizationMessage,
};
use crate::control_system::dispatcher::{HandlerError, RequestHandler};
use crate::filtering::{FellowSelection, TrafficFilter};
use crate::models::{VehicleClass, VehicleSet};
use crate::monitoring::event_tracer::SharedTracer;
use crate::shared_data::V2xResult;
use crate::simulation_engine::{ControlConnection, TrafficCoordinator};
use crate::v2x::{NetworkSimCoordinator, ReqRepTransport};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::{MutexGuard, PoisonError};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

const TID: &str = "request";

fn lock(ids: &SharedIdMapper) -> MutexGuard<'_, IdMapper> {
    ids.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fold the commands of one vehicle message into the previous ego set.
///
/// Registrations are applied first, then updates, then unregistrations.
pub fn extract_vehicle_updates(
    commands: &[VehicleCommand],
    previous: &VehicleSet,
    register_from_update: bool,
    ids: &mut IdMapper,
) -> Result<VehicleSet, HandlerError> {
    let mut egos = previous.clone();

    for command in commands {
        if let VehicleCommand::RegisterVehicleCommand(register) = command {
            let ego_id = ids.to_string(register.vehicle_id);
            if egos.contains_key(&ego_id) {
                return Err(HandlerError::InvalidRequest(format!(
                    "ego vehicle '{}' registered twice",
                    ego_id
                )));
            }
            let vehicle = vehicle_from_state(register.vehicle_id, &register.state, VehicleClass::PassengerCar, ids);
            egos.insert(vehicle.id.clone(), vehicle);
        }
    }

    for command in commands {
        if let VehicleCommand::UpdateVehicleCommand(update) = command {
            let ego_id = ids.to_string(update.vehicle_id);
            if !egos.contains_key(&ego_id) {
                if register_from_update {
                    log::warn!("Substituting registration msg with update msg for '{}'.", ego_id);
                } else {
                    return Err(HandlerError::InvalidRequest(format!(
                        "update for ego vehicle '{}' without registration",
                        ego_id
                    )));
                }
            }
            let vehicle = vehicle_from_state(update.vehicle_id, &update.state, VehicleClass::PassengerCar, ids);
            egos.insert(vehicle.id.clone(), vehicle);
        }
    }

    for command in commands {
        if let VehicleCommand::UnregisterVehicleCommand { vehicle_id } = command {
            let ego_id = ids.to_string(*vehicle_id);
            if egos.remove(&ego_id).is_none() {
                return Err(HandlerError::InvalidRequest(format!(
                    "unregistration of unknown ego vehicle '{}'",
                    ego_id
                )));
            }
        }
    }

    Ok(egos)
}

#[derive(Debug, Clone)]
pub struct EgoHandlerConfig {
    pub fellow_selection: FellowSelection,
    pub max_vehicles: Option<usize>,
    /// Treat an update of an unknown ego as its registration.
    pub register_from_update: bool,
}

struct EgoSession<C: ControlConnection, T: ReqRepTransport> {
    sumo: TrafficCoordinator<C>,
    v2x: Option<NetworkSimCoordinator<T>>,
    filter: TrafficFilter,
    egos: VehicleSet,
}

/// Main synchronization point: ego updates from the front-end go to the
/// simulators, fellow traffic and traffic lights go back.
pub struct EgoVehicleUpdateHandler<C: ControlConnection, T: ReqRepTransport> {
    session: Mutex<Option<EgoSession<C, T>>>,
    ids: SharedIdMapper,
    shutdown: CancellationToken,
    register_from_update: bool,
    tracer: SharedTracer,
}

impl<C: ControlConnection, T: ReqRepTransport> EgoVehicleUpdateHandler<C, T> {
    /// `sumo` should be warmed up and subscribed to its traffic lights.
    pub fn new(
        sumo: TrafficCoordinator<C>,
        v2x: Option<NetworkSimCoordinator<T>>,
        config: EgoHandlerConfig,
        ids: SharedIdMapper,
        shutdown: CancellationToken,
        tracer: SharedTracer,
    ) -> Self {
        EgoVehicleUpdateHandler {
            session: Mutex::new(Some(EgoSession {
                sumo,
                v2x,
                filter: TrafficFilter::new(config.fellow_selection, true, config.max_vehicles),
                egos: VehicleSet::new(),
            })),
            ids,
            shutdown,
            register_from_update: config.register_from_update,
            tracer,
        }
    }

    /// Tear down both simulator sessions; later requests fail.
    pub async fn teardown(&self) -> Result<(), HandlerError> {
        let Some(session) = self.session.lock().await.take() else {
            return Ok(());
        };
        let v2x_result = match session.v2x {
            Some(v2x) => v2x.teardown().await,
            None => Ok(()),
        };
        session.sumo.teardown().await?;
        v2x_result?;
        Ok(())
    }
}

/// Replies carrying what the V2X simulator reported, stamped with `time_s`.
fn v2x_replies(result: V2xResult, time_s: f64) -> Vec<Message> {
    let mut replies = Vec::new();
    if !result.visualization.is_empty() {
        log::info!(
            "Forwarding visualization events from Veins ({} messages)",
            result.visualization.len()
        );
        replies.push(Message::new(MessageBody::Visualization(VisualizationMessage {
            time_s,
            commands: result.visualization,
        })));
    }
    if !result.vehicle.is_empty() {
        log::info!(
            "Forwarding vehicle update events from Veins ({} messages)",
            result.vehicle.len()
        );
        replies.push(Message::new(MessageBody::Vehicle(VehicleMessage {
            time_s,
            commands: result.vehicle,
        })));
    }
    replies
}

#[async_trait]
impl<C: ControlConnection, T: ReqRepTransport> RequestHandler for EgoVehicleUpdateHandler<C, T> {
    fn is_responsible(&self, message: &Message) -> bool {
        matches!(message.body, MessageBody::Vehicle(_))
    }

    async fn process(&self, message: &Message) -> Result<Vec<Message>, HandlerError> {
        let MessageBody::Vehicle(vehicle_message) = &message.body else {
            return Ok(Vec::new());
        };
        let time_s = vehicle_message.time_s;
        log::info!(
            "Received vehicle msg with {} vehicle commands at msg time {:.1}s",
            vehicle_message.commands.len(),
            time_s
        );

        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or(HandlerError::Closed)?;
        let _span = self.tracer.complete("egohandler", TID);

        let egos = extract_vehicle_updates(
            &vehicle_message.commands,
            &session.egos,
            self.register_from_update,
            &mut lock(&self.ids),
        )?;
        if egos.is_empty() {
            if session.egos.is_empty() {
                return Err(HandlerError::InvalidRequest(
                    "vehicle message without any ego vehicle".to_string(),
                ));
            }
            log::info!("Last ego vehicle unregistered, shutting down.");
            session.egos = egos;
            self.shutdown.cancel();
            return Ok(Vec::new());
        }

        let traffic = {
            let _span = self.tracer.complete("sumoAdvance", TID);
            session.sumo.advance(egos.clone()).await?
        };
        let v2x_result = match session.v2x.as_mut() {
            Some(v2x) => {
                let _span = self.tracer.complete("veinsAdvance", TID);
                Some(v2x.advance(egos.clone(), traffic.clone()).await?)
            }
            None => None,
        };

        let fellows: VehicleSet = traffic
            .into_iter()
            .filter(|(id, _)| !egos.contains_key(id))
            .collect();
        let changes = {
            let _span = self.tracer.complete("filterFellows", TID);
            session.filter.derive_changes(&fellows, &egos)
        };
        log::info!(
            "Sending fellow traffic at {:.1}s ({} new, {} updated, {} removed)",
            time_s,
            changes.added.len(),
            changes.modified.len(),
            changes.removed.len()
        );

        let traffic_lights = session.sumo.update_trafficlights();
        log::trace!("Sending trafficlight updates: {:?}", traffic_lights);
        let mut replies = {
            let mut ids = lock(&self.ids);
            vec![
                build_traffic_message(&changes, time_s, &BTreeSet::new(), &mut ids),
                build_trafficlight_message(&traffic_lights, time_s, &mut ids),
            ]
        };
        if let Some(result) = v2x_result {
            replies.extend(v2x_replies(result, time_s));
        }

        session.egos = egos;
        Ok(replies)
    }
}

/// Answers horizon requests with placeholder responses.
#[derive(Debug, Default)]
pub struct HorizonDummyHandler;

#[async_trait]
impl RequestHandler for HorizonDummyHandler {
    fn is_responsible(&self, message: &Message) -> bool {
        matches!(message.body, MessageBody::Horizon(_))
    }

    async fn process(&self, message: &Message) -> Result<Vec<Message>, HandlerError> {
        let MessageBody::Horizon(horizon) = &message.body else {
            return Ok(Vec::new());
        };
        log::info!("Received horizon request");
        log::debug!("Sending dummy response.");
        let responses = horizon
            .requests
            .iter()
            .map(|request| HorizonResponse {
                request_id: request.request_id,
                vehicle_id: 0,
                items: vec![HorizonItem { variable: 0 }],
            })
            .collect();
        Ok(vec![Message::new(MessageBody::Horizon(HorizonMessage {
            time_s: -1.0,
            requests: Vec::new(),
            responses,
        }))])
    }
}
