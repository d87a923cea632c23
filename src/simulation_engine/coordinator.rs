//! Keeps the traffic simulation consistent with the ego vehicles reported by
//! the front-end and hands back the surrounding traffic.

use crate::models::{
    EgoVehicleConfig, Position, RouteFidelity, TrafficLight, Vehicle, VehicleClass, VehicleSet,
    VehicleSignal, VehicleStopState,
};
use crate::monitoring::event_tracer::SharedTracer;
use crate::pipeline::{Pipeline, PipelineError};
use crate::shared_data::{NetworkInitData, Polygon, TrafficStep};
use crate::simulation_engine::channel::{ChannelError, SimulationChannel};
use crate::simulation_engine::control::{unexpected_type, ControlConnection, Domain, TraciError, VehicleInsertion};
use crate::simulation_engine::spawning::SpawnManager;
use crate::simulation_engine::traci_constants::*;
use crate::simulation_engine::traci_storage::TraciValue;
use crate::simulation_engine::triggers::TriggerCollection;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrafficError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("subscription results of '{object_id}' lack variable 0x{variable:02x}")]
    MissingVariable { object_id: String, variable: u8 },
    #[error("vehicle id list missing from subscription results")]
    MissingIdList,
    #[error("expected simulation time {expected} ms after warm-up, reached {reached} ms")]
    StartTime { expected: i64, reached: i64 },
}

impl From<TraciError> for TrafficError {
    fn from(err: TraciError) -> Self {
        TrafficError::Channel(err.into())
    }
}

type StepResult = Result<TrafficStep, TrafficError>;
type Variables = HashMap<u8, TraciValue>;

fn value<'a>(object_id: &str, values: &'a Variables, variable: u8) -> Result<&'a TraciValue, TrafficError> {
    values.get(&variable).ok_or_else(|| TrafficError::MissingVariable {
        object_id: object_id.to_string(),
        variable,
    })
}

fn number(object_id: &str, values: &Variables, variable: u8) -> Result<f64, TrafficError> {
    let raw = value(object_id, values, variable)?;
    raw.as_f64()
        .ok_or_else(|| TrafficError::from(unexpected_type("number", raw)))
}

fn integer(object_id: &str, values: &Variables, variable: u8) -> Result<i32, TrafficError> {
    let raw = value(object_id, values, variable)?;
    raw.as_i32()
        .ok_or_else(|| TrafficError::from(unexpected_type("integer", raw)))
}

fn text<'a>(object_id: &str, values: &'a Variables, variable: u8) -> Result<&'a str, TrafficError> {
    let raw = value(object_id, values, variable)?;
    raw.as_str()
        .ok_or_else(|| TrafficError::from(unexpected_type("string", raw)))
}

/// Lane number from a lane id like `edge_2`.
pub fn lane_number(lane_id: &str) -> Option<i32> {
    lane_id.rsplit('_').next()?.parse().ok()
}

/// Build a vehicle snapshot from its subscription results.
pub fn extract_vehicle(vehicle_id: &str, values: &Variables) -> Result<Vehicle, TrafficError> {
    let lane_id = text(vehicle_id, values, VAR_LANE_ID)?;
    let lane_index = lane_number(lane_id).unwrap_or_else(|| {
        log::warn!("Lane number extraction failed for lane '{}'", lane_id);
        -1
    });
    let raw_position = value(vehicle_id, values, VAR_POSITION3D)?;
    let (x, y, height) = raw_position
        .as_position3d()
        .ok_or_else(|| TrafficError::from(unexpected_type("position", raw_position)))?;
    let route = text(vehicle_id, values, VAR_ROUTE_ID)?;

    Ok(Vehicle {
        id: vehicle_id.to_string(),
        position: Position {
            road_id: text(vehicle_id, values, VAR_ROAD_ID)?.to_string(),
            s_frac: number(vehicle_id, values, VAR_LANEPOSITION)?,
            lane_index,
            x,
            y,
            angle: number(vehicle_id, values, VAR_ANGLE)?,
            height,
            slope: number(vehicle_id, values, VAR_SLOPE)?,
        },
        speed: number(vehicle_id, values, VAR_SPEED)?,
        route: (!route.is_empty()).then(|| route.to_string()),
        signals: VehicleSignal::from_bits(integer(vehicle_id, values, VAR_SIGNALS)?),
        vehicle_class: VehicleClass::from_sumo_class(text(vehicle_id, values, VAR_VEHICLECLASS)?),
        stop_states: VehicleStopState::from_bits(integer(vehicle_id, values, VAR_STOPSTATE)?),
    })
}

fn trace_vehicles<'a>(vehicles: impl IntoIterator<Item = &'a Vehicle>, time_ms: i64) {
    if !log::log_enabled!(target: "trace", log::Level::Debug) {
        return;
    }
    for vehicle in vehicles {
        log::debug!(
            target: "trace",
            "sumoResult,{},{},{},{:.4},{:.4},{:.4},{:.4},{:.4}",
            time_ms,
            vehicle.id,
            vehicle.position.lane_index,
            vehicle.position.s_frac,
            vehicle.position.x,
            vehicle.position.y,
            vehicle.position.angle,
            vehicle.speed
        );
    }
}

/// Insert a remote controlled vehicle standing still.
fn add_ego_vehicle<C: ControlConnection + ?Sized>(
    connection: &mut C,
    vehicle_id: &str,
    config: &EgoVehicleConfig,
) -> Result<(), TraciError> {
    let mut insertion = VehicleInsertion::new(&config.route_id, &config.vehicle_type);
    insertion.depart_pos = "free".to_string();
    connection.add_vehicle(vehicle_id, &insertion)?;
    connection.set_route_id(vehicle_id, &config.route_id)?;
    // disable the simulator's own safety checks
    connection.set_speed_mode(vehicle_id, 0)?;
    connection.set_lane_change_mode(vehicle_id, 0)?;
    connection.set_speed(vehicle_id, 0.0)
}

/// Everything a background step works on.
struct SumoState<C: ControlConnection> {
    channel: Arc<SimulationChannel<C>>,
    ego_config: EgoVehicleConfig,
    ego_ids: BTreeSet<String>,
    subscribed: BTreeSet<String>,
    spawner: Option<SpawnManager>,
    tracer: SharedTracer,
}

impl<C: ControlConnection> SumoState<C> {
    async fn simulation_step(mut self, egos: VehicleSet) -> (Self, StepResult) {
        let result = self.step(&egos).await;
        if let Err(err) = &result {
            log::error!("Sumo step failed: {}", err);
        }
        (self, result)
    }

    async fn step(&mut self, egos: &VehicleSet) -> StepResult {
        {
            let _span = self.tracer.complete("updateEgos", "sumo");
            self.update_ego_vehicles(egos).await?;
        }

        let before_ms = self.channel.time_ms();
        log::debug!("Requesting timestep after timestep {}", before_ms);
        {
            let _span = self.tracer.complete("simulate", "sumo");
            self.channel.simulate_step(None).await?;
        }

        let vehicles = {
            let _span = self.tracer.complete("updateTraffic", "sumo");
            self.update_traffic().await?
        };
        let (ego_vehicles, traffic): (VehicleSet, VehicleSet) = vehicles
            .into_iter()
            .partition(|(id, _)| self.ego_ids.contains(id));

        if let Some(spawner) = self.spawner.as_mut() {
            let now_s = self.channel.time_ms() as f64 / 1000.0;
            self.channel
                .exec(|c| spawner.step(c, ego_vehicles.values(), now_s))
                .await?;
        }

        {
            let _span = self.tracer.complete("ensureEgoRoutes", "sumo");
            self.ensure_consistent_ego_routes(&ego_vehicles).await?;
        }
        for missing in self.ego_ids.iter().filter(|id| !ego_vehicles.contains_key(*id)) {
            log::error!("Ego-Vehicle '{}' not present in subscription results!", missing);
        }
        trace_vehicles(ego_vehicles.values(), before_ms);

        let traffic_lights = self.read_trafficlights().await?;
        Ok(TrafficStep {
            traffic,
            traffic_lights,
        })
    }

    async fn update_ego_vehicles(&mut self, egos: &VehicleSet) -> Result<(), TrafficError> {
        let mut seen = BTreeSet::new();
        for ego in egos.values() {
            seen.insert(ego.id.clone());
            if !self.ego_ids.contains(&ego.id) {
                log::info!("Registering ego vehicle '{}'", ego.id);
                let config = &self.ego_config;
                match self.channel.exec(|c| add_ego_vehicle(c, &ego.id, config)).await {
                    Ok(()) => {}
                    Err(err) if err.is_rejection() => {
                        seen.remove(&ego.id);
                        log::warn!("Could not register ego vehicle '{}': {}", ego.id, err);
                    }
                    Err(err) => return Err(err.into()),
                }
                continue;
            }

            log::debug!(
                "Updating ego vehicle {} to position ({:.2}, {:.2}) and speed {:.2}",
                ego.id,
                ego.position.x,
                ego.position.y,
                ego.speed
            );
            let keep_route = self.ego_config.route_fidelity.keep_route();
            let moved = self
                .channel
                .exec(|c| {
                    c.move_to_xy(
                        &ego.id,
                        ego.position.x,
                        ego.position.y,
                        ego.position.angle,
                        keep_route,
                    )?;
                    c.set_speed(&ego.id, ego.speed)
                })
                .await;
            match moved {
                Ok(()) => {}
                Err(err) if err.is_rejection() => {
                    // registered again in the next step
                    seen.remove(&ego.id);
                    log::warn!(
                        "Could not update ego vehicle position or speed. \
                         Will try to re-register in next time step. Ego ID: {}, TraCI says: {}",
                        ego.id,
                        err
                    );
                }
                Err(err) => return Err(err.into()),
            }
        }

        let vanished: Vec<String> = self.ego_ids.difference(&seen).cloned().collect();
        for ego_id in vanished {
            log::info!("Unregistering ego vehicle '{}' from Sumo.", ego_id);
            match self.channel.exec(|c| c.remove_vehicle(&ego_id)).await {
                Err(err) if err.is_rejection() => {
                    log::warn!("Could not remove ego vehicle '{}', TraCI says: {}", ego_id, err)
                }
                other => other?,
            }
        }
        self.ego_ids = seen;
        Ok(())
    }

    /// Subscribe to vehicles that entered the simulation and extract all subscribed ones.
    async fn update_traffic(&mut self) -> Result<VehicleSet, TrafficError> {
        let results = self.channel.subscription_results(Domain::Vehicle).await;
        let active: BTreeSet<String> = results
            .get("")
            .and_then(|values| values.get(&ID_LIST))
            .and_then(TraciValue::as_string_list)
            .ok_or(TrafficError::MissingIdList)?
            .iter()
            .cloned()
            .collect();

        let added: Vec<String> = active.difference(&self.subscribed).cloned().collect();
        log::debug!("Active vehicles in SUMO: {}", active.len());
        log::trace!(
            "Newly added vehicles in timestep {}: {:?}",
            self.channel.time_ms(),
            added
        );
        if !added.is_empty() {
            self.channel
                .exec(|c| {
                    for vehicle_id in &added {
                        c.subscribe(Domain::Vehicle, vehicle_id, &VEHICLE_SUBSCRIPTION_VARS)?;
                    }
                    Ok(())
                })
                .await?;
        }
        self.subscribed = active;

        let results = self.channel.subscription_results(Domain::Vehicle).await;
        let _span = self.tracer.complete("extractVehicles", "sumo");
        let mut vehicles = VehicleSet::new();
        for vehicle_id in &self.subscribed {
            match results.get(vehicle_id) {
                Some(values) => {
                    vehicles.insert(vehicle_id.clone(), extract_vehicle(vehicle_id, values)?);
                }
                None => log::warn!("No subscription results for vehicle '{}'", vehicle_id),
            }
        }
        Ok(vehicles)
    }

    async fn ensure_consistent_ego_routes(&self, egos: &VehicleSet) -> Result<(), TrafficError> {
        if self.ego_config.route_fidelity == RouteFidelity::Unrouted {
            return Ok(());
        }
        let route_id = &self.ego_config.route_id;
        for ego in egos.values() {
            let consistent = match &ego.route {
                // internal junction lanes carry their own routes
                Some(route) => route == route_id || route.starts_with(':'),
                None => false,
            };
            if consistent {
                continue;
            }
            log::debug!(
                "Re-setting route ID of ego vehicle '{}': from {:?} to '{}'.",
                ego.id,
                ego.route,
                route_id
            );
            match self.channel.exec(|c| c.set_route_id(&ego.id, route_id)).await {
                Err(err) if err.is_rejection() => {
                    log::warn!("Could not reset route of ego vehicle '{}': {}", ego.id, err)
                }
                other => other?,
            }
        }
        Ok(())
    }

    async fn read_trafficlights(&self) -> Result<Vec<TrafficLight>, TrafficError> {
        let now_s = self.channel.time_ms() as f64 / 1000.0;
        let results = self.channel.subscription_results(Domain::TrafficLight).await;
        let mut lights = Vec::with_capacity(results.len());
        for (tl_id, values) in &results {
            lights.push(TrafficLight::from_state(
                tl_id,
                text(tl_id, values, TL_RED_YELLOW_GREEN_STATE)?,
                integer(tl_id, values, TL_CURRENT_PHASE)?,
                text(tl_id, values, TL_CURRENT_PROGRAM)?,
                number(tl_id, values, TL_NEXT_SWITCH)?,
                now_s,
            ));
        }
        lights.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(lights)
    }
}

/// Ego vehicle lifecycle and traffic retrieval on top of a [`SimulationChannel`].
///
/// `advance` is pipelined: it returns the traffic of the previous step and
/// schedules the next one in the background.
pub struct TrafficCoordinator<C: ControlConnection> {
    channel: Arc<SimulationChannel<C>>,
    pipeline: Pipeline<SumoState<C>, StepResult>,
    traffic_lights: Vec<TrafficLight>,
    tracer: SharedTracer,
}

impl<C: ControlConnection> TrafficCoordinator<C> {
    pub async fn new(
        channel: Arc<SimulationChannel<C>>,
        ego_config: EgoVehicleConfig,
        triggers: Option<TriggerCollection>,
        tracer: SharedTracer,
    ) -> Result<Self, TrafficError> {
        log::info!(
            "Connected to TraCI Server running {}",
            channel.simulator_version()
        );
        let spawner = match triggers {
            Some(collection) if !collection.triggers.is_empty() => {
                Some(channel.exec(move |c| SpawnManager::new(collection, c)).await?)
            }
            Some(_) => None,
            None => {
                log::warn!("No triggers file -> Skipping triggers initialization.");
                None
            }
        };

        let state = SumoState {
            channel: channel.clone(),
            ego_config,
            ego_ids: BTreeSet::new(),
            subscribed: BTreeSet::new(),
            spawner,
            tracer: tracer.clone(),
        };
        Ok(TrafficCoordinator {
            channel,
            pipeline: Pipeline::new("Sumo", state, Ok(TrafficStep::default())),
            traffic_lights: Vec::new(),
            tracer,
        })
    }

    pub fn channel(&self) -> &Arc<SimulationChannel<C>> {
        &self.channel
    }

    pub fn time_ms(&self) -> i64 {
        self.channel.time_ms()
    }

    /// How often `advance` was called before the previous step finished.
    pub fn stalls(&self) -> u64 {
        self.pipeline.stalls()
    }

    /// Advance to the synchronized start time and return the initial traffic.
    ///
    /// The first `advance` returns the same traffic.
    pub async fn warm_up_traffic(&mut self, start_time_ms: i64) -> Result<VehicleSet, TrafficError> {
        log::info!(
            "Advancing traffic simulation to sync start time ({} ms)",
            start_time_ms
        );
        let state = self.pipeline.state_mut().await?;
        if start_time_ms != 0 {
            let _span = self.tracer.complete("advanceInitialTraffic", "sumo");
            state.channel.simulate_step(Some(start_time_ms)).await?;
        }
        state
            .channel
            .exec(|c| c.subscribe(Domain::Vehicle, "", &[ID_LIST]))
            .await?;

        let reached = state.channel.time_ms();
        if reached != start_time_ms {
            return Err(TrafficError::StartTime {
                expected: start_time_ms,
                reached,
            });
        }
        log::info!("Sync start time {} ms reached", reached);

        let traffic = state.update_traffic().await?;
        let traffic_lights = state.read_trafficlights().await?;
        self.pipeline
            .queue_result(Ok(TrafficStep {
                traffic: traffic.clone(),
                traffic_lights,
            }))
            .await?;
        Ok(traffic)
    }

    /// Return the traffic of the last step and schedule the next one for `egos`.
    pub async fn advance(&mut self, egos: VehicleSet) -> Result<VehicleSet, TrafficError> {
        let step = self
            .pipeline
            .advance(move |state| state.simulation_step(egos))
            .await??;
        self.traffic_lights = step.traffic_lights;
        Ok(step.traffic)
    }

    /// Traffic light states of the step last returned by `advance`.
    pub fn update_trafficlights(&self) -> Vec<TrafficLight> {
        self.traffic_lights.clone()
    }

    /// Subscribe to the listed traffic lights, or to all of them.
    pub async fn subscribe_to_trafficlights(&self, whitelist: Option<Vec<String>>) -> Result<(), TrafficError> {
        self.channel
            .exec(move |c| {
                let tl_ids = match whitelist {
                    Some(tl_ids) => tl_ids,
                    None => c.id_list(Domain::TrafficLight)?,
                };
                log::debug!("Subscribing to trafficlights: {:?}", tl_ids);
                for tl_id in &tl_ids {
                    c.subscribe(Domain::TrafficLight, tl_id, &TRAFFICLIGHT_SUBSCRIPTION_VARS)?;
                }
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Network boundary and polygons for the V2X session start.
    pub async fn network_init_data(&self) -> Result<NetworkInitData, TrafficError> {
        let data = self
            .channel
            .exec(|c| {
                let boundary = c.network_boundary()?;
                let mut polygons = Vec::new();
                for id in c.id_list(Domain::Polygon)? {
                    polygons.push(Polygon {
                        polygon_type: c.polygon_type(&id)?,
                        shape: c.shape(Domain::Polygon, &id)?,
                        id,
                    });
                }
                Ok(NetworkInitData { boundary, polygons })
            })
            .await?;
        Ok(data)
    }

    /// Ids of the ego vehicles currently registered, after any running step.
    pub async fn ego_ids(&mut self) -> Result<BTreeSet<String>, TrafficError> {
        Ok(self.pipeline.state_mut().await?.ego_ids.clone())
    }

    pub async fn teardown(self) -> Result<(), TrafficError> {
        log::debug!("Sumo teardown started...");
        let _span = self.tracer.complete("teardown", "sumo");
        if let Err(err) = self.pipeline.into_state().await {
            log::warn!("Last Sumo step was lost: {}", err);
        }
        self.channel.close().await?;
        log::info!("Sumo teardown complete.");
        Ok(())
    }
}
