//! Scripted in-memory traffic simulator for tests.

use crate::simulation_engine::control::{ControlConnection, Domain, SubscriptionResults, TraciError};
use crate::simulation_engine::traci_constants::*;
use crate::simulation_engine::traci_storage::TraciValue;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const STEP_LENGTH_S: f64 = 0.1;

#[derive(Default)]
struct MockState {
    time_s: f64,
    step_delay: Duration,
    fail_close: bool,
    vehicles: BTreeMap<String, HashMap<u8, TraciValue>>,
    routes: BTreeMap<String, Vec<String>>,
    lanes: BTreeMap<String, Vec<(f64, f64)>>,
    polygons: BTreeMap<String, (String, Vec<(f64, f64)>)>,
    traffic_lights: BTreeMap<String, HashMap<u8, TraciValue>>,
    rejected_moves: BTreeSet<String>,
    subscribed: HashMap<Domain, BTreeSet<String>>,
    results: HashMap<Domain, SubscriptionResults>,
    log: Vec<String>,
}

/// Clones share the same simulated world, so a test keeps a handle while the
/// code under test owns the connection.
#[derive(Clone, Default)]
pub struct MockConnection {
    state: Arc<Mutex<MockState>>,
}

fn rejection(command: u8, description: String) -> TraciError {
    TraciError::Command {
        command,
        description,
    }
}

fn vehicle_values(x: f64, y: f64, route_id: &str) -> HashMap<u8, TraciValue> {
    HashMap::from([
        (VAR_ROAD_ID, TraciValue::string("edge0")),
        (VAR_LANE_ID, TraciValue::string("edge0_0")),
        (VAR_LANEPOSITION, TraciValue::Double(0.0)),
        (VAR_SPEED, TraciValue::Double(0.0)),
        (VAR_ROUTE_INDEX, TraciValue::Int(0)),
        (VAR_EDGES, TraciValue::StringList(vec!["edge0".to_string()])),
        (VAR_POSITION3D, TraciValue::Position3D(x, y, 0.0)),
        (VAR_ANGLE, TraciValue::Double(0.0)),
        (VAR_SIGNALS, TraciValue::Int(0)),
        (VAR_ROUTE_ID, TraciValue::string(route_id)),
        (VAR_VEHICLECLASS, TraciValue::string("passenger")),
        (VAR_SLOPE, TraciValue::Double(0.0)),
        (VAR_STOPSTATE, TraciValue::Int(0)),
    ])
}

impl MockConnection {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn set_step_delay(&self, delay: Duration) {
        self.state().step_delay = delay;
    }

    pub fn fail_close(&self) {
        self.state().fail_close = true;
    }

    /// Make every move of `vehicle_id` fail as if the vehicle had left the simulation.
    pub fn reject_moves_for(&self, vehicle_id: &str) {
        self.state().rejected_moves.insert(vehicle_id.to_string());
    }

    pub fn add_traffic(&self, vehicle_id: &str, x: f64, y: f64) {
        self.state()
            .vehicles
            .insert(vehicle_id.to_string(), vehicle_values(x, y, "traffic-route"));
    }

    pub fn remove_traffic(&self, vehicle_id: &str) {
        self.state().vehicles.remove(vehicle_id);
    }

    /// Overwrite one variable of a vehicle in the simulated world.
    pub fn set_vehicle_value(&self, vehicle_id: &str, variable: u8, value: TraciValue) {
        if let Some(values) = self.state().vehicles.get_mut(vehicle_id) {
            values.insert(variable, value);
        }
    }

    pub fn add_lane(&self, lane_id: &str, shape: Vec<(f64, f64)>) {
        self.state().lanes.insert(lane_id.to_string(), shape);
    }

    pub fn add_polygon(&self, polygon_id: &str, polygon_type: &str, shape: Vec<(f64, f64)>) {
        self.state()
            .polygons
            .insert(polygon_id.to_string(), (polygon_type.to_string(), shape));
    }

    pub fn add_traffic_light(&self, tl_id: &str, state: &str, phase: i32, next_switch_s: f64) {
        self.state().traffic_lights.insert(
            tl_id.to_string(),
            HashMap::from([
                (TL_RED_YELLOW_GREEN_STATE, TraciValue::string(state)),
                (TL_CURRENT_PHASE, TraciValue::Int(phase)),
                (TL_CURRENT_PROGRAM, TraciValue::string("0")),
                (TL_NEXT_SWITCH, TraciValue::Double(next_switch_s)),
            ]),
        );
    }

    pub fn has_vehicle(&self, vehicle_id: &str) -> bool {
        self.state().vehicles.contains_key(vehicle_id)
    }

    pub fn route_of(&self, route_id: &str) -> Option<Vec<String>> {
        self.state().routes.get(route_id).cloned()
    }

    pub fn command_log(&self) -> Vec<String> {
        self.state().log.clone()
    }

    /// Number of logged commands starting with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.state()
            .log
            .iter()
            .filter(|entry| entry.starts_with(prefix))
            .count()
    }
}

impl MockState {
    fn refresh_results(&mut self) {
        let mut simulation = SubscriptionResults::new();
        simulation.insert(
            String::new(),
            HashMap::from([(VAR_TIME, TraciValue::Double(self.time_s))]),
        );

        let mut vehicles = SubscriptionResults::new();
        if self.subscribed(Domain::Vehicle).contains("") {
            let ids = self.vehicles.keys().cloned().collect();
            vehicles.insert(
                String::new(),
                HashMap::from([(ID_LIST, TraciValue::StringList(ids))]),
            );
        }
        for id in self.subscribed(Domain::Vehicle) {
            if let Some(values) = self.vehicles.get(&id) {
                vehicles.insert(id, values.clone());
            }
        }

        let mut traffic_lights = SubscriptionResults::new();
        for id in self.subscribed(Domain::TrafficLight) {
            if let Some(values) = self.traffic_lights.get(&id) {
                traffic_lights.insert(id, values.clone());
            }
        }

        self.results = HashMap::from([
            (Domain::Simulation, simulation),
            (Domain::Vehicle, vehicles),
            (Domain::TrafficLight, traffic_lights),
        ]);
    }

    fn subscribed(&self, domain: Domain) -> BTreeSet<String> {
        self.subscribed.get(&domain).cloned().unwrap_or_default()
    }

    fn require_vehicle(&self, command: u8, vehicle_id: &str) -> Result<(), TraciError> {
        if self.vehicles.contains_key(vehicle_id) {
            Ok(())
        } else {
            Err(rejection(command, format!("Vehicle '{}' is not known", vehicle_id)))
        }
    }

    fn set_vehicle(&mut self, variable: u8, vehicle_id: &str, value: TraciValue) -> Result<(), TraciError> {
        let command = CMD_SET_VEHICLE_VARIABLE;
        match variable {
            ADD_FULL => {
                if self.vehicles.contains_key(vehicle_id) {
                    return Err(rejection(
                        command,
                        format!("Vehicle '{}' to add already exists", vehicle_id),
                    ));
                }
                let route_id = match &value {
                    TraciValue::Compound(items) => items
                        .first()
                        .and_then(TraciValue::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    _ => String::new(),
                };
                self.vehicles
                    .insert(vehicle_id.to_string(), vehicle_values(0.0, 0.0, &route_id));
                self.log.push(format!("add {}", vehicle_id));
            }
            VAR_MOVE_TO_XY => {
                if self.rejected_moves.contains(vehicle_id) {
                    self.log.push(format!("move {} rejected", vehicle_id));
                    return Err(rejection(command, format!("Vehicle '{}' is not known", vehicle_id)));
                }
                self.require_vehicle(command, vehicle_id)?;
                if let TraciValue::Compound(items) = &value {
                    let x = items.get(2).and_then(TraciValue::as_f64).unwrap_or_default();
                    let y = items.get(3).and_then(TraciValue::as_f64).unwrap_or_default();
                    if let Some(values) = self.vehicles.get_mut(vehicle_id) {
                        values.insert(VAR_POSITION3D, TraciValue::Position3D(x, y, 0.0));
                    }
                }
                self.log.push(format!("move {}", vehicle_id));
            }
            REMOVE => {
                self.require_vehicle(command, vehicle_id)?;
                self.vehicles.remove(vehicle_id);
                self.log.push(format!("remove {}", vehicle_id));
            }
            VAR_ROUTE_ID => {
                self.require_vehicle(command, vehicle_id)?;
                if let Some(values) = self.vehicles.get_mut(vehicle_id) {
                    values.insert(VAR_ROUTE_ID, value);
                }
                self.log.push(format!("route {}", vehicle_id));
            }
            VAR_SPEED | VAR_SPEEDSETMODE | VAR_LANECHANGE_MODE | VAR_SIGNALS | CMD_STOP | CMD_RESUME => {
                self.require_vehicle(command, vehicle_id)?;
                let name = match variable {
                    VAR_SPEED => "speed",
                    VAR_SPEEDSETMODE => "speedmode",
                    VAR_LANECHANGE_MODE => "lcmode",
                    VAR_SIGNALS => "signals",
                    CMD_STOP => "stop",
                    _ => "resume",
                };
                if variable == VAR_SIGNALS {
                    if let Some(values) = self.vehicles.get_mut(vehicle_id) {
                        values.insert(VAR_SIGNALS, value);
                    }
                }
                self.log.push(format!("{} {}", name, vehicle_id));
            }
            other => {
                return Err(rejection(command, format!("variable 0x{:02x} not scripted", other)));
            }
        }
        Ok(())
    }
}

impl ControlConnection for MockConnection {
    fn get_version(&mut self) -> Result<(i32, String), TraciError> {
        Ok((20, "SUMO mock".to_string()))
    }

    fn simulation_step(&mut self, target_s: f64) -> Result<(), TraciError> {
        let delay = self.state().step_delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let mut state = self.state();
        state.time_s = if target_s > 0.0 {
            target_s
        } else {
            ((state.time_s + STEP_LENGTH_S) * 1000.0).round() / 1000.0
        };
        state.refresh_results();
        state.log.push("step".to_string());
        Ok(())
    }

    fn close(&mut self) -> Result<(), TraciError> {
        let mut state = self.state();
        state.log.push("close".to_string());
        if state.fail_close {
            return Err(TraciError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "connection closed by peer",
            )));
        }
        Ok(())
    }

    fn subscribe(&mut self, domain: Domain, object_id: &str, _variables: &[u8]) -> Result<(), TraciError> {
        let mut state = self.state();
        state
            .subscribed
            .entry(domain)
            .or_default()
            .insert(object_id.to_string());
        state.log.push(format!("subscribe {:?} {}", domain, object_id));
        state.refresh_results();
        Ok(())
    }

    fn subscription_results(&self, domain: Domain) -> SubscriptionResults {
        self.state().results.get(&domain).cloned().unwrap_or_default()
    }

    fn get_variable(&mut self, domain: Domain, variable: u8, object_id: &str) -> Result<TraciValue, TraciError> {
        let state = self.state();
        let missing = || rejection(domain.get_command(), format!("'{}' is not known", object_id));
        match (domain, variable) {
            (Domain::TrafficLight, ID_LIST) => Ok(TraciValue::StringList(
                state.traffic_lights.keys().cloned().collect(),
            )),
            (Domain::Polygon, ID_LIST) => Ok(TraciValue::StringList(
                state.polygons.keys().cloned().collect(),
            )),
            (Domain::Vehicle, ID_LIST) => Ok(TraciValue::StringList(
                state.vehicles.keys().cloned().collect(),
            )),
            (Domain::Simulation, VAR_NET_BOUNDING_BOX) => {
                Ok(TraciValue::Polygon(vec![(0.0, 0.0), (1000.0, 500.0)]))
            }
            (Domain::Polygon, VAR_TYPE) => state
                .polygons
                .get(object_id)
                .map(|(polygon_type, _)| TraciValue::string(polygon_type.as_str()))
                .ok_or_else(missing),
            (Domain::Polygon, VAR_SHAPE) => state
                .polygons
                .get(object_id)
                .map(|(_, shape)| TraciValue::Polygon(shape.clone()))
                .ok_or_else(missing),
            (Domain::Lane, VAR_SHAPE) => state
                .lanes
                .get(object_id)
                .map(|shape| TraciValue::Polygon(shape.clone()))
                .ok_or_else(missing),
            _ => Err(missing()),
        }
    }

    fn set_variable(
        &mut self,
        domain: Domain,
        variable: u8,
        object_id: &str,
        value: TraciValue,
    ) -> Result<(), TraciError> {
        let mut state = self.state();
        match (domain, variable) {
            (Domain::Vehicle, _) => state.set_vehicle(variable, object_id, value),
            (Domain::Route, ADD) => {
                let edges = value.as_string_list().map(<[String]>::to_vec).unwrap_or_default();
                state.routes.insert(object_id.to_string(), edges);
                state.log.push(format!("add_route {}", object_id));
                Ok(())
            }
            _ => Err(rejection(
                domain.set_command(),
                format!("variable 0x{:02x} not scripted", variable),
            )),
        }
    }
}
