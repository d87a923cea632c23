use crate::simulation_engine::traci_constants::*;
use crate::simulation_engine::traci_storage::{StorageError, TraciValue};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TraciError {
    #[error("traci transport failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("traci protocol violation: {0}")]
    Protocol(String),
    /// The simulator rejected a command; the connection itself is still usable.
    #[error("traci command 0x{command:02x} rejected: {description}")]
    Command { command: u8, description: String },
}

impl From<StorageError> for TraciError {
    fn from(err: StorageError) -> Self {
        TraciError::Protocol(err.to_string())
    }
}

impl TraciError {
    pub fn is_rejection(&self) -> bool {
        matches!(self, TraciError::Command { .. })
    }
}

/// Object domains addressed by get/set/subscribe commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    Simulation,
    Vehicle,
    Route,
    TrafficLight,
    Lane,
    Polygon,
}

impl Domain {
    pub fn get_command(self) -> u8 {
        match self {
            Domain::Simulation => CMD_GET_SIM_VARIABLE,
            Domain::Vehicle => CMD_GET_VEHICLE_VARIABLE,
            Domain::Route => CMD_GET_ROUTE_VARIABLE,
            Domain::TrafficLight => CMD_GET_TL_VARIABLE,
            Domain::Lane => CMD_GET_LANE_VARIABLE,
            Domain::Polygon => CMD_GET_POLYGON_VARIABLE,
        }
    }

    pub fn set_command(self) -> u8 {
        match self {
            Domain::Simulation => CMD_SET_SIM_VARIABLE,
            Domain::Vehicle => CMD_SET_VEHICLE_VARIABLE,
            Domain::Route => CMD_SET_ROUTE_VARIABLE,
            Domain::TrafficLight => CMD_SET_TL_VARIABLE,
            Domain::Lane => CMD_SET_LANE_VARIABLE,
            Domain::Polygon => CMD_SET_POLYGON_VARIABLE,
        }
    }

    pub fn subscribe_command(self) -> u8 {
        match self {
            Domain::Simulation => CMD_SUBSCRIBE_SIM_VARIABLE,
            Domain::Vehicle => CMD_SUBSCRIBE_VEHICLE_VARIABLE,
            Domain::Route => CMD_SUBSCRIBE_ROUTE_VARIABLE,
            Domain::TrafficLight => CMD_SUBSCRIBE_TL_VARIABLE,
            Domain::Lane => CMD_SUBSCRIBE_LANE_VARIABLE,
            Domain::Polygon => CMD_SUBSCRIBE_POLYGON_VARIABLE,
        }
    }

    pub fn from_subscription_response(response: u8) -> Option<Domain> {
        [
            Domain::Simulation,
            Domain::Vehicle,
            Domain::Route,
            Domain::TrafficLight,
            Domain::Lane,
            Domain::Polygon,
        ]
        .into_iter()
        .find(|domain| domain.subscribe_command() + SUBSCRIPTION_RESPONSE_OFFSET == response)
    }
}

/// Latest subscribed values per object id, then per variable id.
pub type SubscriptionResults = HashMap<String, HashMap<u8, TraciValue>>;

/// Parameters of a vehicle insertion; strings use the simulator's notation
/// (`"now"`, `"free"`, `"first"`, `"max"`, ...).
#[derive(Debug, Clone, PartialEq)]
pub struct VehicleInsertion {
    pub route_id: String,
    pub type_id: String,
    pub depart: String,
    pub depart_lane: String,
    pub depart_pos: String,
    pub depart_speed: String,
    pub arrival_lane: String,
    pub arrival_pos: String,
    pub arrival_speed: String,
}

impl VehicleInsertion {
    pub fn new(route_id: &str, type_id: &str) -> Self {
        VehicleInsertion {
            route_id: route_id.to_string(),
            type_id: type_id.to_string(),
            depart: "now".to_string(),
            depart_lane: "first".to_string(),
            depart_pos: "base".to_string(),
            depart_speed: "0".to_string(),
            arrival_lane: "current".to_string(),
            arrival_pos: "max".to_string(),
            arrival_speed: "current".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StopRequest {
    pub edge: String,
    pub end_pos: f64,
    pub lane_index: u8,
    pub duration: f64,
    pub flags: u8,
    pub start_pos: f64,
    pub until: f64,
}

/// Blocking access to a traffic simulator's control channel.
///
/// Implementors provide the protocol primitives; the typed commands are
/// expressed on top of them.
pub trait ControlConnection: Send + 'static {
    /// API level and simulator version string.
    fn get_version(&mut self) -> Result<(i32, String), TraciError>;

    /// Step up to `target_s` (one step if `0.0`) and refresh subscription results.
    fn simulation_step(&mut self, target_s: f64) -> Result<(), TraciError>;

    fn close(&mut self) -> Result<(), TraciError>;

    fn subscribe(&mut self, domain: Domain, object_id: &str, variables: &[u8]) -> Result<(), TraciError>;

    fn subscription_results(&self, domain: Domain) -> SubscriptionResults;

    fn get_variable(&mut self, domain: Domain, variable: u8, object_id: &str) -> Result<TraciValue, TraciError>;

    fn set_variable(
        &mut self,
        domain: Domain,
        variable: u8,
        object_id: &str,
        value: TraciValue,
    ) -> Result<(), TraciError>;

    // Typed commands

    fn add_vehicle(&mut self, vehicle_id: &str, insertion: &VehicleInsertion) -> Result<(), TraciError> {
        let value = TraciValue::Compound(vec![
            TraciValue::string(&insertion.route_id),
            TraciValue::string(&insertion.type_id),
            TraciValue::string(&insertion.depart),
            TraciValue::string(&insertion.depart_lane),
            TraciValue::string(&insertion.depart_pos),
            TraciValue::string(&insertion.depart_speed),
            TraciValue::string(&insertion.arrival_lane),
            TraciValue::string(&insertion.arrival_pos),
            TraciValue::string(&insertion.arrival_speed),
            TraciValue::string(""),
            TraciValue::string(""),
            TraciValue::string(""),
            TraciValue::Int(0),
            TraciValue::Int(0),
        ]);
        self.set_variable(Domain::Vehicle, ADD_FULL, vehicle_id, value)
    }

    fn set_route_id(&mut self, vehicle_id: &str, route_id: &str) -> Result<(), TraciError> {
        self.set_variable(Domain::Vehicle, VAR_ROUTE_ID, vehicle_id, TraciValue::string(route_id))
    }

    fn set_speed_mode(&mut self, vehicle_id: &str, mode: i32) -> Result<(), TraciError> {
        self.set_variable(Domain::Vehicle, VAR_SPEEDSETMODE, vehicle_id, TraciValue::Int(mode))
    }

    fn set_lane_change_mode(&mut self, vehicle_id: &str, mode: i32) -> Result<(), TraciError> {
        self.set_variable(Domain::Vehicle, VAR_LANECHANGE_MODE, vehicle_id, TraciValue::Int(mode))
    }

    fn set_speed(&mut self, vehicle_id: &str, speed: f64) -> Result<(), TraciError> {
        self.set_variable(Domain::Vehicle, VAR_SPEED, vehicle_id, TraciValue::Double(speed))
    }

    fn move_to_xy(
        &mut self,
        vehicle_id: &str,
        x: f64,
        y: f64,
        angle: f64,
        keep_route: u8,
    ) -> Result<(), TraciError> {
        let value = TraciValue::Compound(vec![
            TraciValue::string(""),
            TraciValue::Int(-1),
            TraciValue::Double(x),
            TraciValue::Double(y),
            TraciValue::Double(angle),
            TraciValue::Byte(keep_route as i8),
        ]);
        self.set_variable(Domain::Vehicle, VAR_MOVE_TO_XY, vehicle_id, value)
    }

    fn remove_vehicle(&mut self, vehicle_id: &str) -> Result<(), TraciError> {
        self.set_variable(
            Domain::Vehicle,
            REMOVE,
            vehicle_id,
            TraciValue::Byte(REMOVE_VAPORIZED as i8),
        )
    }

    fn set_stop(&mut self, vehicle_id: &str, stop: &StopRequest) -> Result<(), TraciError> {
        let value = TraciValue::Compound(vec![
            TraciValue::string(&stop.edge),
            TraciValue::Double(stop.end_pos),
            TraciValue::Byte(stop.lane_index as i8),
            TraciValue::Double(stop.duration),
            TraciValue::Byte(stop.flags as i8),
            TraciValue::Double(stop.start_pos),
            TraciValue::Double(stop.until),
        ]);
        self.set_variable(Domain::Vehicle, CMD_STOP, vehicle_id, value)
    }

    fn resume(&mut self, vehicle_id: &str) -> Result<(), TraciError> {
        self.set_variable(Domain::Vehicle, CMD_RESUME, vehicle_id, TraciValue::Compound(Vec::new()))
    }

    fn set_signals(&mut self, vehicle_id: &str, bits: i32) -> Result<(), TraciError> {
        self.set_variable(Domain::Vehicle, VAR_SIGNALS, vehicle_id, TraciValue::Int(bits))
    }

    fn add_route(&mut self, route_id: &str, edges: &[String]) -> Result<(), TraciError> {
        self.set_variable(Domain::Route, ADD, route_id, TraciValue::StringList(edges.to_vec()))
    }

    // Queries

    fn id_list(&mut self, domain: Domain) -> Result<Vec<String>, TraciError> {
        let value = self.get_variable(domain, ID_LIST, "")?;
        value
            .as_string_list()
            .map(<[String]>::to_vec)
            .ok_or_else(|| unexpected_type("id list", &value))
    }

    /// Lower left and upper right corner of the network.
    fn network_boundary(&mut self) -> Result<((f64, f64), (f64, f64)), TraciError> {
        let value = self.get_variable(Domain::Simulation, VAR_NET_BOUNDING_BOX, "")?;
        match value.as_points().as_deref() {
            Some([lower_left, upper_right]) => Ok((*lower_left, *upper_right)),
            _ => Err(unexpected_type("network boundary", &value)),
        }
    }

    fn polygon_type(&mut self, polygon_id: &str) -> Result<String, TraciError> {
        let value = self.get_variable(Domain::Polygon, VAR_TYPE, polygon_id)?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| unexpected_type("polygon type", &value))
    }

    fn shape(&mut self, domain: Domain, object_id: &str) -> Result<Vec<(f64, f64)>, TraciError> {
        let value = self.get_variable(domain, VAR_SHAPE, object_id)?;
        value.as_points().ok_or_else(|| unexpected_type("shape", &value))
    }
}

pub fn unexpected_type(what: &str, value: &TraciValue) -> TraciError {
    TraciError::Protocol(format!(
        "unexpected type 0x{:02x} for {}",
        value.type_id(),
        what
    ))
}
