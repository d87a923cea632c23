use crate::communication::framing::{decode_frame, Frame, FrameError};
use crate::communication::id_mapper::IdMapper;
use crate::filtering::FellowChangeSet;
use crate::models::{
    Position, TrafficLight, Vehicle, VehicleClass, VehicleSignal, VehicleStopState,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

/// Frame tag of a JSON encoded [`Message`].
pub const MESSAGE_TAG: u8 = 0;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("malformed message payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("unknown message tag {0}")]
    UnknownTag(u8),
}

/// Envelope of everything exchanged with the real-time peer and the V2X simulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub id: u32,
    pub body: MessageBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageBody {
    Session(SessionMessage),
    Vehicle(VehicleMessage),
    Trafficlight(TrafficLightMessage),
    Visualization(VisualizationMessage),
    Horizon(HorizonMessage),
}

impl MessageBody {
    pub fn kind(&self) -> &'static str {
        match self {
            MessageBody::Session(_) => "session",
            MessageBody::Vehicle(_) => "vehicle",
            MessageBody::Trafficlight(_) => "trafficlight",
            MessageBody::Visualization(_) => "visualization",
            MessageBody::Horizon(_) => "horizon",
        }
    }
}

impl Message {
    pub fn new(body: MessageBody) -> Self {
        Message { id: 0, body }
    }

    pub fn kind(&self) -> &'static str {
        self.body.kind()
    }

    pub fn to_frame(&self) -> Result<Frame, MessageError> {
        Ok(Frame::new(MESSAGE_TAG, serde_json::to_vec(self)?))
    }

    pub fn from_frame(frame: &Frame) -> Result<Message, MessageError> {
        if frame.tag != MESSAGE_TAG {
            return Err(MessageError::UnknownTag(frame.tag));
        }
        Ok(serde_json::from_slice(&frame.payload)?)
    }

    /// Encode into a single frame.
    pub fn encode(&self) -> Result<Bytes, MessageError> {
        Ok(self.to_frame()?.encode()?)
    }

    /// Decode a datagram that holds exactly one message.
    pub fn decode(data: &[u8]) -> Result<Message, MessageError> {
        Message::from_frame(&decode_frame(data)?)
    }
}

// Session

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMessage {
    Netinit(NetInit),
    TimeReached { time_s: f64 },
    Teardown,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point2D {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiVersion {
    pub api: u32,
    pub server: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkBoundaries {
    pub topleft: Point2D,
    pub bottomright: Point2D,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WirePolygon {
    pub id: String,
    #[serde(rename = "type")]
    pub polygon_type: String,
    pub shape: Vec<Point2D>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetInit {
    pub version: ApiVersion,
    pub network_boundaries: NetworkBoundaries,
    pub polygons: Vec<WirePolygon>,
    pub init_time_s: f64,
    pub sync_interval_s: f64,
}

// Vehicles

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleMessage {
    pub time_s: f64,
    #[serde(default)]
    pub commands: Vec<VehicleCommand>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleCommand {
    RegisterVehicleCommand(RegisterVehicle),
    UpdateVehicleCommand(UpdateVehicle),
    UnregisterVehicleCommand { vehicle_id: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterVehicle {
    pub vehicle_id: u32,
    pub state: VehicleState,
    #[serde(default)]
    pub veh_type: u8,
    #[serde(default)]
    pub is_ego_vehicle: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateVehicle {
    pub vehicle_id: u32,
    pub state: VehicleState,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WirePosition {
    pub road_id: u32,
    #[serde(default)]
    pub edge_id: String,
    pub s_frac: f64,
    pub lane_id: i32,
    pub px: f64,
    pub py: f64,
    pub angle: f64,
    #[serde(default)]
    pub height: f64,
    #[serde(default)]
    pub slope: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VehicleState {
    pub position: WirePosition,
    pub speed_mps: f64,
    #[serde(default)]
    pub signals: Vec<i32>,
    #[serde(default)]
    pub signal_sum: i32,
    #[serde(default)]
    pub stopstates: Vec<i32>,
    #[serde(default)]
    pub stopstate_sum: i32,
}

// Traffic lights

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JunctionSignal {
    pub index: u32,
    pub state: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Junction {
    pub id: u32,
    pub signals: Vec<JunctionSignal>,
    pub phase_nr: i32,
    pub program_id: String,
    pub time_to_switch_s: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficLightMessage {
    pub time_s: f64,
    pub junctions: Vec<Junction>,
}

// Visualization commands are produced by the V2X simulator and forwarded untouched.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualizationMessage {
    pub time_s: f64,
    #[serde(default)]
    pub commands: Vec<serde_json::Value>,
}

// Horizon

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HorizonRequest {
    pub request_id: u32,
    #[serde(default)]
    pub vehicle_id: u32,
    #[serde(default)]
    pub variables: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HorizonItem {
    pub variable: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HorizonResponse {
    pub request_id: u32,
    #[serde(default)]
    pub vehicle_id: u32,
    pub items: Vec<HorizonItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HorizonMessage {
    pub time_s: f64,
    #[serde(default)]
    pub requests: Vec<HorizonRequest>,
    #[serde(default)]
    pub responses: Vec<HorizonResponse>,
}

// Conversions between snapshots and wire payloads

pub fn vehicle_to_state(vehicle: &Vehicle, ids: &mut IdMapper) -> VehicleState {
    let position = &vehicle.position;
    let signals: Vec<i32> = vehicle.signals.iter().map(|s| s.bit()).collect();
    let stopstates: Vec<i32> = vehicle.stop_states.iter().map(|s| s.bit()).collect();
    VehicleState {
        position: WirePosition {
            road_id: ids.to_uint(&position.road_id),
            edge_id: position.road_id.clone(),
            s_frac: position.s_frac,
            lane_id: position.lane_index,
            px: position.x,
            py: position.y,
            angle: position.angle,
            height: position.height,
            slope: position.slope,
        },
        speed_mps: vehicle.speed,
        signal_sum: signals.iter().sum(),
        signals,
        stopstate_sum: stopstates.iter().sum(),
        stopstates,
    }
}

pub fn vehicle_from_state(
    vehicle_id: u32,
    state: &VehicleState,
    vehicle_class: VehicleClass,
    ids: &mut IdMapper,
) -> Vehicle {
    let position = &state.position;
    let signal_bits = state.signals.iter().fold(0, |bits, s| bits | s);
    let stop_bits = state.stopstates.iter().fold(0, |bits, s| bits | s);
    Vehicle {
        id: ids.to_string(vehicle_id),
        position: Position {
            road_id: ids.to_string(position.road_id),
            s_frac: position.s_frac,
            lane_index: position.lane_id,
            x: position.px,
            y: position.py,
            angle: position.angle,
            height: position.height,
            slope: position.slope,
        },
        speed: state.speed_mps,
        route: None,
        signals: VehicleSignal::from_bits(signal_bits),
        vehicle_class,
        stop_states: VehicleStopState::from_bits(stop_bits),
    }
}

/// Vehicle message announcing a fellow change set.
///
/// Commands come out as registrations, then removals, then updates, each
/// sorted by id. Registrations of ids in `ego_ids` are tagged as ego vehicles.
pub fn build_traffic_message(
    changes: &FellowChangeSet,
    time_s: f64,
    ego_ids: &BTreeSet<String>,
    ids: &mut IdMapper,
) -> Message {
    let mut commands = Vec::with_capacity(changes.len());
    for vehicle in &changes.added {
        commands.push(VehicleCommand::RegisterVehicleCommand(RegisterVehicle {
            vehicle_id: ids.to_uint(&vehicle.id),
            state: vehicle_to_state(vehicle, ids),
            veh_type: vehicle.vehicle_class.code(),
            is_ego_vehicle: ego_ids.contains(&vehicle.id),
        }));
    }
    for vehicle in &changes.removed {
        commands.push(VehicleCommand::UnregisterVehicleCommand {
            vehicle_id: ids.to_uint(&vehicle.id),
        });
    }
    for vehicle in &changes.modified {
        commands.push(VehicleCommand::UpdateVehicleCommand(UpdateVehicle {
            vehicle_id: ids.to_uint(&vehicle.id),
            state: vehicle_to_state(vehicle, ids),
        }));
    }
    Message::new(MessageBody::Vehicle(VehicleMessage { time_s, commands }))
}

pub fn build_trafficlight_message(
    lights: &[TrafficLight],
    time_s: f64,
    ids: &mut IdMapper,
) -> Message {
    let junctions = lights
        .iter()
        .map(|light| Junction {
            id: ids.to_uint(&light.id),
            signals: light
                .signals
                .iter()
                .enumerate()
                .map(|(index, signal)| JunctionSignal {
                    index: index as u32,
                    state: signal.code(),
                })
                .collect(),
            phase_nr: light.phase_nr,
            program_id: light.program_id.clone(),
            time_to_switch_s: light.time_to_switch,
        })
        .collect();
    Message::new(MessageBody::Trafficlight(TrafficLightMessage { time_s, junctions }))
}
