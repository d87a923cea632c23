use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Vehicles keyed by their string id.
///
/// Ordered so that everything built from a set (wire messages, logs) comes out
/// in a stable order.
pub type VehicleSet = BTreeMap<String, Vehicle>;

/// Collect vehicles into a [`VehicleSet`]; later duplicates replace earlier ones.
pub fn vehicle_set<I: IntoIterator<Item = Vehicle>>(vehicles: I) -> VehicleSet {
    vehicles
        .into_iter()
        .map(|vehicle| (vehicle.id.clone(), vehicle))
        .collect()
}

/// Indicator and light flags of a vehicle, numbered like the simulator's bit field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum VehicleSignal {
    BlinkerRight = 1,
    BlinkerLeft = 2,
    BlinkerEmergency = 4,
    BrakeLight = 8,
    FrontLight = 16,
    FogLight = 32,
    HighBeam = 64,
    BackDrive = 128,
    Wiper = 256,
    DoorOpenLeft = 512,
    DoorOpenRight = 1024,
    EmergencyBlue = 2048,
    EmergencyRed = 4096,
    EmergencyYellow = 8192,
}

impl VehicleSignal {
    pub const ALL: [VehicleSignal; 14] = [
        VehicleSignal::BlinkerRight,
        VehicleSignal::BlinkerLeft,
        VehicleSignal::BlinkerEmergency,
        VehicleSignal::BrakeLight,
        VehicleSignal::FrontLight,
        VehicleSignal::FogLight,
        VehicleSignal::HighBeam,
        VehicleSignal::BackDrive,
        VehicleSignal::Wiper,
        VehicleSignal::DoorOpenLeft,
        VehicleSignal::DoorOpenRight,
        VehicleSignal::EmergencyBlue,
        VehicleSignal::EmergencyRed,
        VehicleSignal::EmergencyYellow,
    ];

    pub fn bit(self) -> i32 {
        self as i32
    }

    /// Decode the simulator's signal bit field.
    pub fn from_bits(bits: i32) -> BTreeSet<VehicleSignal> {
        Self::ALL
            .iter()
            .copied()
            .filter(|signal| bits & signal.bit() != 0)
            .collect()
    }

    pub fn to_bits<'a, I: IntoIterator<Item = &'a VehicleSignal>>(signals: I) -> i32 {
        signals.into_iter().fold(0, |bits, signal| bits | signal.bit())
    }

    /// Parse the upper-case names used in trigger files (`BLINKER_LEFT`, ...).
    pub fn from_name(name: &str) -> Option<VehicleSignal> {
        let signal = match name {
            "BLINKER_RIGHT" => VehicleSignal::BlinkerRight,
            "BLINKER_LEFT" => VehicleSignal::BlinkerLeft,
            "BLINKER_EMERGENCY" => VehicleSignal::BlinkerEmergency,
            "BREAKLIGHT" | "BRAKELIGHT" => VehicleSignal::BrakeLight,
            "FRONTLIGHT" => VehicleSignal::FrontLight,
            "FOGLIGHT" => VehicleSignal::FogLight,
            "HIGHBEAM" => VehicleSignal::HighBeam,
            "BACKDRIVE" => VehicleSignal::BackDrive,
            "WIPER" => VehicleSignal::Wiper,
            "DOOR_OPEN_LEFT" => VehicleSignal::DoorOpenLeft,
            "DOOR_OPEN_RIGHT" => VehicleSignal::DoorOpenRight,
            "EMERGENCY_BLUE" => VehicleSignal::EmergencyBlue,
            "EMERGENCY_RED" => VehicleSignal::EmergencyRed,
            "EMERGENCY_YELLOW" => VehicleSignal::EmergencyYellow,
            _ => return None,
        };
        Some(signal)
    }
}

/// Stop state flags of a vehicle, numbered like the simulator's bit field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum VehicleStopState {
    Stopped = 1,
    Parking = 2,
    Triggered = 4,
    ContainerTriggered = 8,
    AtBusStop = 16,
    AtContainerStop = 32,
    AtChargingStation = 64,
    AtParkingArea = 128,
}

impl VehicleStopState {
    pub const ALL: [VehicleStopState; 8] = [
        VehicleStopState::Stopped,
        VehicleStopState::Parking,
        VehicleStopState::Triggered,
        VehicleStopState::ContainerTriggered,
        VehicleStopState::AtBusStop,
        VehicleStopState::AtContainerStop,
        VehicleStopState::AtChargingStation,
        VehicleStopState::AtParkingArea,
    ];

    pub fn bit(self) -> i32 {
        self as i32
    }

    pub fn from_bits(bits: i32) -> BTreeSet<VehicleStopState> {
        Self::ALL
            .iter()
            .copied()
            .filter(|state| bits & state.bit() != 0)
            .collect()
    }
}

/// Different classes of vehicles reported to the peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VehicleClass {
    Undefined = 0,
    PassengerCar = 1,
    Truck = 2,
    Bicycle = 3,
}

impl VehicleClass {
    /// Map the simulator's vehicle class name onto the classes the peers know.
    pub fn from_sumo_class(class: &str) -> Self {
        match class {
            "passenger" => VehicleClass::PassengerCar,
            "truck" | "bus" => VehicleClass::Truck,
            "bicycle" => VehicleClass::Bicycle,
            _ => VehicleClass::Undefined,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            1 => VehicleClass::PassengerCar,
            2 => VehicleClass::Truck,
            3 => VehicleClass::Bicycle,
            _ => VehicleClass::Undefined,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for VehicleClass {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            VehicleClass::Undefined => write!(f, "undefined"),
            VehicleClass::PassengerCar => write!(f, "passenger car"),
            VehicleClass::Truck => write!(f, "truck"),
            VehicleClass::Bicycle => write!(f, "bicycle"),
        }
    }
}

/// Where a vehicle is, both on the road network and in cartesian coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Road segment (edge) id.
    pub road_id: String,
    /// Offset along the road segment.
    pub s_frac: f64,
    /// Lane index on the segment, -1 if unknown.
    pub lane_index: i32,
    pub x: f64,
    pub y: f64,
    /// Heading in degrees.
    pub angle: f64,
    pub height: f64,
    pub slope: f64,
}

impl Position {
    /// Position with only cartesian coordinates set.
    pub fn at(x: f64, y: f64) -> Self {
        Self {
            road_id: String::new(),
            s_frac: 0.0,
            lane_index: 0,
            x,
            y,
            angle: 0.0,
            height: 0.0,
            slope: 0.0,
        }
    }

    pub fn distance_to(&self, other: &Position) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// Snapshot of one vehicle at one simulation step.
///
/// Never mutated after construction; a newer snapshot with the same `id`
/// replaces it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: String,
    pub position: Position,
    /// Speed in m/s.
    pub speed: f64,
    pub route: Option<String>,
    pub signals: BTreeSet<VehicleSignal>,
    pub vehicle_class: VehicleClass,
    pub stop_states: BTreeSet<VehicleStopState>,
}

impl Vehicle {
    /// A vehicle at `(x, y)` with everything else defaulted.
    pub fn new(id: impl Into<String>, x: f64, y: f64) -> Self {
        Self {
            id: id.into(),
            position: Position::at(x, y),
            speed: 0.0,
            route: None,
            signals: BTreeSet::new(),
            vehicle_class: VehicleClass::PassengerCar,
            stop_states: BTreeSet::new(),
        }
    }

    pub fn distance_to(&self, other: &Vehicle) -> f64 {
        self.position.distance_to(&other.position)
    }
}

/// How an ego vehicle is placed when it is moved to the reported coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteFidelity {
    /// Free positioning, the route is kept if possible (simulator keep-route 0).
    Free,
    /// Positioning constrained to the lane network of the route (keep-route 1).
    LaneNetwork,
    /// Fully free, routes are ignored (keep-route 2).
    Unrouted,
}

impl RouteFidelity {
    pub fn from_keep_route(mode: u8) -> Option<Self> {
        match mode {
            0 => Some(RouteFidelity::Free),
            1 => Some(RouteFidelity::LaneNetwork),
            2 => Some(RouteFidelity::Unrouted),
            _ => None,
        }
    }

    pub fn keep_route(self) -> u8 {
        match self {
            RouteFidelity::Free => 0,
            RouteFidelity::LaneNetwork => 1,
            RouteFidelity::Unrouted => 2,
        }
    }
}

/// How ego vehicles are inserted into and kept in the traffic simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EgoVehicleConfig {
    pub vehicle_type: String,
    pub route_id: String,
    pub route_fidelity: RouteFidelity,
}
