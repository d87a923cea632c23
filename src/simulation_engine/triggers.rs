//! Trigger file: spatial triggers and the simulation events they fire.

use crate::global_variables::{INVALID_DOUBLE, TRIGGERS_DEFAULT_VEHICLE_TYPE, TRIGGERS_MAX_RADIUS};
use crate::models::VehicleSignal;
use crate::simulation_engine::control::{ControlConnection, StopRequest, TraciError, VehicleInsertion};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("cannot open trigger file: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed trigger file: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("unknown signal '{name}' in trigger {index}")]
    UnknownSignal { index: usize, name: String },
}

/// A simulator parameter given either as a number or as a keyword like `"max"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Param {
    Number(f64),
    Keyword(String),
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Param::Number(value) => write!(f, "{}", value),
            Param::Keyword(keyword) => write!(f, "{}", keyword),
        }
    }
}

impl From<&str> for Param {
    fn from(keyword: &str) -> Self {
        Param::Keyword(keyword.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    pub triggers_max_radius: f64,
    pub default_vehicle_type: String,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        TriggerConfig {
            triggers_max_radius: TRIGGERS_MAX_RADIUS,
            default_vehicle_type: TRIGGERS_DEFAULT_VEHICLE_TYPE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerCollection {
    #[serde(default)]
    pub config: TriggerConfig,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
}

impl TriggerCollection {
    pub fn load(path: &Path) -> Result<Self, TriggerError> {
        let collection: TriggerCollection = serde_yaml::from_reader(File::open(path)?)?;
        collection.validate()?;
        log::info!(
            "Loaded {} triggers from {}",
            collection.triggers.len(),
            path.display()
        );
        Ok(collection)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, TriggerError> {
        let collection: TriggerCollection = serde_yaml::from_str(yaml)?;
        collection.validate()?;
        Ok(collection)
    }

    pub fn save(&self, path: &Path) -> Result<(), TriggerError> {
        serde_yaml::to_writer(File::create(path)?, self)?;
        Ok(())
    }

    fn validate(&self) -> Result<(), TriggerError> {
        for (index, trigger) in self.triggers.iter().enumerate() {
            for event in &trigger.signals {
                if let Some(name) = event
                    .set_signals
                    .iter()
                    .find(|name| VehicleSignal::from_name(name).is_none())
                {
                    return Err(TriggerError::UnknownSignal {
                        index,
                        name: name.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// A point that fires its events once an ego vehicle comes within its radius.
///
/// The point is `ego_xy` if given, otherwise `ego_edge_pos` metres along `ego_edge`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_radius: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ego_xy: Option<(f64, f64)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ego_edge: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ego_edge_pos: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub spawn: Vec<SpawnEvent>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resume: Vec<ResumeEvent>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signals: Vec<SignalEvent>,
}

/// Everything an event needs to know about the moment it fires.
pub struct EventContext<'a> {
    pub now_s: f64,
    pub default_vehicle_type: &'a str,
    /// Unique per firing, used to name generated routes and vehicles.
    pub dyn_id: String,
}

impl Trigger {
    pub fn radius(&self, max_radius: f64) -> f64 {
        self.trigger_radius.unwrap_or(max_radius)
    }

    pub fn label(&self) -> &str {
        self.note.as_deref().unwrap_or("<no note>")
    }

    /// Apply all events in file order: spawns, then resumes, then signals.
    pub fn apply<C: ControlConnection + ?Sized>(
        &self,
        connection: &mut C,
        context: &EventContext<'_>,
    ) -> Result<(), TraciError> {
        for event in &self.spawn {
            event.apply(connection, context)?;
        }
        for event in &self.resume {
            event.apply(connection)?;
        }
        for event in &self.signals {
            event.apply(connection)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StopWaypoint {
    pub edge: String,
    pub end_pos: f64,
    pub lane_index: u8,
    /// Seconds, the simulator's invalid value if unset.
    pub duration: f64,
    pub start_pos: f64,
    pub until: f64,
}

impl Default for StopWaypoint {
    fn default() -> Self {
        StopWaypoint {
            edge: String::new(),
            end_pos: 1.0,
            lane_index: 0,
            duration: INVALID_DOUBLE,
            start_pos: INVALID_DOUBLE,
            until: INVALID_DOUBLE,
        }
    }
}

impl StopWaypoint {
    fn to_request(&self) -> StopRequest {
        StopRequest {
            edge: self.edge.clone(),
            end_pos: self.end_pos,
            lane_index: self.lane_index,
            duration: self.duration,
            flags: 0,
            start_pos: self.start_pos,
            until: self.until,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawnEvent {
    pub num_vehicles: u32,
    pub route_id: Option<String>,
    pub vehicle_id: Option<String>,
    pub vehicle_type: Option<String>,
    /// Depart relative to the firing time; takes precedence over `depart_time_seconds`.
    pub depart_delay_seconds: Option<f64>,
    pub depart_time_seconds: Option<f64>,
    /// Creates the route `route_id` (or a generated one) when non-empty.
    pub route_edges: Vec<String>,
    pub depart_pos: Param,
    pub depart_lane: Param,
    pub depart_speed: Param,
    pub arrival_lane: Param,
    pub arrival_pos: Param,
    pub arrival_speed: Param,
    pub stops: Vec<StopWaypoint>,
}

impl Default for SpawnEvent {
    fn default() -> Self {
        SpawnEvent {
            num_vehicles: 1,
            route_id: None,
            vehicle_id: None,
            vehicle_type: None,
            depart_delay_seconds: None,
            depart_time_seconds: None,
            route_edges: Vec::new(),
            depart_pos: "base".into(),
            depart_lane: "first".into(),
            depart_speed: Param::Number(0.0),
            arrival_lane: "current".into(),
            arrival_pos: "max".into(),
            arrival_speed: "current".into(),
            stops: Vec::new(),
        }
    }
}

impl SpawnEvent {
    pub fn vehicle_ids(&self, dyn_id: &str) -> Vec<String> {
        (0..self.num_vehicles)
            .map(|i| match &self.vehicle_id {
                Some(id) if self.num_vehicles > 1 => format!("{}_{}", id, i),
                Some(id) => id.clone(),
                None => format!("dyn_vehicle_{}_{}", dyn_id, i),
            })
            .collect()
    }

    fn depart(&self, now_s: f64) -> String {
        match (self.depart_delay_seconds, self.depart_time_seconds) {
            (Some(delay), _) => (now_s + delay).to_string(),
            (None, Some(time)) => time.to_string(),
            (None, None) => "now".to_string(),
        }
    }

    /// Insert the configured vehicles with their stops.
    ///
    /// A rejected insertion is logged and the remaining vehicles are still tried.
    pub fn apply<C: ControlConnection + ?Sized>(
        &self,
        connection: &mut C,
        context: &EventContext<'_>,
    ) -> Result<(), TraciError> {
        let route_id = self
            .route_id
            .clone()
            .unwrap_or_else(|| format!("dyn_route_{}", context.dyn_id));
        if !self.route_edges.is_empty() {
            connection.add_route(&route_id, &self.route_edges)?;
        }

        let insertion = VehicleInsertion {
            route_id: route_id.clone(),
            type_id: self
                .vehicle_type
                .clone()
                .unwrap_or_else(|| context.default_vehicle_type.to_string()),
            depart: self.depart(context.now_s),
            depart_lane: self.depart_lane.to_string(),
            depart_pos: self.depart_pos.to_string(),
            depart_speed: self.depart_speed.to_string(),
            arrival_lane: self.arrival_lane.to_string(),
            arrival_pos: self.arrival_pos.to_string(),
            arrival_speed: self.arrival_speed.to_string(),
        };

        for vehicle_id in self.vehicle_ids(&context.dyn_id) {
            log::info!("Spawning vehicle {} with {:?}", vehicle_id, insertion);
            match connection.add_vehicle(&vehicle_id, &insertion) {
                Ok(()) => {}
                Err(err) if err.is_rejection() => {
                    log::warn!("Could not spawn vehicle \"{}\": {}", vehicle_id, err);
                    continue;
                }
                Err(err) => return Err(err),
            }
            for stop in &self.stops {
                connection.set_stop(&vehicle_id, &stop.to_request())?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeEvent {
    pub vehicle_id: String,
}

impl ResumeEvent {
    pub fn apply<C: ControlConnection + ?Sized>(&self, connection: &mut C) -> Result<(), TraciError> {
        match connection.resume(&self.vehicle_id) {
            Err(err) if err.is_rejection() => {
                log::warn!("Could not resume vehicle \"{}\": {}", self.vehicle_id, err);
                Ok(())
            }
            other => other,
        }
    }
}

/// Replace the signals of a vehicle; an empty list switches all of them off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEvent {
    pub vehicle_id: String,
    #[serde(default)]
    pub set_signals: Vec<String>,
}

impl SignalEvent {
    pub fn bits(&self) -> i32 {
        let signals: Vec<VehicleSignal> = self
            .set_signals
            .iter()
            .filter_map(|name| VehicleSignal::from_name(name))
            .collect();
        VehicleSignal::to_bits(&signals)
    }

    pub fn apply<C: ControlConnection + ?Sized>(&self, connection: &mut C) -> Result<(), TraciError> {
        log::info!("Setting signals {:?} for {}", self.set_signals, self.vehicle_id);
        match connection.set_signals(&self.vehicle_id, self.bits()) {
            Err(err) if err.is_rejection() => {
                log::warn!("Could not set signals for vehicle \"{}\": {}", self.vehicle_id, err);
                Ok(())
            }
            other => other,
        }
    }
}
