// src/shared_data.rs

use crate::communication::messages::{Message, MessageBody, VehicleCommand};
use crate::models::{TrafficLight, VehicleSet};
use serde::{Deserialize, Serialize};

/// A polygon of the road network, e.g. a building outline used for signal shadowing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polygon {
    pub id: String,
    pub polygon_type: String,
    pub shape: Vec<(f64, f64)>,
}

/// Static network geometry handed to the V2X simulator at session start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkInitData {
    /// Lower left and upper right corner.
    pub boundary: ((f64, f64), (f64, f64)),
    pub polygons: Vec<Polygon>,
}

/// Result of one traffic simulation step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrafficStep {
    /// Every non-ego vehicle in the simulation.
    pub traffic: VehicleSet,
    pub traffic_lights: Vec<TrafficLight>,
}

/// Commands the V2X simulator returned in one exchange.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct V2xResult {
    /// Visualization commands, passed on to the front-end untouched.
    pub visualization: Vec<serde_json::Value>,
    /// Vehicle commands, e.g. warnings received by an ego vehicle.
    pub vehicle: Vec<VehicleCommand>,
}

impl V2xResult {
    pub fn is_empty(&self) -> bool {
        self.visualization.is_empty() && self.vehicle.is_empty()
    }

    /// Collect the commands of one reply message, ignoring anything else.
    pub fn absorb(&mut self, message: &Message) {
        match &message.body {
            MessageBody::Visualization(visualization) => {
                self.visualization.extend(visualization.commands.iter().cloned())
            }
            MessageBody::Vehicle(vehicle) => self.vehicle.extend(vehicle.commands.iter().cloned()),
            _ => {}
        }
    }
}
