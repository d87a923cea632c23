pub mod traffic_light;
pub mod vehicle;

pub use traffic_light::{SignalState, TrafficLight};
pub use vehicle::{
    vehicle_set, EgoVehicleConfig, Position, RouteFidelity, Vehicle, VehicleClass, VehicleSet,
    VehicleSignal, VehicleStopState,
};
