// simulation_engine/mod.rs
pub mod channel;
pub mod control;
pub mod coordinator;
pub mod spawning;
pub mod traci_client;
pub mod traci_constants;
pub mod traci_storage;
pub mod triggers;

#[cfg(test)]
pub mod mock;

pub use channel::{ChannelError, SimulationChannel};
pub use control::{ControlConnection, TraciError};
pub use coordinator::{TrafficCoordinator, TrafficError};
pub use traci_client::TraciClient;
pub use triggers::TriggerCollection;
