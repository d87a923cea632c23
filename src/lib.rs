pub mod communication;
pub mod config;
pub mod control_system;
pub mod error;
pub mod filtering;
pub mod global_variables;
pub mod models;
pub mod monitoring;
pub mod pipeline;
pub mod shared_data;
pub mod simulation_engine;
pub mod v2x;

pub use config::EviArgs;
pub use error::EviError;
