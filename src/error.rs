use crate::communication::id_mapper::IdMapError;
use crate::control_system::{HandlerError, ServerError};
use crate::simulation_engine::triggers::TriggerError;
use crate::simulation_engine::{ChannelError, TraciError, TrafficError};
use crate::v2x::{TransportError, V2xError};
use thiserror::Error;

/// Everything that can stop the daemon.
#[derive(Debug, Error)]
pub enum EviError {
    #[error("cannot connect to SUMO: {0}")]
    Traci(#[from] TraciError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Traffic(#[from] TrafficError),
    #[error(transparent)]
    Triggers(#[from] TriggerError),
    #[error("cannot connect to the V2X simulator: {0}")]
    Transport(#[from] TransportError),
    #[error(transparent)]
    V2x(#[from] V2xError),
    #[error(transparent)]
    Handler(#[from] HandlerError),
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error(transparent)]
    IdMap(#[from] IdMapError),
    #[error("failed to write event trace: {0}")]
    Io(#[from] std::io::Error),
}
