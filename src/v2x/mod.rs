pub mod coordinator;
pub mod load_control;
pub mod transport;

#[cfg(test)]
pub mod mock;

pub use coordinator::{NetworkSimCoordinator, V2xConfig, V2xError};
pub use transport::{AmqpReqRep, ReqRepTransport, TransportError};
