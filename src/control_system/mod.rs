pub mod dispatcher;
pub mod handlers;
pub mod peer_aggregation;
pub mod protocol;

pub use dispatcher::{DispatchError, HandlerError, RequestDispatcher, RequestHandler};
pub use handlers::{EgoHandlerConfig, EgoVehicleUpdateHandler, HorizonDummyHandler};
pub use protocol::{DatagramServer, ServerConfig, ServerError};
