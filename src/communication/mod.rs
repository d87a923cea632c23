pub mod framing;
pub mod id_mapper;
pub mod messages;

pub use id_mapper::{IdMapper, SharedIdMapper};
pub use messages::{Message, MessageBody, MessageError};
