pub mod event_tracer;

pub use event_tracer::{EventTracer, SharedTracer};
