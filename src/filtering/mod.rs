pub mod selection;
pub mod traffic_filter;

pub use selection::FellowSelection;
pub use traffic_filter::{FellowChangeSet, TrafficFilter};
