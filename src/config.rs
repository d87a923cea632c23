use crate::control_system::{EgoHandlerConfig, ServerConfig};
use crate::filtering::FellowSelection;
use crate::global_variables::*;
use crate::models::{EgoVehicleConfig, RouteFidelity};
use crate::v2x::V2xConfig;
use clap::Parser;
use log::LevelFilter;
use std::path::PathBuf;
use std::time::Duration;

/// Command line of the `evid` daemon. Every option can also be set through
/// its `EVI_*` environment variable.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "evid",
    version,
    about = "Ego vehicle interface between real-time front-ends, SUMO and a V2X simulator"
)]
pub struct EviArgs {
    // SUMO connection
    #[arg(long, env = "EVI_SUMO_HOST", default_value = SUMO_HOST)]
    pub sumo_host: String,

    #[arg(long, env = "EVI_SUMO_PORT", default_value_t = SUMO_PORT)]
    pub sumo_port: u16,

    /// Keep-route mode used when moving ego vehicles (0 free, 1 lane network, 2 unrouted)
    #[arg(
        long,
        env = "EVI_SUMO_KEEP_ROUTE",
        default_value_t = SUMO_KEEP_ROUTE,
        value_parser = clap::value_parser!(u8).range(0..=2)
    )]
    pub sumo_keep_route: u8,

    /// Simulation time to warm up to before serving peers
    #[arg(long, env = "EVI_START_TIME_MS", default_value_t = START_TIME_MS)]
    pub start_time_ms: i64,

    // Ego vehicles
    /// Ego ids mapped to the first integer ids, in order
    #[arg(long, env = "EVI_EGO_IDS", value_delimiter = ',', default_value = EGO_ID)]
    pub ego_ids: Vec<String>,

    #[arg(long, env = "EVI_EGO_TYPE", default_value = EGO_TYPE)]
    pub ego_type: String,

    #[arg(long, env = "EVI_EGO_ROUTE_NAME", default_value = EGO_ROUTE_NAME)]
    pub ego_route_name: String,

    /// YAML file with spatial triggers
    #[arg(long, env = "EVI_TRIGGERS_FILE")]
    pub triggers_file: Option<PathBuf>,

    // V2X simulator
    #[arg(long, env = "EVI_ENABLE_V2X")]
    pub enable_v2x: bool,

    #[arg(long, env = "EVI_V2X_URL", default_value = AMQP_URL)]
    pub v2x_url: String,

    #[arg(long, env = "EVI_V2X_QUEUE", default_value = QUEUE_V2X_REQUESTS)]
    pub v2x_queue: String,

    #[arg(long, env = "EVI_SYNC_INTERVAL_MS", default_value_t = SYNC_INTERVAL_MS,
          value_parser = clap::value_parser!(u64).range(1..))]
    pub sync_interval_ms: u64,

    #[arg(long, env = "EVI_V2X_MAX_VEHICLES")]
    pub v2x_max_vehicles: Option<usize>,

    #[arg(long, env = "EVI_V2X_FELLOW_FILTER", value_enum, default_value = V2X_FELLOW_FILTER)]
    pub v2x_fellow_filter: FellowSelection,

    /// Share of the sync interval the V2X exchange may take before the
    /// vehicle budget is adapted
    #[arg(long, env = "EVI_V2X_THRESHOLD")]
    pub v2x_threshold: Option<f64>,

    // Real-time peers
    #[arg(long, env = "EVI_PORT", default_value_t = EVI_PORT)]
    pub evi_port: u16,

    #[arg(long, env = "EVI_RT_MAX_VEHICLES")]
    pub rt_max_vehicles: Option<usize>,

    #[arg(long, env = "EVI_RT_FELLOW_FILTER", value_enum, default_value = RT_FELLOW_FILTER)]
    pub rt_fellow_filter: FellowSelection,

    /// Accept an update of an unknown ego as its registration
    #[arg(long, env = "EVI_REGISTER_FROM_UPDATE")]
    pub register_from_update: bool,

    #[arg(long, env = "EVI_RT_OVERRIDE_REMOTE_HOST")]
    pub rt_override_remote_host: Option<String>,

    #[arg(long, env = "EVI_RT_OVERRIDE_REMOTE_PORT")]
    pub rt_override_remote_port: Option<u16>,

    /// Number of front-end peers whose ego updates are merged per tick
    #[arg(long, env = "EVI_PEERS", default_value_t = 1,
          value_parser = clap::value_parser!(u64).range(1..))]
    pub peers: u64,

    // Logging and tracing
    #[arg(long, env = "EVI_VERBOSITY", default_value = "info")]
    pub verbosity: LevelFilter,

    #[arg(long, env = "EVI_EVENT_TRACE_FILE")]
    pub event_trace_file: Option<PathBuf>,

    #[arg(long, env = "EVI_WRITE_ID_MAPPING_FILE")]
    pub write_id_mapping_file: Option<PathBuf>,
}

impl EviArgs {
    pub fn ego_config(&self) -> EgoVehicleConfig {
        EgoVehicleConfig {
            vehicle_type: self.ego_type.clone(),
            route_id: self.ego_route_name.clone(),
            route_fidelity: RouteFidelity::from_keep_route(self.sumo_keep_route)
                .unwrap_or(RouteFidelity::LaneNetwork),
        }
    }

    pub fn ego_handler_config(&self) -> EgoHandlerConfig {
        EgoHandlerConfig {
            fellow_selection: self.rt_fellow_filter,
            max_vehicles: self.rt_max_vehicles,
            register_from_update: self.register_from_update,
        }
    }

    /// `None` unless the V2X simulator is enabled.
    pub fn v2x_config(&self) -> Option<V2xConfig> {
        if !self.enable_v2x {
            return None;
        }
        Some(V2xConfig {
            sync_interval: Duration::from_millis(self.sync_interval_ms),
            max_vehicles: self.v2x_max_vehicles,
            fellow_selection: self.v2x_fellow_filter,
            threshold: self.v2x_threshold,
        })
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            override_remote_host: self.rt_override_remote_host.clone(),
            override_remote_port: self.rt_override_remote_port,
            peers: self.peers as usize,
            aggregation_window: Duration::from_millis(PEER_AGGREGATION_WINDOW_MS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_the_constants() {
        let args = EviArgs::try_parse_from(["evid"]).unwrap();
        assert_eq!(args.evi_port, EVI_PORT);
        assert_eq!(args.sumo_host, SUMO_HOST);
        assert_eq!(args.ego_ids, vec![EGO_ID.to_string()]);
        assert_eq!(args.rt_fellow_filter, FellowSelection::EquallyDistributed);
        assert_eq!(args.verbosity, LevelFilter::Info);
        assert!(args.v2x_config().is_none());

        let ego = args.ego_config();
        assert_eq!(ego.route_fidelity, RouteFidelity::LaneNetwork);
        assert_eq!(ego.vehicle_type, EGO_TYPE);
        assert_eq!(args.server_config().peers, 1);
    }

    #[test]
    fn v2x_options_build_the_coordinator_config() {
        let args = EviArgs::try_parse_from([
            "evid",
            "--enable-v2x",
            "--sync-interval-ms",
            "50",
            "--v2x-max-vehicles",
            "12",
            "--v2x-fellow-filter",
            "round_robin",
            "--v2x-threshold",
            "0.5",
        ])
        .unwrap();
        let config = args.v2x_config().unwrap();
        assert_eq!(config.sync_interval, Duration::from_millis(50));
        assert_eq!(config.max_vehicles, Some(12));
        assert_eq!(config.fellow_selection, FellowSelection::RoundRobin);
        assert_eq!(config.threshold, Some(0.5));
    }

    #[test]
    fn peer_options_and_ego_list() {
        let args = EviArgs::try_parse_from([
            "evid",
            "--ego-ids",
            "ego-0,ego-1",
            "--peers",
            "2",
            "--rt-override-remote-port",
            "9000",
            "--sumo-keep-route",
            "2",
            "--verbosity",
            "debug",
        ])
        .unwrap();
        assert_eq!(args.ego_ids, vec!["ego-0", "ego-1"]);
        assert_eq!(args.server_config().peers, 2);
        assert_eq!(args.server_config().override_remote_port, Some(9000));
        assert_eq!(args.ego_config().route_fidelity, RouteFidelity::Unrouted);
        assert_eq!(args.verbosity, LevelFilter::Debug);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(EviArgs::try_parse_from(["evid", "--sumo-keep-route", "3"]).is_err());
        assert!(EviArgs::try_parse_from(["evid", "--peers", "0"]).is_err());
        assert!(EviArgs::try_parse_from(["evid", "--rt-fellow-filter", "nearest"]).is_err());
    }
}
