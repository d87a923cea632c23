use clap::Parser;
use evi::communication::id_mapper::{IdMapper, SharedIdMapper};
use evi::control_system::{
    DatagramServer, EgoVehicleUpdateHandler, HorizonDummyHandler, RequestDispatcher, RequestHandler,
};
use evi::monitoring::EventTracer;
use evi::simulation_engine::{SimulationChannel, TraciClient, TrafficCoordinator, TriggerCollection};
use evi::v2x::{AmqpReqRep, NetworkSimCoordinator};
use evi::{EviArgs, EviError};
use std::process::ExitCode;
use std::sync::{Arc, PoisonError};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> ExitCode {
    let args = EviArgs::parse();
    env_logger::Builder::new()
        .filter_level(args.verbosity)
        .parse_default_env()
        .init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: EviArgs) -> Result<(), EviError> {
    let tracer = EventTracer::shared(args.event_trace_file.is_some());
    let ids = IdMapper::shared();
    ids.lock()
        .unwrap_or_else(PoisonError::into_inner)
        .prime(args.ego_ids.iter().map(String::as_str));

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("Interrupted, shutting down.");
                shutdown.cancel();
            }
        });
    }

    let triggers = args
        .triggers_file
        .as_deref()
        .map(TriggerCollection::load)
        .transpose()?;
    let client = TraciClient::connect(&args.sumo_host, args.sumo_port)?;
    let channel = Arc::new(SimulationChannel::open(client)?);
    let mut sumo = TrafficCoordinator::new(channel, args.ego_config(), triggers, tracer.clone()).await?;
    sumo.subscribe_to_trafficlights(None).await?;
    sumo.warm_up_traffic(args.start_time_ms).await?;

    let v2x = match args.v2x_config() {
        Some(config) => {
            let network = sumo.network_init_data().await?;
            log::info!("Connecting to V2X simulator at {}", args.v2x_url);
            let transport = AmqpReqRep::connect(&args.v2x_url, &args.v2x_queue).await?;
            let coordinator = NetworkSimCoordinator::init(
                transport,
                config,
                args.start_time_ms,
                &network,
                ids.clone(),
                tracer.clone(),
            )
            .await?;
            Some(coordinator)
        }
        None => None,
    };

    let ego_handler = Arc::new(EgoVehicleUpdateHandler::new(
        sumo,
        v2x,
        args.ego_handler_config(),
        ids.clone(),
        shutdown.clone(),
        tracer.clone(),
    ));
    let handlers: Vec<Arc<dyn RequestHandler>> = vec![ego_handler.clone(), Arc::new(HorizonDummyHandler)];
    let dispatcher = Arc::new(RequestDispatcher::new(handlers, shutdown.clone(), tracer.clone()));

    let served = match DatagramServer::bind(
        ("0.0.0.0", args.evi_port),
        dispatcher,
        args.server_config(),
        tracer.clone(),
    )
    .await
    {
        Ok(server) => server.serve().await,
        Err(err) => Err(err),
    };
    shutdown.cancel();

    let torn_down = ego_handler.teardown().await;
    write_outputs(&args, &ids, &tracer)?;
    served?;
    torn_down?;
    log::info!("Shutdown complete.");
    Ok(())
}

fn write_outputs(args: &EviArgs, ids: &SharedIdMapper, tracer: &EventTracer) -> Result<(), EviError> {
    if let Some(path) = &args.write_id_mapping_file {
        ids.lock().unwrap_or_else(PoisonError::into_inner).write_dump(path)?;
    }
    if let Some(path) = &args.event_trace_file {
        tracer.write(path)?;
    }
    Ok(())
}
