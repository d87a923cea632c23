use crate::simulation_engine::control::{ControlConnection, Domain, SubscriptionResults, TraciError};
use crate::simulation_engine::traci_constants::VAR_TIME;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error(transparent)]
    Traci(#[from] TraciError),
    #[error("failed to start step worker: {0}")]
    Worker(std::io::Error),
    #[error("step worker is gone")]
    WorkerLost,
    #[error("simulation time missing from step results")]
    MissingTime,
}

impl ChannelError {
    /// True if the simulator rejected the command but the channel is intact.
    pub fn is_rejection(&self) -> bool {
        matches!(self, ChannelError::Traci(err) if err.is_rejection())
    }
}

type Job = Box<dyn FnOnce() + Send>;

/// Serialized access to the traffic simulator.
///
/// Every command holds the connection lock for its whole duration; tokio's
/// mutex is fair, so commands reach the simulator in the order they were
/// issued. Simulation steps run on a dedicated worker thread so the async
/// runtime keeps serving other tasks while the simulator computes.
pub struct SimulationChannel<C: ControlConnection> {
    connection: Arc<Mutex<C>>,
    worker: std::sync::Mutex<Option<mpsc::Sender<Job>>>,
    time_ms: AtomicI64,
    api_version: i32,
    simulator_version: String,
}

impl<C: ControlConnection> SimulationChannel<C> {
    /// Query the version, subscribe to the simulation time and start the step worker.
    pub fn open(mut connection: C) -> Result<Self, ChannelError> {
        let (api_version, simulator_version) = connection.get_version()?;
        if api_version < 18 {
            log::warn!(
                "TraCI API {} uses integer milliseconds for time, expect wrong step targets",
                api_version
            );
        }
        connection.subscribe(Domain::Simulation, "", &[VAR_TIME])?;

        let (sender, receiver) = mpsc::channel::<Job>();
        thread::Builder::new()
            .name("traci-step".to_string())
            .spawn(move || {
                for job in receiver {
                    job();
                }
                log::debug!("TraCI step worker stopped");
            })
            .map_err(ChannelError::Worker)?;

        Ok(SimulationChannel {
            connection: Arc::new(Mutex::new(connection)),
            worker: std::sync::Mutex::new(Some(sender)),
            time_ms: AtomicI64::new(0),
            api_version,
            simulator_version,
        })
    }

    pub fn api_version(&self) -> i32 {
        self.api_version
    }

    pub fn simulator_version(&self) -> &str {
        &self.simulator_version
    }

    /// Last simulated time seen, in milliseconds. Never blocks.
    pub fn time_ms(&self) -> i64 {
        self.time_ms.load(Ordering::SeqCst)
    }

    /// Run commands under the connection lock.
    pub async fn exec<R>(
        &self,
        commands: impl FnOnce(&mut C) -> Result<R, TraciError>,
    ) -> Result<R, ChannelError> {
        let mut connection = self.connection.lock().await;
        Ok(commands(&mut connection)?)
    }

    pub async fn subscription_results(&self, domain: Domain) -> SubscriptionResults {
        self.connection.lock().await.subscription_results(domain)
    }

    /// Step the simulation to `target_ms` (one step if `None`) and read back the time.
    pub async fn simulate_step(&self, target_ms: Option<i64>) -> Result<i64, ChannelError> {
        let target_s = target_ms.unwrap_or(0) as f64 / 1000.0;
        let mut connection = self.connection.clone().lock_owned().await;
        let (done, result) = oneshot::channel();
        let job: Job = Box::new(move || {
            let stepped = connection
                .simulation_step(target_s)
                .map_err(ChannelError::from)
                .and_then(|_| read_time_ms(&connection.subscription_results(Domain::Simulation)));
            let _ = done.send(stepped);
        });
        {
            let worker = self.worker.lock().map_err(|_| ChannelError::WorkerLost)?;
            let sender = worker.as_ref().ok_or(ChannelError::WorkerLost)?;
            sender.send(job).map_err(|_| ChannelError::WorkerLost)?;
        }
        let time_ms = result.await.map_err(|_| ChannelError::WorkerLost)??;
        self.time_ms.store(time_ms, Ordering::SeqCst);
        Ok(time_ms)
    }

    /// Disconnect from the simulator and stop the step worker.
    ///
    /// Transport failures are logged and swallowed.
    pub async fn close(&self) -> Result<(), ChannelError> {
        log::debug!("Shutting down SUMO connection.");
        let mut connection = match self.connection.try_lock() {
            Ok(connection) => connection,
            Err(_) => {
                log::warn!("TraCI access lock is locked on close attempt!");
                self.connection.lock().await
            }
        };
        if let Ok(mut worker) = self.worker.lock() {
            worker.take();
        }
        match connection.close() {
            Ok(()) => Ok(()),
            Err(err @ TraciError::Command { .. }) => Err(err.into()),
            Err(err) => {
                log::warn!("Sumo shutdown raised an error: {}", err);
                Ok(())
            }
        }
    }
}

fn read_time_ms(results: &SubscriptionResults) -> Result<i64, ChannelError> {
    results
        .get("")
        .and_then(|values| values.get(&VAR_TIME))
        .and_then(|value| value.as_f64())
        .map(|time_s| (time_s * 1000.0).round() as i64)
        .ok_or(ChannelError::MissingTime)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation_engine::mock::MockConnection;
    use std::time::Duration;

    #[tokio::test]
    async fn step_reads_time_from_subscription() {
        let mock = MockConnection::new();
        let channel = SimulationChannel::open(mock.clone()).unwrap();
        assert_eq!(channel.time_ms(), 0);
        assert_eq!(channel.simulate_step(None).await.unwrap(), 100);
        assert_eq!(channel.simulate_step(Some(1000)).await.unwrap(), 1000);
        assert_eq!(channel.time_ms(), 1000);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn commands_wait_for_running_step() {
        let mock = MockConnection::new();
        mock.set_step_delay(Duration::from_millis(50));
        mock.add_traffic("veh", 0.0, 0.0);
        let channel = Arc::new(SimulationChannel::open(mock.clone()).unwrap());

        let stepping = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.simulate_step(None).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        channel.exec(|c| c.set_speed("veh", 1.0)).await.unwrap();
        stepping.await.unwrap().unwrap();

        let log = mock.command_log();
        let step = log.iter().position(|c| c == "step").unwrap();
        let speed = log.iter().position(|c| c == "speed veh").unwrap();
        assert!(step < speed);
    }

    #[tokio::test]
    async fn close_swallows_transport_errors() {
        let mock = MockConnection::new();
        mock.fail_close();
        let channel = SimulationChannel::open(mock.clone()).unwrap();
        channel.close().await.unwrap();
        assert!(matches!(
            channel.simulate_step(None).await,
            Err(ChannelError::WorkerLost)
        ));
    }
}
