//! One-step-ahead pipelining.
//!
//! `advance` hands back the result of the previously scheduled step and
//! immediately schedules the next one. At most one step is in flight; the
//! state it works on travels into the spawned task and comes back with its
//! result, so a step can never start before the previous one returned.

use std::future::Future;
use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("background {name} step was lost: {source}")]
    Lost {
        name: &'static str,
        #[source]
        source: JoinError,
    },
    #[error("{0} pipeline is unusable after a lost step")]
    Poisoned(&'static str),
}

enum Slot<S, T> {
    Ready { state: S, result: T },
    Running(JoinHandle<(S, T)>),
}

pub struct Pipeline<S, T> {
    name: &'static str,
    slot: Option<Slot<S, T>>,
    stalls: u64,
}

impl<S, T> Pipeline<S, T>
where
    S: Send + 'static,
    T: Send + 'static,
{
    /// `initial` is what the very first `advance` returns.
    pub fn new(name: &'static str, state: S, initial: T) -> Self {
        Pipeline {
            name,
            slot: Some(Slot::Ready {
                state,
                result: initial,
            }),
            stalls: 0,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.slot, Some(Slot::Running(_)))
    }

    /// How often `advance` had to wait for an unfinished step.
    pub fn stalls(&self) -> u64 {
        self.stalls
    }

    async fn settle(&mut self) -> Result<(S, T), PipelineError> {
        match self.slot.take() {
            Some(Slot::Ready { state, result }) => Ok((state, result)),
            Some(Slot::Running(handle)) => {
                if !handle.is_finished() {
                    self.stalls += 1;
                    log::error!(
                        "Last {} step did not finish before next call to advance.",
                        self.name
                    );
                }
                handle.await.map_err(|source| PipelineError::Lost {
                    name: self.name,
                    source,
                })
            }
            None => Err(PipelineError::Poisoned(self.name)),
        }
    }

    /// Return the previous step's result and schedule `step` on its state.
    pub async fn advance<F, Fut>(&mut self, step: F) -> Result<T, PipelineError>
    where
        F: FnOnce(S) -> Fut,
        Fut: Future<Output = (S, T)> + Send + 'static,
    {
        let (state, result) = self.settle().await?;
        self.slot = Some(Slot::Running(tokio::spawn(step(state))));
        Ok(result)
    }

    /// Wait for any in-flight step and hand out its state.
    ///
    /// The step's result stays queued for the next `advance`.
    pub async fn state_mut(&mut self) -> Result<&mut S, PipelineError> {
        let (state, result) = self.settle().await?;
        self.slot = Some(Slot::Ready { state, result });
        match self.slot.as_mut() {
            Some(Slot::Ready { state, .. }) => Ok(state),
            _ => Err(PipelineError::Poisoned(self.name)),
        }
    }

    /// Wait for any in-flight step and make `result` what the next `advance` returns.
    pub async fn queue_result(&mut self, result: T) -> Result<(), PipelineError> {
        let (state, _) = self.settle().await?;
        self.slot = Some(Slot::Ready { state, result });
        Ok(())
    }

    /// Wait for any in-flight step and take the state back.
    pub async fn into_state(mut self) -> Result<(S, T), PipelineError> {
        self.settle().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn count_step(state: u32, delay_ms: u64) -> (u32, u32) {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        (state + 1, state * 10)
    }

    #[tokio::test(start_paused = true)]
    async fn first_advance_returns_initial_result() {
        let mut pipeline = Pipeline::new("test", 1u32, 0u32);
        assert_eq!(pipeline.advance(|s| count_step(s, 5)).await.unwrap(), 0);
        assert!(pipeline.is_running());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pipeline.advance(|s| count_step(s, 5)).await.unwrap(), 10);
        assert_eq!(pipeline.stalls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn early_advance_waits_and_counts_stall() {
        let mut pipeline = Pipeline::new("test", 1u32, 0u32);
        pipeline.advance(|s| count_step(s, 50)).await.unwrap();

        let started = tokio::time::Instant::now();
        let second = pipeline.advance(|s| count_step(s, 50)).await.unwrap();
        assert_eq!(second, 10);
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(pipeline.stalls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn state_mut_keeps_pending_result() {
        let mut pipeline = Pipeline::new("test", 1u32, 0u32);
        pipeline.advance(|s| count_step(s, 5)).await.unwrap();
        assert_eq!(*pipeline.state_mut().await.unwrap(), 2);
        assert_eq!(pipeline.advance(|s| count_step(s, 5)).await.unwrap(), 10);
        let (state, result) = pipeline.into_state().await.unwrap();
        assert_eq!((state, result), (3, 20));
    }

    async fn failing_step(_state: u32) -> (u32, u32) {
        panic!("step failed")
    }

    #[tokio::test]
    async fn panicking_step_poisons_pipeline() {
        let mut pipeline: Pipeline<u32, u32> = Pipeline::new("test", 1, 0);
        pipeline.advance(failing_step).await.unwrap();
        assert!(matches!(
            pipeline.advance(|s| count_step(s, 0)).await,
            Err(PipelineError::Lost { .. })
        ));
        assert!(matches!(
            pipeline.advance(|s| count_step(s, 0)).await,
            Err(PipelineError::Poisoned("test"))
        ));
    }
}
