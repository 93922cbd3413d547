use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::error::DpsmError;

/// Structured-concurrency stand-in for the fixed-size worker pool the design notes
/// describe: steps are spawned as `tokio` tasks gated by a 2-permit semaphore and
/// awaited through a cancellable timed race, rather than handed to a dedicated thread
/// pool. The width of 2 has no semantic meaning beyond headroom to submit a step while a
/// previous one is still being awaited down to its deadline; a single in-flight step is
/// the only thing ever actually running.
pub(crate) struct StepScheduler {
    permits: Arc<Semaphore>,
}

impl StepScheduler {
    pub(crate) fn new() -> Self {
        StepScheduler {
            permits: Arc::new(Semaphore::new(2)),
        }
    }

    /// Runs `fut` to completion or aborts it once `deadline` elapses, surfacing a
    /// [`DpsmError::Timeout`] tagged with `step_name` for logging.
    pub(crate) async fn run<F, T>(
        &self,
        step_name: &'static str,
        deadline: Duration,
        fut: F,
    ) -> Result<T, DpsmError>
    where
        F: Future<Output = Result<T, DpsmError>> + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .expect("step scheduler semaphore is never closed");

        let mut handle = tokio::spawn(async move {
            let _permit = permit;
            fut.await
        });

        tokio::select! {
            biased;
            joined = &mut handle => {
                match joined {
                    Ok(result) => result,
                    Err(join_err) => Err(DpsmError::TransportError(anyhow::anyhow!(
                        "{step_name} step did not run to completion: {join_err}"
                    ))),
                }
            }
            _ = tokio::time::sleep(deadline) => {
                handle.abort();
                log::warn!("{step_name} step exceeded its {} ms deadline", deadline.as_millis());
                Err(DpsmError::Timeout {
                    step: step_name,
                    elapsed_ms: deadline.as_millis() as u64,
                })
            }
        }
    }
}
