use crate::config::{ConfigError, SchedulerSettings};
use crate::executor::Executor;
use crate::probe::Prober;
use crate::state::RunState;
use futures::FutureExt;
use log::{debug, error, info};
use probe_data::{Outcome, ProbeResult, TestVector};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Rate of recorded results over one status interval and the naive linear ETA.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Throughput {
    pub rate: f64,
    /// `None` while nothing gets recorded.
    pub eta: Option<Duration>,
}

impl Throughput {
    pub fn measure(recorded: usize, elapsed: Duration, remaining: usize) -> Self {
        let seconds = elapsed.as_secs_f64();
        let rate = if seconds > 0.0 {
            recorded as f64 / seconds
        } else {
            0.0
        };

        let eta = if remaining == 0 {
            Some(Duration::ZERO)
        } else if rate > 0.0 {
            Some(Duration::from_secs_f64(remaining as f64 / rate))
        } else {
            None
        };

        Self { rate, eta }
    }
}

pub fn format_eta(eta: Option<Duration>) -> String {
    match eta {
        None => "(infinite)".to_string(),
        Some(eta) => {
            let total = eta.as_secs();
            format!(
                "{} days, {:02}:{:02}:{:02}",
                total / 86400,
                total % 86400 / 3600,
                total % 3600 / 60,
                total % 60
            )
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    pub recorded: usize,
    pub remaining: usize,
    pub outcomes: BTreeMap<&'static str, usize>,
    pub interrupted: bool,
    pub saved: bool,
    pub elapsed: Duration,
}

impl Display for Summary {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Recorded {} results", self.recorded)?;
        if !self.outcomes.is_empty() {
            let counts = self
                .outcomes
                .iter()
                .map(|(name, count)| format!("{}: {}", name, count))
                .collect::<Vec<_>>()
                .join(", ");
            write!(f, " ({})", counts)?;
        }
        write!(f, " in {:.1}s", self.elapsed.as_secs_f64())?;
        if self.remaining > 0 {
            write!(f, ", {} left for the next run", self.remaining)?;
        }
        if !self.saved {
            write!(f, ", final checkpoint NOT saved")?;
        }
        Ok(())
    }
}

/// Drives a fixed pool of workers over the shared run state.
pub struct Scheduler<E> {
    prober: Arc<Prober<E>>,
    state: Arc<RunState>,
    settings: SchedulerSettings,
}

impl<E: Executor + 'static> Scheduler<E> {
    pub fn new(
        prober: Prober<E>,
        state: Arc<RunState>,
        settings: SchedulerSettings,
    ) -> Result<Self, ConfigError> {
        settings.validate()?;
        Ok(Self {
            prober: Arc::new(prober),
            state,
            settings,
        })
    }

    /// Runs until the queue is exhausted or Ctrl-C is pressed.
    pub async fn run(self) -> Summary {
        self.run_until(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Interrupted, waiting for the running probes"),
                Err(e) => {
                    error!("Failed to listen for Ctrl-C: {:?}", e);
                    // without a handler the run only ends with the queue
                    futures::future::pending::<()>().await;
                }
            }
        })
        .await
    }

    /// Runs until the queue is exhausted or `shutdown` resolves. Probes already running
    /// are recorded either way and the final checkpoint is always attempted.
    pub async fn run_until<S>(self, shutdown: S) -> Summary
    where
        S: Future<Output = ()> + Send + 'static,
    {
        let started = Instant::now();
        let progress = self.state.progress();
        info!(
            "Probing {} vectors with {} workers, {} already recorded",
            progress.pending, self.settings.workers, progress.recorded
        );

        let shutdown = {
            let state = self.state.clone();
            tokio::spawn(async move {
                shutdown.await;
                state.drain();
            })
        };
        let checkpoint = self.spawn_checkpoints();
        let status = self.spawn_status();

        let workers: Vec<JoinHandle<usize>> = (0..self.settings.workers)
            .map(|id| tokio::spawn(worker(id, self.prober.clone(), self.state.clone())))
            .collect();

        for handle in workers {
            if let Err(e) = handle.await {
                error!("Worker failed: {:?}", e);
            }
        }

        let interrupted = self.state.is_draining();
        shutdown.abort();
        checkpoint.abort();
        status.abort();

        let saved = save_checkpoint(self.state.clone(), self.settings.checkpoint_path.clone())
            .await
            .is_some();

        let progress = self.state.progress();
        Summary {
            recorded: progress.recorded,
            remaining: progress.remaining(),
            outcomes: self.state.outcome_counts(),
            interrupted,
            saved,
            elapsed: started.elapsed(),
        }
    }

    fn spawn_checkpoints(&self) -> JoinHandle<()> {
        let state = self.state.clone();
        let path = self.settings.checkpoint_path.clone();
        let period = self.settings.checkpoint_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // the first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                save_checkpoint(state.clone(), path.clone()).await;
            }
        })
    }

    fn spawn_status(&self) -> JoinHandle<()> {
        let state = self.state.clone();
        let period = self.settings.status_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            let mut last_recorded = state.progress().recorded;
            let mut last_time = Instant::now();

            loop {
                interval.tick().await;
                let progress = state.progress();
                let now = Instant::now();
                let throughput = Throughput::measure(
                    progress.recorded.saturating_sub(last_recorded),
                    now - last_time,
                    progress.remaining(),
                );
                last_recorded = progress.recorded;
                last_time = now;

                info!(
                    "Status: {}/{} recorded, {} in flight, {:.2} vectors/s, ETA {}",
                    progress.recorded,
                    progress.total(),
                    progress.in_flight,
                    throughput.rate,
                    format_eta(throughput.eta)
                );
            }
        })
    }
}

async fn worker<E: Executor + 'static>(
    id: usize,
    prober: Arc<Prober<E>>,
    state: Arc<RunState>,
) -> usize {
    let mut probed = 0;

    while let Some(vector) = state.next_vector() {
        let result = match AssertUnwindSafe(prober.probe(vector)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => panicked(vector, panic),
        };
        info!("{}", result);
        state.record(result);
        probed += 1;
    }

    debug!("Worker {} done after {} vectors", id, probed);
    probed
}

fn panicked(vector: TestVector, panic: Box<dyn Any + Send>) -> ProbeResult {
    let message = if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    };

    error!("Probing {} panicked: {}", vector, message);
    ProbeResult::new(
        vector,
        Outcome::weird(format!("Probe panicked: {}", message), Vec::new()),
        Vec::new(),
    )
}

/// Writes a full checkpoint off the async threads; failures are logged, never fatal.
async fn save_checkpoint(state: Arc<RunState>, path: PathBuf) -> Option<usize> {
    let target = path.clone();
    match tokio::task::spawn_blocking(move || state.checkpoint(&target)).await {
        Ok(Ok(count)) => {
            info!("Saved {} results to {:?}", count, path);
            Some(count)
        }
        Ok(Err(e)) => {
            error!("Failed to save the checkpoint to {:?}: {:?}", path, e);
            None
        }
        Err(e) => {
            error!("Checkpoint task failed: {:?}", e);
            None
        }
    }
}
