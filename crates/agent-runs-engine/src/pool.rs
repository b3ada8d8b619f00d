use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use agent_runs_contract::ContractRegistry;
use agent_runs_domain::{RunId, TenantId};
use agent_runs_store_core::{RunLedger, SubjectStateSource};
use anyhow::{anyhow, Context, Result};
use serde::Serialize;

use crate::{Clock, EngineConfig, RunEngine, TaskRegistry};

type Job = (TenantId, RunId, u32);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolOptions {
    /// Exit once nothing is due and nothing is in flight.
    pub drain: bool,
    pub max_duration: Option<Duration>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolReport {
    pub dispatched: usize,
    pub executed: usize,
    pub refused: usize,
    pub failed: usize,
    pub swept: usize,
}

#[derive(Default)]
struct Counters {
    dispatched: AtomicUsize,
    executed: AtomicUsize,
    refused: AtomicUsize,
    failed: AtomicUsize,
    swept: AtomicUsize,
}

impl Counters {
    fn report(&self) -> PoolReport {
        PoolReport {
            dispatched: self.dispatched.load(Ordering::SeqCst),
            executed: self.executed.load(Ordering::SeqCst),
            refused: self.refused.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            swept: self.swept.load(Ordering::SeqCst),
        }
    }
}

/// Bounded set of worker threads fed by a polling dispatcher.
///
/// Every worker opens its own ledger through the factory passed to
/// [`WorkerPool::run`]; the dispatcher uses one more for polling and sweeps.
pub struct WorkerPool<'a> {
    contracts: &'a ContractRegistry,
    tasks: &'a TaskRegistry,
    config: &'a EngineConfig,
    clock: &'a dyn Clock,
}

impl<'a> WorkerPool<'a> {
    #[must_use]
    pub fn new(
        contracts: &'a ContractRegistry,
        tasks: &'a TaskRegistry,
        config: &'a EngineConfig,
        clock: &'a dyn Clock,
    ) -> Self {
        Self {
            contracts,
            tasks,
            config,
            clock,
        }
    }

    /// Dispatch due runs until `stop` is set, `max_duration` passes, or (in
    /// drain mode) the queue is empty. In-flight runs finish before this returns.
    ///
    /// # Errors
    /// Returns an error when a ledger cannot be opened or polled, or a worker
    /// thread panics.
    pub fn run<L, F>(&self, open_ledger: F, stop: &AtomicBool, options: PoolOptions) -> Result<PoolReport>
    where
        L: RunLedger + SubjectStateSource,
        F: Fn() -> Result<L> + Sync,
    {
        let concurrency = usize::try_from(self.config.worker_concurrency)
            .unwrap_or(1)
            .max(1);
        let dispatcher_ledger = open_ledger().context("failed to open dispatcher ledger")?;
        let (sender, receiver) = sync_channel::<Job>(concurrency);
        let receiver = Mutex::new(receiver);
        let in_flight = Mutex::new(BTreeSet::new());
        let counters = Counters::default();
        let live_workers = AtomicUsize::new(concurrency);

        tracing::info!(concurrency, drain = options.drain, "worker pool starting");

        let report = std::thread::scope(|scope| {
            let mut handles = Vec::with_capacity(concurrency);
            for worker in 0..concurrency {
                let open_ledger = &open_ledger;
                let receiver = &receiver;
                let in_flight = &in_flight;
                let counters = &counters;
                let live_workers = &live_workers;
                handles.push(scope.spawn(move || {
                    let _live = LiveWorker(live_workers);
                    self.work(worker, open_ledger, receiver, in_flight, counters)
                }));
            }

            let dispatched = self.dispatch(
                &dispatcher_ledger,
                sender,
                &in_flight,
                &counters,
                &live_workers,
                stop,
                options,
            );

            let mut worker_error = None;
            for handle in handles {
                match handle.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        worker_error.get_or_insert(err);
                    }
                    Err(_) => {
                        worker_error.get_or_insert(anyhow!("worker thread panicked"));
                    }
                }
            }
            dispatched?;
            match worker_error {
                Some(err) => Err(err),
                None => Ok(counters.report()),
            }
        })?;

        tracing::info!(
            dispatched = report.dispatched,
            executed = report.executed,
            refused = report.refused,
            failed = report.failed,
            swept = report.swept,
            "worker pool stopped"
        );
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch<L>(
        &self,
        ledger: &L,
        sender: SyncSender<Job>,
        in_flight: &Mutex<BTreeSet<RunId>>,
        counters: &Counters,
        live_workers: &AtomicUsize,
        stop: &AtomicBool,
        options: PoolOptions,
    ) -> Result<()>
    where
        L: RunLedger + SubjectStateSource,
    {
        let engine = RunEngine::new(
            ledger,
            ledger,
            self.contracts,
            self.tasks,
            self.config,
            self.clock,
        );
        let batch = self.config.worker_concurrency.saturating_mul(4);
        let started = Instant::now();
        let mut last_sweep: Option<Instant> = None;

        loop {
            if stop.load(Ordering::SeqCst) {
                tracing::info!("stop requested");
                break;
            }
            if options
                .max_duration
                .is_some_and(|limit| started.elapsed() >= limit)
            {
                break;
            }
            if live_workers.load(Ordering::SeqCst) == 0 {
                return Err(anyhow!("every worker exited; no runs can be executed"));
            }

            if last_sweep.map_or(true, |at| at.elapsed() >= self.config.sweep_interval()) {
                let report = engine.sweep_stale_runs()?;
                counters.swept.fetch_add(report.swept.len(), Ordering::SeqCst);
                last_sweep = Some(Instant::now());
            }

            let due = ledger.list_due_runs(self.clock.now(), batch)?;
            for run in &due {
                if !lock(in_flight).insert(run.run_id) {
                    continue;
                }
                match sender.try_send((run.tenant_id, run.run_id, run.attempts.saturating_add(1))) {
                    Ok(()) => {
                        counters.dispatched.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(TrySendError::Full(_)) => {
                        lock(in_flight).remove(&run.run_id);
                        break;
                    }
                    Err(TrySendError::Disconnected(_)) => {
                        lock(in_flight).remove(&run.run_id);
                        return Err(anyhow!("worker channel closed"));
                    }
                }
            }

            if options.drain && due.is_empty() && lock(in_flight).is_empty() {
                tracing::info!("queue drained");
                break;
            }
            std::thread::sleep(self.config.poll_interval());
        }
        Ok(())
    }

    fn work<L, F>(
        &self,
        worker: usize,
        open_ledger: &F,
        jobs: &Mutex<Receiver<Job>>,
        in_flight: &Mutex<BTreeSet<RunId>>,
        counters: &Counters,
    ) -> Result<()>
    where
        L: RunLedger + SubjectStateSource,
        F: Fn() -> Result<L>,
    {
        let ledger =
            open_ledger().with_context(|| format!("worker {worker} failed to open its ledger"))?;
        let engine = RunEngine::new(
            &ledger,
            &ledger,
            self.contracts,
            self.tasks,
            self.config,
            self.clock,
        );

        loop {
            let job = lock(jobs).recv();
            let Ok((tenant_id, run_id, attempt)) = job else {
                break;
            };
            let _claim = InFlightClaim { in_flight, run_id };

            match engine.execute(tenant_id, run_id, attempt) {
                Ok(run) => {
                    counters.executed.fetch_add(1, Ordering::SeqCst);
                    tracing::debug!(
                        worker,
                        run_id = %run_id,
                        status = run.status.as_str(),
                        "run processed"
                    );
                }
                Err(err) if err.is_retryable() => {
                    counters.refused.fetch_add(1, Ordering::SeqCst);
                    tracing::debug!(worker, run_id = %run_id, error = %err, "run left queued");
                }
                Err(err) => {
                    counters.failed.fetch_add(1, Ordering::SeqCst);
                    tracing::warn!(worker, run_id = %run_id, error = %err, "run execution failed");
                }
            }
        }
        Ok(())
    }
}

/// Releases a dispatched run id when its worker is done with it, even on unwind.
struct InFlightClaim<'a> {
    in_flight: &'a Mutex<BTreeSet<RunId>>,
    run_id: RunId,
}

impl Drop for InFlightClaim<'_> {
    fn drop(&mut self) {
        lock(self.in_flight).remove(&self.run_id);
    }
}

struct LiveWorker<'a>(&'a AtomicUsize);

impl Drop for LiveWorker<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
