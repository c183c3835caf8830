//! Simulation worker
//!
//! Runs one scheduler job per run. The job is a state machine that builds
//! a simulator, then on every step runs one chunk of `batch * repeats`
//! trials. Every `broadcast_freq` trials it publishes the defaults histogram
//! accumulated since the previous broadcast.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use parking_lot::Mutex;

use collab_copula::{Copula, SimulatorFactory};
use collab_core::{
    CollabError, CollabResult, Command, Distributions, Histogram, Progress, RunId, RunParameters,
    DEFAULTS_HISTOGRAM,
};
use collab_sched::{panic_message, TaskHandle};
use collab_wire::{Envelope, SimulationMessage};

use crate::{Inbound, NodeContext, Role, WorkerConfig};

/// The task running one simulation
#[derive(Clone, Debug)]
pub struct RunTask {
    /// Distinguishes a task from a later one for the same run id
    ticket: u64,
    handle: TaskHandle,
}

impl RunTask {
    pub fn handle(&self) -> &TaskHandle {
        &self.handle
    }
}

type TaskMap = Arc<Mutex<HashMap<RunId, RunTask>>>;

pub struct SimulationWorker {
    config: WorkerConfig,
    factory: SimulatorFactory,
    tasks: TaskMap,
    tickets: AtomicU64,
}

impl SimulationWorker {
    pub fn new(config: WorkerConfig, factory: SimulatorFactory) -> Self {
        SimulationWorker {
            config,
            factory,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            tickets: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Handle of the task recorded for `run_id`
    pub fn task(&self, run_id: &RunId) -> Option<TaskHandle> {
        self.tasks.lock().get(run_id).map(|t| t.handle.clone())
    }

    pub fn running(&self) -> Vec<RunId> {
        self.tasks.lock().keys().cloned().collect()
    }

    /// Register a job for the run unless a live one exists. Returns whether
    /// a new job was started.
    fn spawn_run(
        &self,
        ctx: &Arc<NodeContext>,
        params: RunParameters,
        envelope: Envelope,
    ) -> CollabResult<bool> {
        let run_id = params.require_run_id()?.clone();
        let mut tasks = self.tasks.lock();
        if tasks.get(&run_id).is_some_and(|t| t.handle.is_live()) {
            tracing::debug!(node = %ctx.name(), run_id = %run_id, "run already live");
            return Ok(false);
        }

        let ticket = self.tickets.fetch_add(1, Ordering::Relaxed);
        let job = RunJob {
            ctx: Arc::clone(ctx),
            params,
            envelope: Some(envelope),
            config: self.config.clone(),
            factory: self.factory.clone(),
            tasks: Arc::clone(&self.tasks),
            ticket,
            phase: Phase::Prepare,
            defaults: Histogram::new(),
            completed: 0,
            since_broadcast: 0,
        };
        let handle = ctx.scheduler().cooperate(job);
        tracing::info!(
            node = %ctx.name(),
            run_id = %run_id,
            task = %handle.id(),
            "simulation scheduled"
        );
        tasks.insert(run_id, RunTask { ticket, handle });
        Ok(true)
    }
}

impl fmt::Debug for SimulationWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulationWorker")
            .field("config", &self.config)
            .field("factory", &self.factory)
            .field("running", &self.tasks.lock().len())
            .finish()
    }
}

#[async_trait]
impl Role for SimulationWorker {
    fn kind(&self) -> &'static str {
        "simulation_worker"
    }

    async fn start(&self, ctx: &Arc<NodeContext>, msg: Inbound) -> CollabResult<()> {
        let mut params = msg.params.clone();
        params.run_id = Some(msg.run_id().ok_or(CollabError::MissingRunId)?);
        self.spawn_run(ctx, params, msg.envelope)?;
        Ok(())
    }

    async fn stop(&self, ctx: &Arc<NodeContext>, msg: Inbound) -> CollabResult<()> {
        let Some(run_id) = msg.run_id() else {
            return Ok(());
        };
        let removed = self.tasks.lock().remove(&run_id);
        let Some(task) = removed else {
            tracing::debug!(node = %ctx.name(), run_id = %run_id, "stop for unknown run");
            return Ok(());
        };

        // a task that ended on its own is as good as stopped
        if let Err(outcome) = task.handle.stop() {
            tracing::debug!(node = %ctx.name(), run_id = %run_id, %outcome, "task already over");
        }

        let mut params = msg.params.clone();
        params.run_id = Some(run_id);
        ctx.broadcast_stop(&params).await
    }

    fn active_runs(&self) -> usize {
        self.tasks.lock().len()
    }
}

enum Phase {
    Prepare,
    Running(Box<dyn Copula>),
    Exhausted,
}

/// Step sequence of one run
struct RunJob {
    ctx: Arc<NodeContext>,
    params: RunParameters,
    envelope: Option<Envelope>,
    config: WorkerConfig,
    factory: SimulatorFactory,
    tasks: TaskMap,
    ticket: u64,
    phase: Phase,
    /// Defaults tallied since the last broadcast
    defaults: Histogram,
    completed: u64,
    since_broadcast: u64,
}

type RunStep = BoxFuture<'static, CollabResult<()>>;

impl RunJob {
    fn prepare(&mut self) -> RunStep {
        let portfolio = match self.envelope.take().map(|env| env.portfolio()) {
            Some(Ok(portfolio)) => portfolio,
            Some(Err(e)) => return self.fail(e),
            None => return self.fail(CollabError::InvalidPortfolio("Not a portfolio".into())),
        };

        if let Err(e) = self.config.validate() {
            return self.fail(e);
        }

        match self.factory.build(&self.config.simulator, &portfolio) {
            Ok(simulator) => {
                tracing::info!(
                    node = %self.ctx.name(),
                    run_id = ?self.params.run_id,
                    simulator = simulator.kind(),
                    max_runs = self.config.max_runs,
                    "simulation started"
                );
                self.phase = Phase::Running(simulator);
                future::ready(Ok(())).boxed()
            }
            Err(e) => self.fail(e),
        }
    }

    /// End the run after reporting `err`
    fn fail(&mut self, err: CollabError) -> RunStep {
        self.phase = Phase::Exhausted;
        self.report(err)
    }

    fn report(&self, err: CollabError) -> RunStep {
        let ctx = Arc::clone(&self.ctx);
        let params = self.params.clone();
        async move {
            ctx.errback(&err, None, Some(&params)).await;
            Ok(())
        }
        .boxed()
    }

    fn chunk(&mut self, simulator: &mut dyn Copula) -> RunStep {
        let (batch, repeats) = (self.config.batch, self.config.repeats);
        let size = self.config.chunk_size();
        let mut tally = Histogram::new();
        // a panicking kernel costs this chunk only
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            simulator.copula(batch, repeats, &mut tally)
        }))
        .unwrap_or_else(|payload| {
            Err(CollabError::SimulationFailed(panic_message(payload.as_ref())))
        });
        self.completed = self.completed.saturating_add(size);

        if let Err(e) = outcome {
            tracing::warn!(
                node = %self.ctx.name(),
                run_id = ?self.params.run_id,
                error = %e,
                "chunk failed"
            );
            return self.report(e);
        }

        for (point, count) in tally {
            let slot = self.defaults.entry(point).or_insert(0);
            *slot = slot.saturating_add(count);
        }
        self.since_broadcast = self.since_broadcast.saturating_add(size);

        if self.since_broadcast < self.config.broadcast_freq {
            return future::ready(Ok(())).boxed();
        }
        self.broadcast()
    }

    /// Publish the tally since the last broadcast and reset it
    fn broadcast(&mut self) -> RunStep {
        let mut distributions = Distributions::new();
        distributions.combine(DEFAULTS_HISTOGRAM, &std::mem::take(&mut self.defaults));
        let runs = std::mem::take(&mut self.since_broadcast);

        tracing::debug!(
            node = %self.ctx.name(),
            run_id = ?self.params.run_id,
            runs,
            completed = self.completed,
            "broadcasting results"
        );

        let msg = SimulationMessage::new(self.params.relabel(Command::Results))
            .with_distributions(distributions)
            .with_progress(Progress::new(runs));
        let ctx = Arc::clone(&self.ctx);
        async move {
            if let Err(e) = ctx.output(&msg).await {
                ctx.errback(&e, None, Some(&msg.params)).await;
            }
            Ok(())
        }
        .boxed()
    }

    /// Drop our own entry, unless a newer task replaced it
    fn release(&self) {
        let Some(run_id) = self.params.run_id.as_ref() else {
            return;
        };
        let mut tasks = self.tasks.lock();
        if tasks.get(run_id).is_some_and(|t| t.ticket == self.ticket) {
            tasks.remove(run_id);
        }
    }
}

impl Iterator for RunJob {
    type Item = RunStep;

    fn next(&mut self) -> Option<RunStep> {
        match std::mem::replace(&mut self.phase, Phase::Exhausted) {
            Phase::Prepare => Some(self.prepare()),
            Phase::Running(mut simulator) => {
                if self.completed >= self.config.max_runs {
                    tracing::info!(
                        node = %self.ctx.name(),
                        run_id = ?self.params.run_id,
                        runs = self.completed,
                        "simulation finished"
                    );
                    self.release();
                    return None;
                }
                let step = self.chunk(simulator.as_mut());
                self.phase = Phase::Running(simulator);
                Some(step)
            }
            Phase::Exhausted => {
                self.release();
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roles::testing::{drain, harness, inbound, params, portfolio, ERRORS, OUT};
    use collab_core::SEVERITY_ERROR;
    use collab_sched::TaskState;
    use collab_transport::BusOp;

    fn worker(config: WorkerConfig) -> SimulationWorker {
        SimulationWorker::new(config, SimulatorFactory::with_defaults().with_seed(11))
    }

    fn start_msg(run_id: &str) -> Inbound {
        inbound(
            SimulationMessage::new(params(run_id, Command::Start).with_number_runs(1000))
                .with_portfolio(portfolio()),
        )
    }

    fn stop_msg(run_id: &str) -> Inbound {
        inbound(SimulationMessage::new(params(run_id, Command::Stop)))
    }

    async fn run_to_end(w: &SimulationWorker, ctx: &Arc<NodeContext>, run_id: &str) -> TaskState {
        w.start(ctx, start_msg(run_id)).await.unwrap();
        let handle = w.task(&RunId::new(run_id)).unwrap();
        handle.finished().await
    }

    #[tokio::test]
    async fn test_results_every_broadcast_freq() {
        let (_bus, ctx, mut inbox) = harness("worker").await;
        let w = worker(WorkerConfig::quick());

        assert_eq!(run_to_end(&w, &ctx, "r1").await, TaskState::Finished);

        let out = drain(&mut inbox);
        assert_eq!(out.len(), 5);
        for (channel, msg) in &out {
            assert_eq!(channel, OUT);
            assert_eq!(msg.params.command, Command::Results);
            assert_eq!(msg.params.number_runs, 1000);
            assert_eq!(msg.progress, Some(Progress::new(200)));
            assert_eq!(msg.distributions.as_ref().unwrap().total(DEFAULTS_HISTOGRAM), 200);
        }
        // finished runs drop out of the task map
        assert!(w.task(&RunId::new("r1")).is_none());
        assert_eq!(w.active_runs(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_start_keeps_one_task() {
        let (_bus, ctx, mut inbox) = harness("worker").await;
        let w = worker(WorkerConfig::default());

        w.start(&ctx, start_msg("r2")).await.unwrap();
        let first = w.task(&RunId::new("r2")).unwrap();
        w.start(&ctx, start_msg("r2")).await.unwrap();
        let second = w.task(&RunId::new("r2")).unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(w.active_runs(), 1);

        w.stop(&ctx, stop_msg("r2")).await.unwrap();
        assert_eq!(first.finished().await, TaskState::Stopped);
        assert_eq!(w.active_runs(), 0);

        let stops: Vec<_> = drain(&mut inbox)
            .into_iter()
            .filter(|(_, m)| m.params.command == Command::Stop)
            .collect();
        assert_eq!(stops.len(), 1);

        // start after stop gets a fresh task
        w.start(&ctx, start_msg("r2")).await.unwrap();
        let third = w.task(&RunId::new("r2")).unwrap();
        assert_ne!(third.id(), first.id());
        w.stop(&ctx, stop_msg("r2")).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (bus, ctx, mut inbox) = harness("worker").await;
        let w = worker(WorkerConfig::default());

        // unknown run: nothing happens
        w.stop(&ctx, stop_msg("ghost")).await.unwrap();
        assert!(drain(&mut inbox).is_empty());
        assert_eq!(bus.published(OUT), 0);

        w.start(&ctx, start_msg("r3")).await.unwrap();
        w.stop(&ctx, stop_msg("r3")).await.unwrap();
        w.stop(&ctx, stop_msg("r3")).await.unwrap();
        let stops = drain(&mut inbox)
            .into_iter()
            .filter(|(_, m)| m.params.command == Command::Stop)
            .count();
        assert_eq!(stops, 1);
    }

    struct Exploding;

    impl Copula for Exploding {
        fn copula(&mut self, _: usize, _: usize, _: &mut Histogram) -> CollabResult<()> {
            panic!("kernel exploded")
        }

        fn kind(&self) -> &'static str {
            "exploding"
        }
    }

    #[tokio::test]
    async fn test_kernel_panic_reported_and_run_continues() {
        let (_bus, ctx, mut inbox) = harness("worker").await;
        let factory = SimulatorFactory::new()
            .with("exploding", |_, _| Ok(Box::new(Exploding) as Box<dyn Copula>));
        let w = SimulationWorker::new(WorkerConfig::quick().with_simulator("exploding"), factory);

        assert_eq!(run_to_end(&w, &ctx, "r4").await, TaskState::Finished);
        assert!(w.task(&RunId::new("r4")).is_none());

        // one report per chunk, no results
        let out = drain(&mut inbox);
        assert_eq!(out.len(), 10);
        assert!(out.iter().all(|(c, _)| c == ERRORS));
        assert_eq!(
            out[0].1.logger.as_ref().unwrap().messages(SEVERITY_ERROR),
            ["Simulation failed: panicked: kernel exploded"]
        );
    }

    #[tokio::test]
    async fn test_terminal_task_replaced_and_stoppable() {
        let (_bus, ctx, mut inbox) = harness("worker").await;
        let w = worker(WorkerConfig::default());

        w.start(&ctx, start_msg("r9")).await.unwrap();
        let first = w.task(&RunId::new("r9")).unwrap();
        first.stop().unwrap();
        assert_eq!(first.finished().await, TaskState::Stopped);
        // stopped behind the worker's back: still recorded
        assert!(w.task(&RunId::new("r9")).is_some());

        w.start(&ctx, start_msg("r9")).await.unwrap();
        let fresh = w.task(&RunId::new("r9")).unwrap();
        assert_ne!(fresh.id(), first.id());
        fresh.stop().unwrap();
        assert_eq!(fresh.finished().await, TaskState::Stopped);

        w.stop(&ctx, stop_msg("r9")).await.unwrap();
        assert!(w.task(&RunId::new("r9")).is_none());
        assert_eq!(
            drain(&mut inbox)
                .iter()
                .filter(|(_, m)| m.params.command == Command::Stop)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_unknown_simulator_reports_error() {
        let (_bus, ctx, mut inbox) = harness("worker").await;
        let w = worker(WorkerConfig::quick().with_simulator("scipy"));

        assert_eq!(run_to_end(&w, &ctx, "r5").await, TaskState::Finished);

        let out = drain(&mut inbox);
        assert_eq!(out.len(), 1);
        let (channel, msg) = &out[0];
        assert_eq!(channel, ERRORS);
        assert_eq!(msg.params.command, Command::Info);
        assert_eq!(
            msg.logger.as_ref().unwrap().messages(SEVERITY_ERROR),
            ["Unknown simulator: scipy"]
        );
    }

    #[tokio::test]
    async fn test_missing_portfolio_reports_error() {
        let (_bus, ctx, mut inbox) = harness("worker").await;
        let w = worker(WorkerConfig::quick());
        let msg = inbound(SimulationMessage::new(params("r6", Command::Start)));
        w.start(&ctx, msg).await.unwrap();
        w.task(&RunId::new("r6")).unwrap().finished().await;

        let out = drain(&mut inbox);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, ERRORS);
        assert!(out.iter().all(|(_, m)| m.params.command != Command::Results));
    }

    struct Flaky {
        calls: usize,
    }

    impl Copula for Flaky {
        fn copula(
            &mut self,
            batch: usize,
            repeats: usize,
            defaults: &mut Histogram,
        ) -> CollabResult<()> {
            self.calls += 1;
            if self.calls % 2 == 0 {
                return Err(CollabError::SimulationFailed(format!("call {}", self.calls)));
            }
            *defaults.entry(0).or_insert(0) += (batch * repeats) as u64;
            Ok(())
        }

        fn kind(&self) -> &'static str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn test_chunk_errors_do_not_end_the_run() {
        let (_bus, ctx, mut inbox) = harness("worker").await;
        let factory = SimulatorFactory::new()
            .with("flaky", |_, _| Ok(Box::new(Flaky { calls: 0 }) as Box<dyn Copula>));
        let config = WorkerConfig::default()
            .with_simulator("flaky")
            .with_broadcast_freq(100)
            .with_max_runs(400);
        let w = SimulationWorker::new(config, factory);

        assert_eq!(run_to_end(&w, &ctx, "r7").await, TaskState::Finished);

        let out = drain(&mut inbox);
        let results = out.iter().filter(|(c, _)| c == OUT).count();
        let errors = out.iter().filter(|(c, _)| c == ERRORS).count();
        assert_eq!(results, 2);
        assert_eq!(errors, 2);
    }

    #[tokio::test]
    async fn test_publish_failure_reported_and_run_continues() {
        let (bus, ctx, mut inbox) = harness("worker").await;
        bus.fail_once(BusOp::Publish, OUT);
        let w = worker(WorkerConfig::quick());

        assert_eq!(run_to_end(&w, &ctx, "r8").await, TaskState::Finished);

        let out = drain(&mut inbox);
        assert_eq!(out.iter().filter(|(c, _)| c == OUT).count(), 4);
        assert_eq!(out.iter().filter(|(c, _)| c == ERRORS).count(), 1);
    }
}
