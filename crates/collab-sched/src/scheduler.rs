//! Round-robin driver
//!
//! The driver owns every registered job. Each tick it takes the job at the
//! front of the ready queue and starts its next step; a job whose step has
//! landed goes to the back of the queue. Steps of different jobs may be in
//! flight at the same time, but a job never has more than one.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::sync::watch;

use crate::task::settle;
use crate::{TaskHandle, TaskId, TaskState};

/// One pending unit of work
pub type Step = BoxFuture<'static, Result<(), String>>;

/// A lazily produced sequence of steps.
///
/// Any iterator of futures resolving to `Result<(), E>` is a job.
pub trait Job: Send + 'static {
    /// Produce the next step, or `None` once the job is exhausted
    fn next_step(&mut self) -> Option<Step>;
}

impl<I, F, E> Job for I
where
    I: Iterator<Item = F> + Send + 'static,
    F: Future<Output = Result<(), E>> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    fn next_step(&mut self) -> Option<Step> {
        self.next()
            .map(|step| async move { step.await.map_err(|e| e.to_string()) }.boxed())
    }
}

/// Instantaneous backlog
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SchedulerLoad {
    /// Jobs not yet terminal
    pub registered: usize,
    /// Jobs waiting for their next tick
    pub ready: usize,
    /// Steps currently executing
    pub in_flight: usize,
}

#[derive(Clone, Debug, Default)]
pub struct SchedulerStats {
    pub ticks: u64,
    pub steps: u64,
    pub finished: u64,
    pub stopped: u64,
    pub failed: u64,
}

struct Shared {
    next_id: AtomicU64,
    load: Mutex<SchedulerLoad>,
    stats: Mutex<SchedulerStats>,
}

enum Control {
    Register(Entry),
    Shutdown,
}

struct Entry {
    id: TaskId,
    job: Box<dyn Job>,
    state: Arc<watch::Sender<TaskState>>,
}

impl Entry {
    fn is_running(&self) -> bool {
        !self.state.borrow().is_terminal()
    }
}

impl Drop for Entry {
    // Whatever drops a still running job (shutdown, a closed channel, a
    // runtime going away) leaves it Done.
    fn drop(&mut self) {
        settle(&self.state, TaskState::Done);
    }
}

type Landing = BoxFuture<'static, (Entry, Result<(), String>)>;

/// Handle to a running scheduler. Clones share the same driver.
#[derive(Clone)]
pub struct Scheduler {
    tx: mpsc::UnboundedSender<Control>,
    shared: Arc<Shared>,
}

impl Scheduler {
    /// Spawn the driver on the current tokio runtime
    pub fn start() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            next_id: AtomicU64::new(1),
            load: Mutex::new(SchedulerLoad::default()),
            stats: Mutex::new(SchedulerStats::default()),
        });

        let driver = Driver {
            rx,
            open: true,
            ready: VecDeque::new(),
            in_flight: FuturesUnordered::new(),
            shared: Arc::clone(&shared),
        };
        tokio::spawn(driver.run());

        Scheduler { tx, shared }
    }

    /// Register a job. It is advanced one step per tick until exhausted,
    /// stopped or failed. After shutdown the returned handle is already Done.
    pub fn cooperate<J: Job>(&self, job: J) -> TaskHandle {
        let id = TaskId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let (state_tx, _) = watch::channel(TaskState::Running);
        let state = Arc::new(state_tx);

        let entry = Entry {
            id,
            job: Box::new(job),
            state: Arc::clone(&state),
        };
        if self.tx.send(Control::Register(entry)).is_err() {
            tracing::debug!(task = %id, "scheduler gone, task dropped");
        }

        TaskHandle::new(id, state)
    }

    /// Register a job and wait for it to end
    pub async fn coiterate<J: Job>(&self, job: J) -> TaskState {
        self.cooperate(job).finished().await
    }

    pub fn load(&self) -> SchedulerLoad {
        *self.shared.load.lock()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.shared.stats.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Stop the driver. Every job still registered ends up Done.
    pub fn shutdown(&self) {
        let _ = self.tx.send(Control::Shutdown);
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("load", &self.load())
            .field("running", &self.is_running())
            .finish()
    }
}

struct Driver {
    rx: mpsc::UnboundedReceiver<Control>,
    /// False once every `Scheduler` clone is gone
    open: bool,
    ready: VecDeque<Entry>,
    in_flight: FuturesUnordered<Landing>,
    shared: Arc<Shared>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            if !self.drain_control() {
                break;
            }

            if let Some(entry) = self.ready.pop_front() {
                self.tick(entry);
            }
            self.reap();
            self.publish_load();

            if !self.ready.is_empty() {
                tokio::task::yield_now().await;
                continue;
            }

            if self.in_flight.is_empty() {
                if !self.open {
                    break;
                }
                match self.rx.recv().await {
                    Some(control) => {
                        if !self.control(control) {
                            break;
                        }
                    }
                    None => self.open = false,
                }
            } else {
                tokio::select! {
                    control = self.rx.recv(), if self.open => match control {
                        Some(control) => {
                            if !self.control(control) {
                                break;
                            }
                        }
                        None => self.open = false,
                    },
                    Some((entry, outcome)) = self.in_flight.next() => self.land(entry, outcome),
                }
            }
        }

        tracing::debug!(
            ready = self.ready.len(),
            in_flight = self.in_flight.len(),
            "scheduler driver exiting"
        );
    }

    /// Apply queued control messages. False on shutdown.
    fn drain_control(&mut self) -> bool {
        while self.open {
            match self.rx.try_recv() {
                Ok(control) => {
                    if !self.control(control) {
                        return false;
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => self.open = false,
            }
        }
        true
    }

    fn control(&mut self, control: Control) -> bool {
        match control {
            Control::Register(entry) => {
                if entry.is_running() {
                    self.ready.push_back(entry);
                } else {
                    self.retire(entry);
                }
                true
            }
            Control::Shutdown => false,
        }
    }

    fn tick(&mut self, mut entry: Entry) {
        self.shared.stats.lock().ticks += 1;

        if !entry.is_running() {
            self.retire(entry);
            return;
        }

        match panic::catch_unwind(AssertUnwindSafe(|| entry.job.next_step())) {
            Ok(Some(step)) => {
                self.shared.stats.lock().steps += 1;
                self.in_flight.push(launch(entry, step));
            }
            Ok(None) => {
                settle(&entry.state, TaskState::Finished);
                self.shared.stats.lock().finished += 1;
            }
            Err(payload) => self.fail(entry, panic_message(payload.as_ref())),
        }
    }

    /// Collect every step that has already completed, without waiting
    fn reap(&mut self) {
        while let Some(Some((entry, outcome))) = self.in_flight.next().now_or_never() {
            self.land(entry, outcome);
        }
    }

    fn land(&mut self, entry: Entry, outcome: Result<(), String>) {
        match outcome {
            Ok(()) if entry.is_running() => self.ready.push_back(entry),
            Ok(()) => self.retire(entry),
            Err(reason) => self.fail(entry, reason),
        }
    }

    fn fail(&mut self, entry: Entry, reason: String) {
        tracing::warn!(task = %entry.id, %reason, "task step failed");
        if settle(&entry.state, TaskState::Failed(reason)) {
            self.shared.stats.lock().failed += 1;
        } else {
            self.retire(entry);
        }
    }

    /// Drop a job that is already terminal
    fn retire(&mut self, entry: Entry) {
        if *entry.state.borrow() == TaskState::Stopped {
            tracing::debug!(task = %entry.id, "task stopped");
            self.shared.stats.lock().stopped += 1;
        }
    }

    fn publish_load(&self) {
        *self.shared.load.lock() = SchedulerLoad {
            registered: self.ready.len() + self.in_flight.len(),
            ready: self.ready.len(),
            in_flight: self.in_flight.len(),
        };
    }
}

fn launch(entry: Entry, step: Step) -> Landing {
    async move {
        let outcome = match AssertUnwindSafe(step).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => Err(panic_message(payload.as_ref())),
        };
        (entry, outcome)
    }
    .boxed()
}

/// Readable text for a caught panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use crate::TaskStopError;

    type Trace = Arc<Mutex<Vec<String>>>;

    fn recording(trace: &Trace, label: &'static str, steps: usize) -> impl Job {
        let trace = Arc::clone(trace);
        (0..steps).map(move |i| {
            let trace = Arc::clone(&trace);
            async move {
                trace.lock().push(format!("{}{}", label, i));
                Ok::<(), String>(())
            }
        })
    }

    fn endless(counter: &Arc<AtomicUsize>) -> impl Job {
        let counter = Arc::clone(counter);
        std::iter::repeat_with(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), String>(())
            }
        })
    }

    async fn wait_idle(sched: &Scheduler) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while sched.load().registered > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_round_robin_interleaves_jobs() {
        let sched = Scheduler::start();
        let trace: Trace = Arc::default();

        let a = sched.cooperate(recording(&trace, "a", 3));
        let b = sched.cooperate(recording(&trace, "b", 3));
        assert_eq!(a.finished().await, TaskState::Finished);
        assert_eq!(b.finished().await, TaskState::Finished);

        assert_eq!(*trace.lock(), ["a0", "b0", "a1", "b1", "a2", "b2"]);
        assert_eq!(sched.stats().finished, 2);
    }

    #[tokio::test]
    async fn test_failing_step_isolated() {
        let sched = Scheduler::start();
        let trace: Trace = Arc::default();

        let failing = sched.cooperate((0..3).map(|i| async move {
            if i == 1 {
                Err(format!("step {} broke", i))
            } else {
                Ok(())
            }
        }));
        let healthy = sched.cooperate(recording(&trace, "h", 4));

        assert_eq!(
            failing.finished().await,
            TaskState::Failed("step 1 broke".into())
        );
        assert_eq!(healthy.finished().await, TaskState::Finished);
        assert_eq!(trace.lock().len(), 4);
        assert_eq!(sched.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_panicking_step_isolated() {
        let sched = Scheduler::start();
        let trace: Trace = Arc::default();

        let panicking = sched.cooperate(std::iter::once(async {
            if true {
                panic!("kaboom");
            }
            Ok::<(), String>(())
        }));
        let healthy = sched.cooperate(recording(&trace, "h", 2));

        match panicking.finished().await {
            TaskState::Failed(reason) => assert!(reason.contains("kaboom")),
            other => panic!("unexpected state {:?}", other),
        }
        assert_eq!(healthy.finished().await, TaskState::Finished);
        assert!(sched.is_running());
    }

    #[tokio::test]
    async fn test_stop_between_steps() {
        let sched = Scheduler::start();
        let counter = Arc::new(AtomicUsize::new(0));

        let handle = sched.cooperate(endless(&counter));
        while counter.load(Ordering::SeqCst) < 10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(handle.stop(), Ok(()));
        assert_eq!(handle.finished().await, TaskState::Stopped);
        wait_idle(&sched).await;

        let seen = counter.load(Ordering::SeqCst);
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert_eq!(counter.load(Ordering::SeqCst), seen);
        assert_eq!(handle.stop(), Err(TaskStopError::Stopped));
        assert_eq!(sched.stats().stopped, 1);
    }

    #[tokio::test]
    async fn test_stop_terminal_outcomes() {
        let sched = Scheduler::start();
        let trace: Trace = Arc::default();

        let finished = sched.cooperate(recording(&trace, "f", 1));
        finished.finished().await;
        assert_eq!(finished.stop(), Err(TaskStopError::Finished));

        let failed = sched.cooperate(std::iter::once(async { Err::<(), _>("nope") }));
        failed.finished().await;
        assert_eq!(failed.stop(), Err(TaskStopError::Failed("nope".into())));

        let counter = Arc::new(AtomicUsize::new(0));
        let orphan = sched.cooperate(endless(&counter));
        sched.shutdown();
        assert_eq!(orphan.finished().await, TaskState::Done);
        assert_eq!(orphan.stop(), Err(TaskStopError::Done));
    }

    #[tokio::test]
    async fn test_cooperate_after_shutdown_is_done() {
        let sched = Scheduler::start();
        sched.shutdown();
        tokio::time::timeout(Duration::from_secs(5), async {
            while sched.is_running() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let trace: Trace = Arc::default();
        let handle = sched.cooperate(recording(&trace, "x", 2));
        assert_eq!(handle.state(), TaskState::Done);
        assert!(trace.lock().is_empty());
    }

    #[tokio::test]
    async fn test_coiterate_and_load() {
        let sched = Scheduler::start();
        let trace: Trace = Arc::default();

        assert_eq!(
            sched.coiterate(recording(&trace, "c", 5)).await,
            TaskState::Finished
        );
        wait_idle(&sched).await;
        assert_eq!(sched.load(), SchedulerLoad::default());

        let stats = sched.stats();
        assert_eq!(stats.steps, 5);
        // five steps plus the tick that found the job exhausted
        assert_eq!(stats.ticks, 6);
    }
}
