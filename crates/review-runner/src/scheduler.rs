use anyhow::{anyhow, Result};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// One batch's unit of work. Returns the runner's exit code.
pub type BatchTaskFn = Box<dyn FnOnce() -> Result<i32> + Send + 'static>;

#[derive(Debug, Clone, PartialEq)]
pub struct Heartbeat {
    pub active: Vec<usize>,
    pub queued: Vec<usize>,
    pub elapsed_seconds: BTreeMap<usize, u64>,
    pub total_count: usize,
}

/// Lifecycle events. Indexes are 0-based batch positions.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    Queued { index: usize, max_workers: usize },
    Started { index: usize, max_workers: usize },
    Done { index: usize, code: i32, elapsed_seconds: u64 },
    Heartbeat(Heartbeat),
    StallWarning { threshold_seconds: u64, indexes: Vec<usize> },
    ExecutionError { index: usize, message: String },
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub parallel: bool,
    pub max_workers: usize,
    pub heartbeat: Duration,
    pub stall_warning_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScheduleOutcome {
    /// Sorted, 0-based.
    pub failed: Vec<usize>,
    pub interrupted: bool,
}

/// How often a sequential run checks for an interrupt while a task runs.
const CANCEL_POLL: Duration = Duration::from_millis(50);
/// After an interrupt, in-flight tasks get this long to report before the
/// scheduler returns without them.
const CANCEL_GRACE: Duration = Duration::from_millis(750);

/// Run every task and collect the failed set. Sequential mode runs in index
/// order, one task at a time; parallel mode uses a bounded thread pool. Both
/// return shortly after `cancel` is set, even while a task is still running.
pub fn execute_batches(
    tasks: BTreeMap<usize, BatchTaskFn>,
    options: &SchedulerOptions,
    cancel: Arc<AtomicBool>,
    on_event: &mut dyn FnMut(&SchedulerEvent),
) -> Result<ScheduleOutcome> {
    if options.parallel {
        execute_parallel(tasks, options, cancel, on_event)
    } else {
        execute_serial(tasks, &cancel, on_event)
    }
}

fn record_result(
    index: usize,
    result: Result<i32, String>,
    elapsed_seconds: u64,
    failed: &mut BTreeSet<usize>,
    on_event: &mut dyn FnMut(&SchedulerEvent),
) {
    let code = match result {
        Ok(code) => code,
        Err(message) => {
            on_event(&SchedulerEvent::ExecutionError { index, message });
            1
        }
    };
    if code != 0 {
        failed.insert(index);
    }
    on_event(&SchedulerEvent::Done {
        index,
        code,
        elapsed_seconds,
    });
}

fn interrupted(failed: BTreeSet<usize>) -> ScheduleOutcome {
    ScheduleOutcome {
        failed: failed.into_iter().collect(),
        interrupted: true,
    }
}

/// Run one task on its own thread so the caller can stop waiting for it.
fn spawn_task(index: usize, task: BatchTaskFn) -> Result<mpsc::Receiver<Result<i32, String>>> {
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name(format!("reviewlab-batch-{}", index + 1))
        .spawn(move || {
            let _ = tx.send(task().map_err(|err| err.to_string()));
        })
        .map_err(|e| anyhow!("failed to spawn batch thread: {}", e))?;
    Ok(rx)
}

fn execute_serial(
    tasks: BTreeMap<usize, BatchTaskFn>,
    cancel: &AtomicBool,
    on_event: &mut dyn FnMut(&SchedulerEvent),
) -> Result<ScheduleOutcome> {
    let mut failed = BTreeSet::new();
    for (index, task) in tasks {
        if cancel.load(Ordering::SeqCst) {
            return Ok(interrupted(failed));
        }
        let started = Instant::now();
        on_event(&SchedulerEvent::Started {
            index,
            max_workers: 1,
        });
        let rx = spawn_task(index, task)?;
        let result = loop {
            match rx.recv_timeout(CANCEL_POLL) {
                Ok(result) => break result,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if !cancel.load(Ordering::SeqCst) {
                        continue;
                    }
                    debug!(batch = index + 1, "sequential batch interrupted");
                    if let Ok(result) = rx.recv_timeout(CANCEL_GRACE) {
                        let elapsed = started.elapsed().as_secs();
                        record_result(index, result, elapsed, &mut failed, on_event);
                    }
                    return Ok(interrupted(failed));
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    break Err("batch thread exited without reporting a result".to_string())
                }
            }
        };
        record_result(index, result, started.elapsed().as_secs(), &mut failed, on_event);
    }
    Ok(ScheduleOutcome {
        failed: failed.into_iter().collect(),
        interrupted: cancel.load(Ordering::SeqCst),
    })
}

enum WorkerMessage {
    Started { index: usize, at: Instant },
    Finished { index: usize, result: Result<i32, String> },
}

type TaskQueue = Arc<Mutex<VecDeque<(usize, BatchTaskFn)>>>;

fn spawn_worker(
    worker_id: usize,
    queue: TaskQueue,
    cancel: Arc<AtomicBool>,
    tx: mpsc::Sender<WorkerMessage>,
) -> Result<()> {
    thread::Builder::new()
        .name(format!("reviewlab-batch-worker-{}", worker_id))
        .spawn(move || loop {
            if cancel.load(Ordering::SeqCst) {
                break;
            }
            let next = match queue.lock() {
                Ok(mut q) => q.pop_front(),
                Err(_) => break,
            };
            let Some((index, task)) = next else {
                break;
            };
            if tx
                .send(WorkerMessage::Started {
                    index,
                    at: Instant::now(),
                })
                .is_err()
            {
                break;
            }
            let result = task().map_err(|err| err.to_string());
            if tx.send(WorkerMessage::Finished { index, result }).is_err() {
                break;
            }
        })
        .map_err(|e| anyhow!("failed to spawn batch worker thread: {}", e))?;
    Ok(())
}

/// Bookkeeping for the parallel pool, shared by the main loop and the
/// post-interrupt drain.
struct PoolState {
    max_workers: usize,
    pending: BTreeSet<usize>,
    started_at: BTreeMap<usize, Instant>,
    failed: BTreeSet<usize>,
    stall_warned: BTreeSet<usize>,
}

impl PoolState {
    fn apply(&mut self, message: WorkerMessage, on_event: &mut dyn FnMut(&SchedulerEvent)) {
        match message {
            WorkerMessage::Started { index, at } => {
                self.started_at.insert(index, at);
                on_event(&SchedulerEvent::Started {
                    index,
                    max_workers: self.max_workers,
                });
            }
            WorkerMessage::Finished { index, result } => {
                self.pending.remove(&index);
                self.stall_warned.remove(&index);
                let elapsed_seconds = self
                    .started_at
                    .get(&index)
                    .map(|at| at.elapsed().as_secs())
                    .unwrap_or(0);
                record_result(index, result, elapsed_seconds, &mut self.failed, on_event);
            }
        }
    }

    fn has_running(&self) -> bool {
        self.pending.iter().any(|idx| self.started_at.contains_key(idx))
    }

    /// Record whatever is already queued, then give running tasks a short
    /// grace period to report.
    fn drain_after_cancel(
        &mut self,
        rx: &mpsc::Receiver<WorkerMessage>,
        on_event: &mut dyn FnMut(&SchedulerEvent),
    ) {
        let deadline = Instant::now() + CANCEL_GRACE;
        loop {
            let message = match rx.try_recv() {
                Ok(message) => message,
                Err(mpsc::TryRecvError::Disconnected) => break,
                Err(mpsc::TryRecvError::Empty) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if !self.has_running() || remaining.is_zero() {
                        break;
                    }
                    match rx.recv_timeout(remaining) {
                        Ok(message) => message,
                        Err(_) => break,
                    }
                }
            };
            self.apply(message, on_event);
        }
    }
}

fn execute_parallel(
    tasks: BTreeMap<usize, BatchTaskFn>,
    options: &SchedulerOptions,
    cancel: Arc<AtomicBool>,
    on_event: &mut dyn FnMut(&SchedulerEvent),
) -> Result<ScheduleOutcome> {
    let indexes: Vec<usize> = tasks.keys().copied().collect();
    let total = indexes.len();
    if total == 0 {
        return Ok(ScheduleOutcome::default());
    }
    let max_workers = options.max_workers.min(total).max(1);

    for index in &indexes {
        on_event(&SchedulerEvent::Queued {
            index: *index,
            max_workers,
        });
    }
    let queue: TaskQueue = Arc::new(Mutex::new(tasks.into_iter().collect()));
    let (tx, rx) = mpsc::channel();
    for worker_id in 0..max_workers {
        spawn_worker(worker_id, queue.clone(), cancel.clone(), tx.clone())?;
    }
    drop(tx);

    let mut pool = PoolState {
        max_workers,
        pending: indexes.iter().copied().collect(),
        started_at: BTreeMap::new(),
        failed: BTreeSet::new(),
        stall_warned: BTreeSet::new(),
    };

    while !pool.pending.is_empty() {
        if cancel.load(Ordering::SeqCst) {
            debug!(pending = pool.pending.len(), "batch execution interrupted");
            pool.drain_after_cancel(&rx, on_event);
            return Ok(interrupted(pool.failed));
        }
        match rx.recv_timeout(options.heartbeat) {
            Ok(message) => pool.apply(message, on_event),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                let heartbeat = build_heartbeat(&pool.pending, &pool.started_at, total);
                if options.stall_warning_seconds > 0 {
                    let stall_warned = &mut pool.stall_warned;
                    let newly: Vec<usize> = heartbeat
                        .active
                        .iter()
                        .copied()
                        .filter(|idx| {
                            heartbeat.elapsed_seconds.get(idx).copied().unwrap_or(0)
                                >= options.stall_warning_seconds
                        })
                        .filter(|idx| stall_warned.insert(*idx))
                        .collect();
                    on_event(&SchedulerEvent::Heartbeat(heartbeat));
                    if !newly.is_empty() {
                        on_event(&SchedulerEvent::StallWarning {
                            threshold_seconds: options.stall_warning_seconds,
                            indexes: newly,
                        });
                    }
                } else {
                    on_event(&SchedulerEvent::Heartbeat(heartbeat));
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                if cancel.load(Ordering::SeqCst) {
                    continue;
                }
                warn!(
                    pending = pool.pending.len(),
                    "batch workers exited with unfinished batches"
                );
                for index in std::mem::take(&mut pool.pending) {
                    on_event(&SchedulerEvent::ExecutionError {
                        index,
                        message: "batch worker exited without reporting a result".to_string(),
                    });
                    pool.failed.insert(index);
                }
            }
        }
    }
    Ok(ScheduleOutcome {
        failed: pool.failed.into_iter().collect(),
        interrupted: false,
    })
}

fn build_heartbeat(
    pending: &BTreeSet<usize>,
    started_at: &BTreeMap<usize, Instant>,
    total: usize,
) -> Heartbeat {
    let mut active = Vec::new();
    let mut queued = Vec::new();
    let mut elapsed_seconds = BTreeMap::new();
    for index in pending {
        match started_at.get(index) {
            Some(at) => {
                active.push(*index);
                elapsed_seconds.insert(*index, at.elapsed().as_secs());
            }
            None => queued.push(*index),
        }
    }
    Heartbeat {
        active,
        queued,
        elapsed_seconds,
        total_count: total,
    }
}
