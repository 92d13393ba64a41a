use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum WorkQueueError {
    #[error("failed to spawn worker thread for {name}: {err}")]
    Spawn { name: String, err: std::io::Error },
}

struct Delayed {
    at: Instant,
    seq: u64,
    job: Job,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Delayed {}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delayed {
    // BinaryHeap is a max-heap, earliest deadline must come out first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct Pending {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Pending {
    fn inc(&self) {
        *self.count.lock() += 1;
    }

    fn dec(&self) {
        let mut count = self.count.lock();
        *count -= 1;
        if *count == 0 {
            self.idle.notify_all();
        }
    }
}

/// Background worker pool with delayed submission.
///
/// Jobs run on `workers` threads in submission order per thread; a queue with
/// a single worker is strictly ordered. Delayed jobs are parked on a timer
/// thread until their deadline and then submitted like any other job.
pub(crate) struct WorkQueue {
    name: String,
    tx: Option<Sender<Job>>,
    timer_tx: Option<Sender<Delayed>>,
    pending: Arc<Pending>,
    seq: Mutex<u64>,
    threads: Vec<JoinHandle<()>>,
    thread_ids: Vec<ThreadId>,
}

impl WorkQueue {
    pub fn new(name: &str, workers: usize) -> Result<Self, WorkQueueError> {
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let (timer_tx, timer_rx) = crossbeam_channel::unbounded::<Delayed>();
        let pending = Arc::new(Pending::default());
        let mut threads = Vec::new();

        for i in 0..workers.max(1) {
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("{name}/{i}"))
                .spawn(move || worker_loop(rx))
                .map_err(|err| WorkQueueError::Spawn {
                    name: name.to_owned(),
                    err,
                })?;
            threads.push(handle);
        }

        let job_tx = tx.clone();
        let handle = thread::Builder::new()
            .name(format!("{name}/timer"))
            .spawn(move || timer_loop(timer_rx, job_tx))
            .map_err(|err| WorkQueueError::Spawn {
                name: name.to_owned(),
                err,
            })?;
        threads.push(handle);

        let thread_ids = threads.iter().map(|t| t.thread().id()).collect();
        Ok(Self {
            name: name.to_owned(),
            tx: Some(tx),
            timer_tx: Some(timer_tx),
            pending,
            seq: Mutex::new(0),
            threads,
            thread_ids,
        })
    }

    pub fn queue(&self, job: impl FnOnce() + Send + 'static) {
        let Some(tx) = &self.tx else { return };
        self.pending.inc();
        let pending = self.pending.clone();
        let wrapped: Job = Box::new(move || {
            job();
            pending.dec();
        });
        if tx.send(wrapped).is_err() {
            tracing::warn!(queue = %self.name, "work queue is shut down, dropping job");
            self.pending.dec();
        }
    }

    pub fn queue_delayed(&self, delay: Duration, job: impl FnOnce() + Send + 'static) {
        if delay.is_zero() {
            return self.queue(job);
        }
        let Some(timer_tx) = &self.timer_tx else { return };
        self.pending.inc();
        let pending = self.pending.clone();
        let seq = {
            let mut seq = self.seq.lock();
            *seq += 1;
            *seq
        };
        let delayed = Delayed {
            at: Instant::now() + delay,
            seq,
            job: Box::new(move || {
                job();
                pending.dec();
            }),
        };
        if timer_tx.send(delayed).is_err() {
            tracing::warn!(queue = %self.name, "work queue is shut down, dropping delayed job");
            self.pending.dec();
        }
    }

    /// Blocks until every queued job, including delayed ones and the jobs
    /// they queue in turn, has finished.
    pub fn flush(&self) {
        let mut count = self.pending.count.lock();
        while *count != 0 {
            self.pending.idle.wait(&mut count);
        }
    }

    /// Like [`flush`](Self::flush) but gives up after `timeout`.
    pub fn flush_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.pending.count.lock();
        while *count != 0 {
            if self
                .pending
                .idle
                .wait_until(&mut count, deadline)
                .timed_out()
            {
                return *count == 0;
            }
        }
        true
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.tx.take();
        self.timer_tx.take();
        let me = thread::current().id();
        for (handle, id) in self.threads.drain(..).zip(self.thread_ids.drain(..)) {
            if id == me {
                continue;
            }
            let _ = handle.join();
        }
    }
}

fn worker_loop(rx: Receiver<Job>) {
    while let Ok(job) = rx.recv() {
        job();
    }
}

// Jobs still parked when the queue shuts down are dropped unrun.
fn timer_loop(rx: Receiver<Delayed>, tx: Sender<Job>) {
    let mut heap: BinaryHeap<Delayed> = BinaryHeap::new();
    loop {
        let now = Instant::now();
        while heap.peek().map_or(false, |d| d.at <= now) {
            if let Some(due) = heap.pop() {
                if tx.send(due.job).is_err() {
                    return;
                }
            }
        }
        let received = match heap.peek() {
            Some(next) => rx.recv_timeout(next.at.saturating_duration_since(now)),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(delayed) => heap.push(delayed),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    #[test]
    fn test_queue_and_flush() {
        let wq = WorkQueue::new("test", 2).expect("create work queue");
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let hits = hits.clone();
            wq.queue(move || {
                hits.fetch_add(1, AtomicOrdering::SeqCst);
            });
        }
        wq.flush();
        assert_eq!(hits.load(AtomicOrdering::SeqCst), 16);
    }

    #[test]
    fn test_delayed_runs_after_deadline() {
        let wq = WorkQueue::new("test", 1).expect("create work queue");
        let ran_at = Arc::new(Mutex::new(None));
        let start = Instant::now();
        {
            let ran_at = ran_at.clone();
            wq.queue_delayed(Duration::from_millis(30), move || {
                *ran_at.lock() = Some(Instant::now());
            });
        }
        wq.flush();
        let at = ran_at.lock().expect("delayed job ran");
        assert!(at.duration_since(start) >= Duration::from_millis(30));
    }

    #[test]
    fn test_ordered_single_worker() {
        let wq = WorkQueue::new("test", 1).expect("create work queue");
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let order = order.clone();
            wq.queue(move || order.lock().push(i));
        }
        wq.flush();
        assert_eq!(*order.lock(), (0..10).collect::<Vec<_>>());
    }
}
