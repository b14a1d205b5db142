//! The runtime front-end: configuration and the replay worker pool.

use crate::event::EventInterface;
use crate::forest::RegionForest;
use crate::mapper::MapperOracle;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::{
    cmp,
    collections::VecDeque,
    env,
    sync::{
        atomic::{AtomicU32, AtomicUsize, Ordering},
        Arc,
    },
    thread,
};

/// How many times a physical trace may record a non-replayable template
/// before it stops proposing templates at all.
const DEFAULT_NONREPLAYABLE_THRESHOLD: u32 = 2;

type Job = Box<dyn FnOnce() + Send>;

/// A handle to the tracing runtime. Conceptually a front-end akin to an
/// `Rc`: this struct can be freely `clone()`d without duplicating the
/// underlying state.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RtInner>,
}

struct RtInner {
    /// The number of slices a template is partitioned into, and the cap on
    /// replay worker threads.
    replay_parallelism: AtomicUsize,
    nonreplayable_threshold: AtomicU32,
    events: Arc<dyn EventInterface>,
    forest: Arc<dyn RegionForest>,
    oracle: Arc<dyn MapperOracle>,
    job_queue: (Condvar, Mutex<VecDeque<Job>>),
    active_worker_threads: AtomicUsize,
}

impl Runtime {
    /// Create a runtime over the given collaborators. `TEMPLAR_REPLAY_PARALLELISM`
    /// and `TEMPLAR_NONREPLAYABLE_THRESHOLD` override the defaults.
    pub fn new(
        events: Arc<dyn EventInterface>,
        forest: Arc<dyn RegionForest>,
        oracle: Arc<dyn MapperOracle>,
    ) -> Self {
        let parallelism = env::var("TEMPLAR_REPLAY_PARALLELISM")
            .ok()
            .and_then(|x| x.parse::<usize>().ok())
            .filter(|&x| x > 0)
            .unwrap_or_else(|| cmp::max(1, num_cpus::get()));
        let threshold = env::var("TEMPLAR_NONREPLAYABLE_THRESHOLD")
            .ok()
            .and_then(|x| x.parse::<u32>().ok())
            .unwrap_or(DEFAULT_NONREPLAYABLE_THRESHOLD);
        Self {
            inner: Arc::new(RtInner {
                replay_parallelism: AtomicUsize::new(parallelism),
                nonreplayable_threshold: AtomicU32::new(threshold),
                events,
                forest,
                oracle,
                job_queue: (Condvar::new(), Mutex::new(VecDeque::new())),
                active_worker_threads: AtomicUsize::new(0),
            }),
        }
    }

    /// The current slice count for newly finalized templates. Notice that
    /// this value can be changed by other threads and is thus potentially
    /// stale as soon as it is read.
    pub fn replay_parallelism(&self) -> usize {
        self.inner.replay_parallelism.load(Ordering::Relaxed)
    }

    pub fn set_replay_parallelism(&self, parallelism: usize) {
        self.inner
            .replay_parallelism
            .store(cmp::max(1, parallelism), Ordering::Relaxed);
    }

    pub fn nonreplayable_threshold(&self) -> u32 {
        self.inner.nonreplayable_threshold.load(Ordering::Relaxed)
    }

    pub fn set_nonreplayable_threshold(&self, threshold: u32) {
        self.inner
            .nonreplayable_threshold
            .store(threshold, Ordering::Relaxed);
    }

    pub fn events(&self) -> &Arc<dyn EventInterface> {
        &self.inner.events
    }

    pub fn forest(&self) -> &Arc<dyn RegionForest> {
        &self.inner.forest
    }

    pub fn mapper_oracle(&self) -> &Arc<dyn MapperOracle> {
        &self.inner.oracle
    }

    /// Queue `job` to be run on a replay worker thread.
    ///
    /// Each time a job is queued we spin up a new worker thread iff we
    /// aren't already running the maximum number. Once started, a worker
    /// never dies, waiting endlessly for work.
    pub(crate) fn spawn(&self, job: Job) {
        let inner = &self.inner;
        let (cv, mtx) = &inner.job_queue;
        mtx.lock().push_back(job);
        cv.notify_one();

        let max_workers = inner.replay_parallelism.load(Ordering::Relaxed);
        if inner.active_worker_threads.load(Ordering::Relaxed) < max_workers {
            // Between the load above and the increment below another thread
            // may also be spinning up a worker; the increment decides who
            // won.
            if inner.active_worker_threads.fetch_add(1, Ordering::Relaxed) >= max_workers {
                inner.active_worker_threads.fetch_sub(1, Ordering::Relaxed);
                return;
            }
            let inner_cl = Arc::clone(&self.inner);
            thread::spawn(move || {
                let (cv, mtx) = &inner_cl.job_queue;
                let mut lock = mtx.lock();
                loop {
                    match lock.pop_front() {
                        Some(job) => MutexGuard::unlocked(&mut lock, job),
                        None => cv.wait(&mut lock),
                    }
                }
            });
        }
    }
}
