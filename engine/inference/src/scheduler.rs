//! Dynamic batching across search threads.
//!
//! Search threads drop single-position requests into a shared FIFO; device
//! workers collect up to `batch_size` of them per forward pass. A worker
//! waits `wait_time_ms` for a full batch to form, and if the window expires
//! it claims the single-eval slot and runs whatever is there. This is the
//! escape hatch against a deadlock where the remaining search threads are
//! all blocked on the very batch that cannot fill.
//!
//! The wait window adapts: an expired window means arrivals were slower
//! than expected (wait less next time), while requests piling up during a
//! single eval mean the worker gave up too early (wait longer next time).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, warn};

use engine_config::InferenceConfig;
use janggi_core::NUM_INTERSECTIONS;

use crate::features::{INPUT_CHANNELS, OUTPUTS_POLICY, OUTPUTS_VALUE};
use crate::pipe::{ForwardPipe, PipeError};

const INITIAL_WAIT_MS: u64 = 10;
const MAX_WAIT_MS: u64 = 100;

/// One queued evaluation request. The caller blocks on `cv` until a worker
/// fills `done`.
struct ForwardEntry {
    input: Vec<f32>,
    done: Mutex<Option<Result<(Vec<f32>, Vec<f32>), String>>>,
    cv: Condvar,
}

struct Queue {
    entries: VecDeque<Arc<ForwardEntry>>,
    running: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    cv: Condvar,
    wait_time_ms: AtomicU64,
    single_eval_in_progress: AtomicBool,
    batch_size: usize,
}

/// Multiplexes evaluation requests from many threads onto one worker pool
/// per device pipe.
pub struct BatchScheduler {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl BatchScheduler {
    /// Spawn workers over the given device pipes.
    pub fn new(pipes: Vec<Arc<dyn ForwardPipe>>, config: InferenceConfig) -> Self {
        let batch_size = config.batch_size.max(1);
        let devices = pipes.len().max(1);
        let sched_threads = if config.num_scheduler_threads == 0 {
            batch_size * devices * 2
        } else {
            config.num_scheduler_threads
        };
        // At least one worker per device, with enough headroom that
        // something can always be scheduled while a batch is in flight.
        let workers_per_device = sched_threads / batch_size / (devices + 1) + 1;
        debug!(devices, workers_per_device, batch_size, "starting scheduler");

        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                entries: VecDeque::new(),
                running: true,
            }),
            cv: Condvar::new(),
            wait_time_ms: AtomicU64::new(INITIAL_WAIT_MS),
            single_eval_in_progress: AtomicBool::new(false),
            batch_size,
        });

        let mut workers = Vec::new();
        for pipe in pipes {
            for _ in 0..workers_per_device {
                let shared = Arc::clone(&shared);
                let pipe = Arc::clone(&pipe);
                workers.push(std::thread::spawn(move || batch_worker(&shared, &*pipe)));
            }
        }

        Self { shared, workers }
    }

    /// Enqueue one input tensor and block until its results are ready.
    pub fn forward(&self, input: Vec<f32>) -> Result<(Vec<f32>, Vec<f32>), PipeError> {
        let entry = Arc::new(ForwardEntry {
            input,
            done: Mutex::new(None),
            cv: Condvar::new(),
        });

        {
            let mut queue = self.shared.queue.lock().expect("scheduler queue");
            if !queue.running {
                return Err(PipeError::Backend("scheduler is shut down".into()));
            }
            queue.entries.push_back(Arc::clone(&entry));
        }
        self.shared.cv.notify_one();

        let mut done = entry.done.lock().expect("entry mutex");
        while done.is_none() {
            done = entry.cv.wait(done).expect("entry mutex");
        }
        done.take()
            .expect("completed entry")
            .map_err(PipeError::Backend)
    }

    /// Current adaptive wait window, exposed for diagnostics.
    pub fn wait_time_ms(&self) -> u64 {
        self.shared.wait_time_ms.load(Ordering::Relaxed)
    }
}

impl Drop for BatchScheduler {
    fn drop(&mut self) {
        let leftover = {
            let mut queue = self.shared.queue.lock().expect("scheduler queue");
            queue.running = false;
            std::mem::take(&mut queue.entries)
        };
        self.shared.cv.notify_all();
        // Anything still queued will never run.
        for entry in leftover {
            complete(&entry, Err("scheduler is shut down".into()));
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn complete(entry: &ForwardEntry, result: Result<(Vec<f32>, Vec<f32>), String>) {
    let mut done = entry.done.lock().expect("entry mutex");
    *done = Some(result);
    entry.cv.notify_all();
}

/// Take a batch (or a single eval) off the queue, blocking as per the
/// adaptive policy. Returns an empty vector on shutdown.
fn pickup_batch(shared: &Shared) -> Vec<Arc<ForwardEntry>> {
    let mut queue = shared.queue.lock().expect("scheduler queue");
    loop {
        if !queue.running {
            return Vec::new();
        }
        if queue.entries.len() >= shared.batch_size {
            return queue.entries.drain(..shared.batch_size).collect();
        }

        let wait = Duration::from_millis(shared.wait_time_ms.load(Ordering::Relaxed));
        let (guard, timeout) = shared
            .cv
            .wait_timeout_while(queue, wait, |q| {
                q.running && q.entries.len() < shared.batch_size
            })
            .expect("scheduler queue");
        queue = guard;

        if !queue.entries.is_empty()
            && timeout.timed_out()
            && !shared.single_eval_in_progress.swap(true, Ordering::AcqRel)
        {
            // The window expired without a full batch: evaluate one entry
            // now rather than risk waiting on work that can never arrive,
            // and shorten the next window.
            let wait_ms = shared.wait_time_ms.load(Ordering::Relaxed);
            if wait_ms > 1 {
                shared.wait_time_ms.store(wait_ms - 1, Ordering::Relaxed);
            }
            let entry = queue.entries.pop_front().expect("non-empty queue");
            return vec![entry];
        }
    }
}

fn batch_worker(shared: &Shared, pipe: &dyn ForwardPipe) {
    const IN_SIZE: usize = INPUT_CHANNELS * NUM_INTERSECTIONS;

    let mut batch_input: Vec<f32> = Vec::new();
    let mut batch_pol: Vec<f32> = Vec::new();
    let mut batch_val: Vec<f32> = Vec::new();

    loop {
        let entries = pickup_batch(shared);
        if entries.is_empty() {
            return;
        }
        let count = entries.len();

        batch_input.clear();
        batch_input.reserve(IN_SIZE * count);
        for entry in &entries {
            batch_input.extend_from_slice(&entry.input);
        }
        batch_pol.clear();
        batch_pol.resize(OUTPUTS_POLICY * count, 0.0);
        batch_val.clear();
        batch_val.resize(OUTPUTS_VALUE * count, 0.0);

        match pipe.forward(&batch_input, &mut batch_pol, &mut batch_val, count) {
            Ok(()) => {
                for (i, entry) in entries.iter().enumerate() {
                    let pol = batch_pol[i * OUTPUTS_POLICY..(i + 1) * OUTPUTS_POLICY].to_vec();
                    let val = batch_val[i * OUTPUTS_VALUE..(i + 1) * OUTPUTS_VALUE].to_vec();
                    complete(entry, Ok((pol, val)));
                }
            }
            Err(e) => {
                // This batch's waiters all see the error; the worker keeps
                // serving later batches.
                warn!(error = %e, count, "forward pass failed");
                for entry in &entries {
                    complete(entry, Err(e.to_string()));
                }
            }
        }

        if count == 1 {
            // If requests piled up while we ran a lone eval, the decision
            // to stop waiting was wrong; widen the next window.
            let grew = {
                let queue = shared.queue.lock().expect("scheduler queue");
                !queue.entries.is_empty()
            };
            if grew {
                let wait_ms = shared.wait_time_ms.load(Ordering::Relaxed);
                shared
                    .wait_time_ms
                    .store((wait_ms + 2).min(MAX_WAIT_MS), Ordering::Relaxed);
            }
            shared.single_eval_in_progress.store(false, Ordering::Release);
        }
    }
}
