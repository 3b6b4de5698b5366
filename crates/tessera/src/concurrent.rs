//! Worker-pool renderer.
//!
//! Fronts one template with N worker threads and a bounded job queue. Each
//! worker panic-guards around the render and always answers the job's reply
//! channel, whether the render succeeded, failed, or panicked. Stopping
//! closes the job queue exactly once; submissions after stop fail fast.

use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    thread,
};

use crate::{
    ast::Node,
    context::Context,
    environment::Environment,
    error::{EngineResult, Error, RuntimeError, RuntimeErrorKind},
};

/// Outcome delivered on a job's reply channel.
pub type RenderOutcome = Result<String, Error>;

struct Job {
    context: Context,
    reply: mpsc::Sender<RenderOutcome>,
}

/// Renders one template concurrently across a fixed worker pool.
pub struct ConcurrentRenderer {
    /// Taken exactly once by `stop`; dropping it closes the queue.
    jobs: Mutex<Option<mpsc::SyncSender<Job>>>,
    stopped: AtomicBool,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    template_name: String,
}

impl ConcurrentRenderer {
    /// Resolves the template once and spins up `worker_count` workers
    /// sharing it. `queue_size` bounds the number of submitted-but-unstarted
    /// jobs.
    pub fn new(
        env: Arc<Environment>,
        template_name: &str,
        worker_count: usize,
        queue_size: usize,
    ) -> EngineResult<Self> {
        let root = env.load_resolved(template_name)?;
        let worker_count = worker_count.max(1);
        let (sender, receiver) = mpsc::sync_channel::<Job>(queue_size.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let env = env.clone();
            let root = root.clone();
            let receiver = receiver.clone();
            let name = template_name.to_owned();
            workers.push(thread::spawn(move || {
                worker_loop(worker_id, &env, &root, &name, &receiver);
            }));
        }

        Ok(Self {
            jobs: Mutex::new(Some(sender)),
            stopped: AtomicBool::new(false),
            workers: Mutex::new(workers),
            template_name: template_name.to_owned(),
        })
    }

    #[must_use]
    pub fn template_name(&self) -> &str {
        &self.template_name
    }

    /// Submits a render job; the returned receiver yields exactly one
    /// outcome. Fails fast with a stopped error after `stop`.
    pub fn submit(&self, context: Context) -> EngineResult<mpsc::Receiver<RenderOutcome>> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(stopped_error());
        }
        let (reply, outcome) = mpsc::channel();
        // the sender is cloned out so a full queue never blocks while the
        // lock is held (stop() needs that lock)
        let sender = {
            let jobs = self.jobs.lock().expect("job queue lock poisoned");
            match jobs.as_ref() {
                Some(sender) => sender.clone(),
                None => return Err(stopped_error()),
            }
        };
        sender
            .send(Job { context, reply })
            .map_err(|_| stopped_error())?;
        Ok(outcome)
    }

    /// Submits and waits for the outcome.
    pub fn render(&self, context: Context) -> RenderOutcome {
        let outcome = self.submit(context)?;
        outcome.recv().unwrap_or_else(|_| Err(stopped_error()))
    }

    /// Shuts the pool down: closes the job queue (exactly once) and joins
    /// the workers. Queued jobs are still answered before their worker
    /// exits. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        // dropping the sender disconnects the queue and ends worker loops
        self.jobs.lock().expect("job queue lock poisoned").take();
        let workers = std::mem::take(&mut *self.workers.lock().expect("worker list lock poisoned"));
        for worker in workers {
            let _ = worker.join();
        }
        tracing::debug!(template = %self.template_name, "concurrent renderer stopped");
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl Drop for ConcurrentRenderer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(
    worker_id: usize,
    env: &Environment,
    root: &Node,
    template_name: &str,
    receiver: &Arc<Mutex<mpsc::Receiver<Job>>>,
) {
    loop {
        let job = {
            let receiver = receiver.lock().expect("job receiver lock poisoned");
            receiver.recv()
        };
        let Ok(Job { context, reply }) = job else {
            // queue closed: the pool is stopping
            return;
        };
        let outcome = catch_unwind(AssertUnwindSafe(|| env.render_root(root, template_name, &context)))
            .unwrap_or_else(|_| {
                tracing::warn!(worker = worker_id, template = %template_name, "render panicked");
                Err(RuntimeError::unlocated(RuntimeErrorKind::Other("render panicked".to_owned())).into())
            });
        // the reply channel closes when `reply` drops, success or not; a
        // caller that went away is not an error
        let _ = reply.send(outcome);
    }
}

fn stopped_error() -> Error {
    RuntimeError::unlocated(RuntimeErrorKind::Other("renderer is stopped".to_owned())).into()
}
