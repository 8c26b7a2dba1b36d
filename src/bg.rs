//! Background request-handler pool.
//!
//! Long-running handlers run off the datapath on pool workers. The owning
//! endpoint produces work into a per-worker SPSC queue and consumes finished
//! handles from a reverse SPSC queue; workers never touch the endpoint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::nexus::ReqHandlerFn;
use crate::rpc::ReqHandle;

/// Per-worker queue depth.
const BG_QUEUE_DEPTH: usize = 1024;

/// One unit of background work: the handler and the handle it runs on.
pub(crate) struct BgWork {
    pub handler: ReqHandlerFn,
    pub handle: ReqHandle,
}

struct BgWorker {
    work_tx: rtrb::Producer<BgWork>,
    done_rx: rtrb::Consumer<ReqHandle>,
    thread: Option<JoinHandle<()>>,
}

/// The worker pool. Owned by the endpoint; dropped with it.
pub(crate) struct BgPool {
    workers: Vec<BgWorker>,
    /// Round-robin dispatch cursor.
    next: usize,
    shutdown: Arc<AtomicBool>,
}

impl BgPool {
    /// Spawn `num_threads` workers.
    pub fn new(num_threads: usize) -> std::io::Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::with_capacity(num_threads);

        for i in 0..num_threads {
            let (work_tx, work_rx) = rtrb::RingBuffer::<BgWork>::new(BG_QUEUE_DEPTH);
            let (done_tx, done_rx) = rtrb::RingBuffer::<ReqHandle>::new(BG_QUEUE_DEPTH);
            let shutdown = shutdown.clone();

            let thread = std::thread::Builder::new()
                .name(format!("urpc-bg-{}", i))
                .spawn(move || bg_worker_loop(work_rx, done_tx, shutdown))?;

            workers.push(BgWorker {
                work_tx,
                done_rx,
                thread: Some(thread),
            });
        }

        Ok(Self {
            workers,
            next: 0,
            shutdown,
        })
    }

    /// Dispatch work to the next worker. Returns the work when every queue
    /// is full; the caller runs it inline instead.
    pub fn dispatch(&mut self, mut work: BgWork) -> Result<(), BgWork> {
        for _ in 0..self.workers.len() {
            let idx = self.next;
            self.next = (self.next + 1) % self.workers.len();
            match self.workers[idx].work_tx.push(work) {
                Ok(()) => return Ok(()),
                Err(rtrb::PushError::Full(back)) => work = back,
            }
        }
        Err(work)
    }

    /// Drain finished handles from every worker.
    pub fn drain_completions(&mut self, out: &mut Vec<ReqHandle>) {
        for worker in &mut self.workers {
            while let Ok(handle) = worker.done_rx.pop() {
                out.push(handle);
            }
        }
    }
}

impl Drop for BgPool {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                let _ = thread.join();
            }
        }
    }
}

fn bg_worker_loop(
    mut work_rx: rtrb::Consumer<BgWork>,
    mut done_tx: rtrb::Producer<ReqHandle>,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        match work_rx.pop() {
            Ok(mut work) => {
                (work.handler)(&mut work.handle);
                let mut handle = work.handle;
                loop {
                    match done_tx.push(handle) {
                        Ok(()) => break,
                        Err(rtrb::PushError::Full(back)) => {
                            handle = back;
                            std::thread::yield_now();
                        }
                    }
                }
            }
            Err(_) => {
                if shutdown.load(Ordering::Acquire) {
                    return;
                }
                std::hint::spin_loop();
                std::thread::yield_now();
            }
        }
    }
}
