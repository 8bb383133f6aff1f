//! Drain worker pool for oneshot mode.
//!
//! The dispatch thread never touches payload bytes under EDGE_ONESHOT; it
//! hands each readable connection to this pool. Oneshot disarming is the
//! mutual exclusion: a connection reaches at most one worker at a time, so
//! workers share nothing but the registry handle and the outcome channel.
//!
//! Unlike the fire-and-forget threads this replaces, the pool is joined on
//! shutdown, so in-flight drains finish before the process exits.

use crate::dispatch::drain::{drain, DrainStatus};
use crate::dispatch::registry::{EpollRegistry, TriggerMode};
use crate::echo::echo_back;
use std::io;
use std::net::{Shutdown, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A drain pass to run on a worker.
pub struct DrainJob {
    /// Connection token (slab key and epoll user data).
    pub token: usize,
    /// Shared handle to the connection's stream; the table entry keeps the
    /// descriptor alive until the dispatcher processes the outcome.
    pub stream: Arc<TcpStream>,
    /// Injected processing time per drained payload, used by tests in
    /// place of real work of nondeterministic duration.
    pub delay: Option<Duration>,
}

/// What a worker did with its connection, reported back to the dispatcher
/// so the connection table stays accurate.
#[derive(Debug, Clone, Copy)]
pub enum DrainOutcome {
    /// Drained to would-block; interest is being restored.
    Rearming { token: usize },
    /// Peer closed or hard error; descriptor was shut down.
    Closed { token: usize },
}

/// Fixed pool of named drain workers fed from a single job channel.
pub struct WorkerPool {
    jobs: Option<Sender<DrainJob>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` workers sharing the registry and outcome channel.
    pub fn new(
        size: usize,
        registry: Arc<EpollRegistry>,
        outcomes: Sender<DrainOutcome>,
        buffer_size: usize,
    ) -> io::Result<Self> {
        let (tx, rx) = channel::<DrainJob>();
        let rx = Arc::new(Mutex::new(rx));

        let mut handles = Vec::with_capacity(size);
        for worker_id in 0..size.max(1) {
            let rx = Arc::clone(&rx);
            let registry = Arc::clone(&registry);
            let outcomes = outcomes.clone();

            let handle = thread::Builder::new()
                .name(format!("drain-worker-{worker_id}"))
                .spawn(move || loop {
                    let job = match rx.lock().unwrap().recv() {
                        Ok(job) => job,
                        Err(_) => break, // channel closed, pool shutting down
                    };
                    service_connection(job, &registry, &outcomes, buffer_size);
                })?;

            handles.push(handle);
        }

        Ok(Self {
            jobs: Some(tx),
            handles,
        })
    }

    /// Queue a drain pass. The job is dropped (closing nothing — the
    /// dispatcher still owns the table entry) if the pool is already down.
    pub fn submit(&self, job: DrainJob) {
        if let Some(jobs) = &self.jobs {
            let _ = jobs.send(job);
        }
    }

    /// Close the job channel and wait for in-flight drains to finish.
    pub fn shutdown(&mut self) {
        self.jobs.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// One full oneshot service pass: drain, echo, then re-arm or close.
fn service_connection(
    job: DrainJob,
    registry: &EpollRegistry,
    outcomes: &Sender<DrainOutcome>,
    buffer_size: usize,
) {
    let token = job.token;
    let pass = drain(&job.stream, TriggerMode::EdgeOneshot, buffer_size);

    let mut echo_failed = false;
    if !pass.data.is_empty() {
        if let Some(delay) = job.delay {
            thread::sleep(delay);
        }
        if let Err(e) = echo_back(&job.stream, &pass.data) {
            tracing::debug!(token, error = %e, "Echo write failed");
            echo_failed = true;
        }
    }

    if pass.keeps_connection() && !echo_failed {
        // Outcome goes out before the re-arm: once the re-arm lands, a new
        // readiness event may race ahead of this message otherwise.
        let _ = outcomes.send(DrainOutcome::Rearming { token });
        if let Err(e) = registry.rearm(job.stream.as_raw_fd(), token, TriggerMode::EdgeOneshot) {
            tracing::error!(token, error = %e, "Failed to re-arm connection");
            close_descriptor(registry, &job.stream, token, outcomes);
        }
    } else {
        match pass.status {
            DrainStatus::PeerClosed => tracing::debug!(token, "Client closed the connection"),
            DrainStatus::Error(ref e) => tracing::debug!(token, error = %e, "Read error"),
            DrainStatus::WouldBlock => {}
        }
        close_descriptor(registry, &job.stream, token, outcomes);
    }
}

fn close_descriptor(
    registry: &EpollRegistry,
    stream: &TcpStream,
    token: usize,
    outcomes: &Sender<DrainOutcome>,
) {
    let _ = registry.unregister(stream.as_raw_fd());
    let _ = stream.shutdown(Shutdown::Both);
    let _ = outcomes.send(DrainOutcome::Closed { token });
}

/// Create the outcome channel shared between pool and dispatcher.
pub fn outcome_channel() -> (Sender<DrainOutcome>, Receiver<DrainOutcome>) {
    channel()
}
