use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use tracing::{debug, error};

use crate::error::{Error, Result};

use super::{Accelerator, AcceleratorOutput, CountJob};

#[derive(Debug)]
enum WorkerMessage {
    Exit,
    Count {
        job: Box<CountJob>,
        reply: mpsc::Sender<Result<AcceleratorOutput>>,
    },
}

/// Dedicated thread that owns the accelerator. All accelerated work goes
/// through it, so at most one accelerated count runs at a time.
#[derive(Debug)]
pub struct AcceleratorWorker {
    thread_handle: Option<thread::JoinHandle<()>>,
    tx: mpsc::Sender<WorkerMessage>,
    name: Arc<str>,
}

impl AcceleratorWorker {
    pub fn spawn(mut accelerator: Box<dyn Accelerator>) -> Self {
        let (tx, rx) = mpsc::channel::<WorkerMessage>();
        let name: Arc<str> = Arc::from(accelerator.name());

        let thread_name = name.clone();
        let thread_handle = thread::Builder::new()
            .name(format!("accelerator-{name}"))
            .spawn(move || {
                debug!(accelerator = %thread_name, "Accelerator worker started");
                while let Ok(message) = rx.recv() {
                    match message {
                        WorkerMessage::Exit => break,
                        WorkerMessage::Count { job, reply } => {
                            let result = accelerator.count(&job);
                            // The caller may have given up on the reply.
                            let _ = reply.send(result);
                        }
                    }
                }
                debug!(accelerator = %thread_name, "Accelerator worker stopped");
            });

        let thread_handle = match thread_handle {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!(accelerator = %name, error = %e, "Failed to start accelerator worker");
                None
            }
        };

        Self {
            thread_handle,
            tx,
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> AcceleratorHandle {
        AcceleratorHandle {
            tx: self.tx.clone(),
            name: self.name.clone(),
        }
    }
}

impl Drop for AcceleratorWorker {
    fn drop(&mut self) {
        let _ = self.tx.send(WorkerMessage::Exit);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

/// Cloneable sender side of an [`AcceleratorWorker`].
#[derive(Debug, Clone)]
pub struct AcceleratorHandle {
    tx: mpsc::Sender<WorkerMessage>,
    name: Arc<str>,
}

impl AcceleratorHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queues `job` on the worker and blocks until it is done.
    pub fn count(&self, job: CountJob) -> Result<AcceleratorOutput> {
        let (reply, response) = mpsc::channel();
        self.tx
            .send(WorkerMessage::Count {
                job: Box::new(job),
                reply,
            })
            .map_err(|_| Error::AcceleratorUnavailable(format!("{} worker has stopped", self.name)))?;
        response.recv().map_err(|_| {
            Error::AcceleratorUnavailable(format!("{} worker dropped the job", self.name))
        })?
    }
}
