use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::hal::{Command, HalError, RawFence, RawSwapChain, RawTexture, SubmissionId};

use super::state::DeviceState;

/// Work the GPU timeline executes in FIFO order.
pub(super) enum Job {
    Execute {
        submission: SubmissionId,
        commands: Vec<Command>,
    },
    Signal {
        fence: RawFence,
        value: u64,
    },
    Present {
        swap_chain: RawSwapChain,
        image: RawTexture,
    },
}

/// State shared between the CPU-facing backend and the timeline thread.
#[derive(Default)]
pub(super) struct Shared {
    state: Mutex<DeviceState>,
    /// Notified after every executed job.
    pub(super) progress: Condvar,
}

impl Shared {
    pub(super) fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The "GPU": a thread draining the job channel.
pub(super) struct Timeline {
    sender: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl Timeline {
    pub(super) fn spawn(shared: Arc<Shared>, latency: Duration) -> Result<Self, HalError> {
        let (sender, receiver) = mpsc::channel();

        let worker = thread::Builder::new()
            .name("ember-soft-gpu".into())
            .spawn(move || run(&shared, receiver, latency))
            .map_err(|e| HalError::Os(format!("failed to spawn GPU timeline thread: {e}")))?;

        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    pub(super) fn send(&self, job: Job) -> Result<(), HalError> {
        self.sender
            .as_ref()
            .and_then(|s| s.send(job).ok())
            .ok_or_else(|| HalError::DeviceLost("GPU timeline has stopped".into()))
    }
}

impl Drop for Timeline {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain what is queued and exit.
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("soft GPU timeline thread panicked");
            }
        }
    }
}

fn run(shared: &Shared, jobs: Receiver<Job>, latency: Duration) {
    log::debug!("soft GPU timeline started");

    for job in jobs {
        if !latency.is_zero() && matches!(job, Job::Execute { .. }) {
            thread::sleep(latency);
        }

        let mut state = shared.lock();
        if state.lost.is_some() {
            continue;
        }

        let result = match job {
            Job::Execute {
                submission,
                commands,
            } => state.execute(&commands).map(|()| {
                state.completed_submission = submission.get();
                log::trace!("soft GPU finished submission {}", submission.get());
            }),
            Job::Signal { fence, value } => state.signal(fence, value),
            Job::Present { swap_chain, image } => state.present(image).map(|()| {
                log::trace!("soft GPU presented swap chain {}", swap_chain.id());
            }),
        };

        if let Err(reason) = result {
            log::error!("soft device removed: {reason}");
            state.lost = Some(reason);
        }

        drop(state);
        shared.progress.notify_all();
    }

    log::debug!("soft GPU timeline stopped");
}
