//! The box's two long-running loops: following the farmer's desired state,
//! and the liveness heartbeat.

use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::core::types::{BoxPingReq, BoxState};
use crate::io::farmer::Farmer;
use crate::job::{JobHandle, JobRunner};

/// Follows the farmer's desired state, running at most one job at a time.
pub struct Coordinator {
    runner: JobRunner,
    state: BoxState,
    current: JobHandle,
    state_retry: Duration,
}

impl Coordinator {
    pub fn new(runner: JobRunner, box_id: impl Into<String>, state_retry: Duration) -> Self {
        Self {
            runner,
            state: BoxState::idle(box_id),
            current: JobHandle::idle(),
            state_retry,
        }
    }

    /// Last state this box acted on.
    pub fn state(&self) -> &BoxState {
        &self.state
    }

    /// Follow the farmer forever.
    pub fn run(mut self) -> ! {
        loop {
            self.step();
        }
    }

    /// Wait for the desired state to change, then act on it.
    pub fn step(&mut self) {
        let next = wait_state(self.runner.farmer.as_ref(), &self.state, self.state_retry);
        self.apply(next);
    }

    /// Cancel whatever is running and start `next`'s job.
    ///
    /// The previous job has reported and released the registry before the
    /// next one is started.
    pub fn apply(&mut self, next: BoxState) {
        info!(job = %next.job, "desired state changed");
        std::mem::take(&mut self.current).cancel();
        self.current = self.runner.start_job(&next.job);
        self.state = next;
    }

    /// Block until the current job finishes on its own.
    pub fn wait_current(&mut self) {
        std::mem::take(&mut self.current).wait();
    }
}

/// Long-poll until the farmer's desired state differs from `old`.
///
/// Poll errors are logged and retried after `retry`.
pub fn wait_state(farmer: &dyn Farmer, old: &BoxState, retry: Duration) -> BoxState {
    loop {
        match farmer.long_poll(old) {
            Ok(state) if state != *old => return state,
            Ok(_) => debug!("long poll returned unchanged state"),
            Err(err) => {
                warn!(err = %format!("{err:#}"), "long poll failed");
                thread::sleep(retry);
            }
        }
    }
}

/// Ping the farmer every `interval` until a ping fails, and return that
/// failure.
pub fn heartbeat(farmer: &dyn Farmer, req: &BoxPingReq, interval: Duration) -> anyhow::Error {
    loop {
        thread::sleep(interval);
        if let Err(err) = farmer.ping(req) {
            return err;
        }
    }
}
