//! Monitor thread: wakes idle threads, detects quiescence, balances load.

use crate::balance;
use crate::scheduler::Shared;
use crate::thread_context::{ThreadContext, ThreadLoad};
use log::{debug, trace};
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Periodic supervisor of a multi-threaded run (like Go's sysmon)
pub(crate) struct Monitor {
    shared: Arc<Shared>,
    threads: Vec<Arc<ThreadContext>>,
    tick: Duration,
}

impl Monitor {
    pub(crate) fn new(shared: Arc<Shared>, threads: Vec<Arc<ThreadContext>>, tick: Duration) -> Self {
        Self {
            shared,
            threads,
            tick,
        }
    }

    /// Start the monitoring thread
    pub(crate) fn start(self) -> io::Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name("spindle-monitor".to_string())
            .spawn(move || self.run_loop())
    }

    fn run_loop(self) {
        debug!("monitor started for {} threads", self.threads.len());
        loop {
            thread::sleep(self.tick);
            if !self.check() {
                break;
            }
        }
        debug!("monitor stopped");
    }

    /// One monitor pass. Returns false once the run is over.
    fn check(&self) -> bool {
        if self.threads.iter().all(|t| t.is_stopped()) {
            return false;
        }

        let loads: Vec<ThreadLoad> = self.threads.iter().map(|t| t.load()).collect();

        for (thread, load) in self.threads.iter().zip(&loads) {
            if load.parked && (load.run_queue > 0 || load.io_interest) {
                thread.notify();
            }
        }

        if is_quiescent(&loads) {
            debug!("all threads idle with no pending tasks, stopping");
            self.shared.stop_all();
            return false;
        }

        let depths: Vec<usize> = loads.iter().map(|l| l.run_queue).collect();
        for transfer in balance::plan(&depths) {
            let tasks = self.threads[transfer.from].steal_tasks(transfer.count);
            if tasks.is_empty() {
                continue;
            }
            trace!(
                "moving {} tasks from thread {} to thread {}",
                tasks.len(),
                transfer.from,
                transfer.to
            );
            self.threads[transfer.to].push_tasks(tasks);
        }
        true
    }
}

fn is_quiescent(loads: &[ThreadLoad]) -> bool {
    loads
        .iter()
        .all(|l| l.parked && l.run_queue == 0 && l.waiting == 0)
}
