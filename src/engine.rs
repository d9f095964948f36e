//! Invocation lifecycle and worker-state ownership.
//!
//! [`WorkloadCharacteriser`] is the long-lived plugin object. It owns the
//! per-invocation [`Aggregate`], the transfer log, and a registry of parked
//! [`WorkerState`]s keyed by worker id — all behind one mutex, which is
//! held only for merges, lifecycle transitions, and report emission.
//!
//! Worker state is handed out by value: `work_group_begin` checks a
//! worker's accumulator out of the registry (creating it on first use) and
//! the worker thread owns it, lock-free, until `work_group_complete` folds
//! it back in. The hot path therefore never contends.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::aggregate::Aggregate;
use crate::metrics::KernelMetrics;
use crate::report;
use crate::transfers::TransferLog;
use crate::types::{KernelLaunch, OpcodeNames, WorkerId};
use crate::worker::WorkerState;

#[derive(Debug, Default)]
struct EngineInner {
    aggregate: Aggregate,
    launch: Option<KernelLaunch>,
    transfers: TransferLog,
    parked: HashMap<WorkerId, WorkerState>,
    transfers_flushed: bool,
}

/// The workload-characterisation plugin: one instance per interpreter
/// process, driven entirely through callbacks.
#[derive(Debug, Default)]
pub struct WorkloadCharacteriser {
    inner: Mutex<EngineInner>,
}

impl WorkloadCharacteriser {
    pub fn new() -> Self {
        Self::default()
    }

    /// The engine is observational: a worker panic must not also discard
    /// the transfer log or wedge later invocations, so poisoning is
    /// stripped.
    fn inner(&self) -> MutexGuard<'_, EngineInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// A kernel was enqueued: capture its geometry, attribute pending
    /// host→device copies to it, and start a fresh aggregate.
    pub fn kernel_begin(&self, launch: KernelLaunch) {
        let mut inner = self.inner();
        inner.transfers.kernel_named(&launch.kernel_name);
        inner.aggregate.reset();
        inner.launch = Some(launch);
    }

    /// The kernel finished: reduce the aggregate, emit the report, reset.
    ///
    /// Reduction and emission failures are logged and skipped; later
    /// invocations are unaffected.
    pub fn kernel_end(&self, names: &dyn OpcodeNames) {
        let mut inner = self.inner();
        let Some(launch) = inner.launch.take() else {
            log::error!("kernel_end without a matching kernel_begin");
            return;
        };

        match KernelMetrics::from_aggregate(&inner.aggregate, &launch, names) {
            Ok(metrics) => {
                if let Err(err) = report::write_report(&metrics) {
                    log::error!(
                        "failed to write report for kernel '{}': {err}",
                        launch.kernel_name
                    );
                }
            }
            Err(err) => {
                log::error!(
                    "no metrics for kernel '{}': {err}",
                    launch.kernel_name
                );
            }
        }

        inner.aggregate.reset();
    }

    /// Check out the calling worker's accumulator for one work group.
    ///
    /// The accumulator is created on the worker's first checkout, reset on
    /// every checkout, and sized to the current launch's local volume.
    pub fn work_group_begin(&self, worker: WorkerId) -> WorkerState {
        let mut inner = self.inner();
        let local_size = inner
            .launch
            .as_ref()
            .expect("work_group_begin outside a kernel invocation")
            .local_size;
        let mut state = inner.parked.remove(&worker).unwrap_or_default();
        state.reset_for_group(local_size);
        state
    }

    /// Fold a completed work group into the invocation aggregate and park
    /// the accumulator for the worker's next checkout.
    pub fn work_group_complete(&self, worker: WorkerId, mut state: WorkerState) {
        let mut inner = self.inner();
        inner.aggregate.merge_group(&mut state);
        log::debug!(
            "merged work-group from worker {}: {} work-items so far",
            worker.0,
            inner.aggregate.threads_invoked
        );
        inner.parked.insert(worker, state);
    }

    /// A host→device copy outside kernel execution.
    pub fn host_memory_store(&self) {
        self.inner().transfers.record_host_store();
    }

    /// A device→host copy outside kernel execution.
    pub fn host_memory_load(&self) {
        self.inner().transfers.record_host_load();
    }

    /// Write the transfer sidecar into `dir` now instead of at teardown.
    pub fn flush_transfers_to(&self, dir: &Path) -> io::Result<PathBuf> {
        let mut inner = self.inner();
        inner.transfers_flushed = true;
        inner.transfers.write_to(dir)
    }
}

impl Drop for WorkloadCharacteriser {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(|p| p.into_inner());
        if inner.transfers_flushed || inner.transfers.is_empty() {
            return;
        }
        if let Err(err) = inner.transfers.write_to(Path::new("")) {
            log::error!("failed to write memory-transfer log: {err}");
        }
    }
}
