//! aiwc-engine: architecture-independent workload characterisation for
//! data-parallel kernel interpreters.
//!
//! The interpreter replays a kernel and reports every event — instructions,
//! memory accesses, barriers, work-item and work-group lifecycle — through
//! the callback surface here. The engine accumulates per-worker
//! observations lock-free, merges them per work-group into a per-invocation
//! aggregate, and at kernel end reduces the aggregate to a fixed vector of
//! device-neutral metrics (instruction mix, memory entropies, parallel
//! spatial locality, SIMD widths, branch-history entropies) written as a
//! CSV report. Host↔device copies are tracked outside kernel execution and
//! written as a sidecar at teardown.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use aiwc_engine::{
//!     Dim3, KernelLaunch, Opcode, OpcodeNames, WorkerId, WorkloadCharacteriser,
//! };
//!
//! struct Names;
//! impl OpcodeNames for Names {
//!     fn opcode_name(&self, _opcode: Opcode) -> &str { "add" }
//! }
//!
//! let engine = WorkloadCharacteriser::new();
//! engine.kernel_begin(KernelLaunch {
//!     kernel_name: "vec_add".to_string(),
//!     work_group_size_specified: true,
//!     num_groups: Dim3::new(64, 1, 1),
//!     local_size: Dim3::new(256, 1, 1),
//! });
//!
//! // On each worker thread, per work-group:
//! let mut worker = engine.work_group_begin(WorkerId(0));
//! worker.work_item_begin();
//! // ... worker.instruction_executed(...), worker.memory_load(...), ...
//! worker.work_item_complete();
//! engine.work_group_complete(WorkerId(0), worker);
//!
//! engine.kernel_end(&Names);
//! ```

pub mod aggregate;
pub mod engine;
pub mod locality;
pub mod metrics;
pub mod report;
pub mod transfers;
pub mod types;
pub mod worker;

pub use aggregate::{Aggregate, HISTORY_LEN};
pub use engine::WorkloadCharacteriser;
pub use locality::{entropy, parallel_spatial_locality, Ledger, LedgerElement, SKIP_LEVELS};
pub use metrics::{KernelMetrics, MetricsError, SimdStats, SpreadStats};
pub use report::{render_report, resolve_report_path, OUTPUT_DIR_ENV, OUTPUT_PATH_ENV};
pub use transfers::TransferLog;
pub use types::{
    AddressSpace, BlockId, BranchSite, BranchTargets, Dim3, InstructionDesc, KernelLaunch,
    MemOp, MemoryAccess, Opcode, OpcodeNames, WorkerId,
};
pub use worker::WorkerState;
