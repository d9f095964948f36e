//! Per-worker accumulator and the per-instruction observer hot path.
//!
//! The interpreter checks a [`WorkerState`] out of the engine at
//! `work_group_begin` and owns it, lock-free, until `work_group_complete`
//! hands it back for the merge. Every observer method here runs
//! synchronously on the thread executing the work-item, once per event, so
//! the hot path is plain field updates and hash-map bumps — no allocation
//! beyond map growth, no locking.

use std::collections::HashMap;

use crate::locality::{parallel_spatial_locality, Ledger, SKIP_LEVELS};
use crate::types::{
    AddressSpace, BlockId, BranchSite, Dim3, InstructionDesc, MemOp, Opcode,
};

/// A conditional branch observed on the previous instruction; the next
/// instruction's parent block resolves which successor was taken.
#[derive(Debug, Clone, Copy)]
struct ArmedBranch {
    taken: BlockId,
    not_taken: BlockId,
    site: BranchSite,
}

/// Accumulator for one interpreter worker thread.
///
/// Created lazily at the thread's first work-group checkout, reset at each
/// subsequent checkout, drained by the merge at each completion. Exactly one
/// exists per worker and only that worker touches it between begin and
/// complete.
#[derive(Debug, Default)]
pub struct WorkerState {
    pub(crate) load_ops: HashMap<u64, u32>,
    pub(crate) store_ops: HashMap<u64, u32>,
    pub(crate) compute_ops: HashMap<Opcode, u64>,
    pub(crate) branch_ops: HashMap<BranchSite, Vec<bool>>,
    pub(crate) instruction_width: HashMap<u16, u64>,
    pub(crate) load_labels: HashMap<String, u64>,
    pub(crate) store_labels: HashMap<String, u64>,

    pub(crate) instructions_between_barriers: Vec<u32>,
    pub(crate) instructions_per_workitem: Vec<u32>,
    pub(crate) instructions_between_load_or_store: Vec<u32>,

    instruction_count: u32,
    workitem_instruction_count: u32,
    ops_between_load_or_store: u32,
    pub(crate) threads_invoked: u64,
    pub(crate) barriers_hit: u64,
    pub(crate) global_memory_access_count: u64,
    pub(crate) local_memory_access_count: u64,
    pub(crate) constant_memory_access_count: u64,

    armed_branch: Option<ArmedBranch>,

    local_size: Dim3,
    pub(crate) ledger: Ledger,
    /// Per-barrier (PSL vector, longest access stream) records for this
    /// group, including the residual record appended during the merge.
    pub(crate) psl_per_barrier: Vec<([f64; SKIP_LEVELS], usize)>,
}

impl WorkerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset for a new work group and size the ledger to the group's local
    /// volume. One row per work-item, indexed by the linearised local id.
    /// Normally invoked by the engine at checkout.
    pub fn reset_for_group(&mut self, local_size: Dim3) {
        self.load_ops.clear();
        self.store_ops.clear();
        self.compute_ops.clear();
        self.branch_ops.clear();
        self.instruction_width.clear();
        self.load_labels.clear();
        self.store_labels.clear();
        self.instructions_between_barriers.clear();
        self.instructions_per_workitem.clear();
        self.instructions_between_load_or_store.clear();
        self.instruction_count = 0;
        self.workitem_instruction_count = 0;
        self.ops_between_load_or_store = 0;
        self.threads_invoked = 0;
        self.barriers_hit = 0;
        self.global_memory_access_count = 0;
        self.local_memory_access_count = 0;
        self.constant_memory_access_count = 0;
        self.armed_branch = None;
        self.local_size = local_size;
        self.ledger.resize(local_size.volume());
        self.psl_per_barrier.clear();
    }

    /// Observe one executed instruction. `result_width` is the operand
    /// vector width of the instruction's result.
    pub fn instruction_executed(&mut self, inst: &InstructionDesc, result_width: u16) {
        *self.compute_ops.entry(inst.opcode).or_insert(0) += 1;

        // The run length recorded at a memory instruction includes the
        // memory instruction itself.
        self.ops_between_load_or_store += 1;
        if let Some(memory) = &inst.memory {
            let labels = match memory.op {
                MemOp::Load => &mut self.load_labels,
                MemOp::Store => &mut self.store_labels,
            };
            match labels.get_mut(memory.pointer.as_str()) {
                Some(count) => *count += 1,
                None => {
                    labels.insert(memory.pointer.clone(), 1);
                }
            }
            self.instructions_between_load_or_store
                .push(self.ops_between_load_or_store);
            self.ops_between_load_or_store = 0;

            match memory.space {
                AddressSpace::Global => self.global_memory_access_count += 1,
                AddressSpace::Local => self.local_memory_access_count += 1,
                AddressSpace::Constant => self.constant_memory_access_count += 1,
                AddressSpace::Private => {}
            }
        }

        // Resolve the branch armed by the previous instruction before
        // arming on this one, so branch-after-branch sequences work.
        if let Some(armed) = self.armed_branch.take() {
            if inst.block == armed.taken {
                self.branch_ops.entry(armed.site).or_default().push(true);
            } else if inst.block == armed.not_taken {
                self.branch_ops.entry(armed.site).or_default().push(false);
            } else {
                log::error!(
                    "branch at {:#x} fell through to block {:#x}, expected {:#x} or {:#x}",
                    armed.site.handle,
                    inst.block.0,
                    armed.taken.0,
                    armed.not_taken.0,
                );
                panic!("conditional branch resolved to neither successor");
            }
        }
        if let Some(targets) = inst.cond_targets {
            self.armed_branch = Some(ArmedBranch {
                taken: targets.taken,
                not_taken: targets.not_taken,
                site: inst.branch_site(),
            });
        }

        self.instruction_count += 1;
        self.workitem_instruction_count += 1;
        *self.instruction_width.entry(result_width).or_insert(0) += 1;
    }

    /// Observe a load. Private accesses carry no address-level metrics.
    #[inline]
    pub fn memory_load(&mut self, space: AddressSpace, local: Dim3, address: u64, _size: usize) {
        if space != AddressSpace::Private {
            *self.load_ops.entry(address).or_insert(0) += 1;
            let row = self.local_size.linear_index(local);
            self.ledger.record(row, address, 0);
        }
    }

    /// Observe a store. Private accesses carry no address-level metrics.
    #[inline]
    pub fn memory_store(&mut self, space: AddressSpace, local: Dim3, address: u64, _size: usize) {
        if space != AddressSpace::Private {
            *self.store_ops.entry(address).or_insert(0) += 1;
            let row = self.local_size.linear_index(local);
            self.ledger.record(row, address, 0);
        }
    }

    /// Atomic load; identical to [`Self::memory_load`], with the "not
    /// private" test on the raw address-space tag.
    #[inline]
    pub fn memory_atomic_load(
        &mut self,
        space: AddressSpace,
        local: Dim3,
        address: u64,
        size: usize,
    ) {
        if space.as_raw() != 0 {
            self.memory_load(space, local, address, size);
        }
    }

    /// Atomic store; identical to [`Self::memory_store`], with the "not
    /// private" test on the raw address-space tag.
    #[inline]
    pub fn memory_atomic_store(
        &mut self,
        space: AddressSpace,
        local: Dim3,
        address: u64,
        size: usize,
    ) {
        if space.as_raw() != 0 {
            self.memory_store(space, local, address, size);
        }
    }

    pub fn work_item_begin(&mut self) {
        self.threads_invoked += 1;
        self.instruction_count = 0;
        self.workitem_instruction_count = 0;
        self.ops_between_load_or_store = 0;
    }

    pub fn work_item_complete(&mut self) {
        self.instructions_between_barriers.push(self.instruction_count);
        self.instructions_per_workitem
            .push(self.workitem_instruction_count);
    }

    pub fn work_item_barrier(&mut self) {
        self.barriers_hit += 1;
        self.instructions_between_barriers.push(self.instruction_count);
        self.instruction_count = 0;
    }

    pub fn work_item_clear_barrier(&mut self) {
        self.instruction_count = 0;
    }

    /// All work-items of the group arrived at a barrier: snapshot the
    /// ledger's PSL, remember the longest stream as its weight, and start a
    /// fresh ledger window (row slots retained).
    pub fn work_group_barrier(&mut self) {
        let psl = parallel_spatial_locality(&self.ledger);
        let max_len = self.ledger.max_row_len();
        self.ledger.clear_rows();
        self.psl_per_barrier.push((psl, max_len));
    }
}
