//! Per-invocation aggregate and the work-group merge.
//!
//! One [`Aggregate`] exists per kernel invocation, behind the engine's
//! mutex. Workers drain into it serially at `work_group_complete`: counts
//! add key-wise, sequences concatenate in arrival order, and each worker's
//! branch outcome streams are folded into 16-bit history patterns. No
//! ordering is assumed between work-groups; everything merged here commutes
//! up to floating-point summation order.

use std::collections::HashMap;

use crate::locality::{parallel_spatial_locality, SKIP_LEVELS};
use crate::types::{BranchSite, Opcode};
use crate::worker::WorkerState;

/// Branch-history window length, in outcomes per pattern.
pub const HISTORY_LEN: usize = 16;

/// Union of the per-worker accumulators over one kernel invocation, plus
/// the per-group weighted PSL averages.
#[derive(Debug, Default)]
pub struct Aggregate {
    pub load_ops: HashMap<u64, u64>,
    pub store_ops: HashMap<u64, u64>,
    pub compute_ops: HashMap<Opcode, u64>,
    pub branch_counts: HashMap<BranchSite, u64>,
    pub branch_patterns: HashMap<BranchSite, HashMap<u16, u32>>,
    pub instruction_width: HashMap<u16, u64>,
    pub load_labels: HashMap<String, u64>,
    pub store_labels: HashMap<String, u64>,
    pub instructions_between_barriers: Vec<u32>,
    pub instructions_per_workitem: Vec<u32>,
    pub instructions_between_load_or_store: Vec<u32>,
    pub threads_invoked: u64,
    pub barriers_hit: u64,
    pub global_memory_access: u64,
    pub local_memory_access: u64,
    pub constant_memory_access: u64,
    /// One weighted-average PSL vector per merged work-group.
    pub psl_per_group: Vec<[f64; SKIP_LEVELS]>,
}

impl Aggregate {
    pub fn reset(&mut self) {
        self.load_ops.clear();
        self.store_ops.clear();
        self.compute_ops.clear();
        self.branch_counts.clear();
        self.branch_patterns.clear();
        self.instruction_width.clear();
        self.load_labels.clear();
        self.store_labels.clear();
        self.instructions_between_barriers.clear();
        self.instructions_per_workitem.clear();
        self.instructions_between_load_or_store.clear();
        self.threads_invoked = 0;
        self.barriers_hit = 0;
        self.global_memory_access = 0;
        self.local_memory_access = 0;
        self.constant_memory_access = 0;
        self.psl_per_group.clear();
    }

    /// Merge one completed work-group. Must run under the invocation mutex.
    ///
    /// The worker is left with its ledger cleared and the residual PSL
    /// record appended; its maps are read, not drained — the next checkout
    /// resets them.
    pub fn merge_group(&mut self, state: &mut WorkerState) {
        for (&opcode, &count) in &state.compute_ops {
            *self.compute_ops.entry(opcode).or_insert(0) += count;
        }
        for (&address, &count) in &state.store_ops {
            *self.store_ops.entry(address).or_insert(0) += u64::from(count);
        }
        for (&address, &count) in &state.load_ops {
            *self.load_ops.entry(address).or_insert(0) += u64::from(count);
        }

        for (site, outcomes) in &state.branch_ops {
            *self.branch_counts.entry(*site).or_insert(0) += outcomes.len() as u64;
            self.fold_patterns(*site, outcomes);
        }

        self.threads_invoked += state.threads_invoked;
        self.barriers_hit += state.barriers_hit;

        self.instructions_between_barriers
            .extend_from_slice(&state.instructions_between_barriers);
        self.instructions_per_workitem
            .extend_from_slice(&state.instructions_per_workitem);
        self.instructions_between_load_or_store
            .extend_from_slice(&state.instructions_between_load_or_store);

        for (&width, &count) in &state.instruction_width {
            *self.instruction_width.entry(width).or_insert(0) += count;
        }
        for (label, &count) in &state.load_labels {
            *self.load_labels.entry(label.clone()).or_insert(0) += count;
        }
        for (label, &count) in &state.store_labels {
            *self.store_labels.entry(label.clone()).or_insert(0) += count;
        }

        self.global_memory_access += state.global_memory_access_count;
        self.local_memory_access += state.local_memory_access_count;
        self.constant_memory_access += state.constant_memory_access_count;

        // Accesses after the last work-group barrier form a final window;
        // its record carries its own stream length as weight, like any
        // other barrier window.
        let residual = parallel_spatial_locality(&state.ledger);
        let residual_len = state.ledger.max_row_len();
        state.ledger.clear_rows();
        state.psl_per_barrier.push((residual, residual_len));

        self.psl_per_group.push(weighted_group_psl(&state.psl_per_barrier));
    }

    /// Fold one site's outcome stream into rolling 16-outcome patterns.
    /// Streams shorter than the window record a count but no patterns.
    fn fold_patterns(&mut self, site: BranchSite, outcomes: &[bool]) {
        if outcomes.len() < HISTORY_LEN {
            return;
        }
        let site_patterns = self.branch_patterns.entry(site).or_default();
        let mut pattern: u16 = 0;
        for (i, &taken) in outcomes.iter().enumerate() {
            pattern = (pattern << 1) | u16::from(taken);
            if i + 1 >= HISTORY_LEN {
                *site_patterns.entry(pattern).or_insert(0) += 1;
            }
        }
    }
}

/// Length-weighted mean of a group's per-barrier PSL records:
/// `avg[skip] = Σ psl_i[skip]·len_i / (Σ len_i + 1)`, all zeros when no
/// window saw an access.
fn weighted_group_psl(records: &[([f64; SKIP_LEVELS], usize)]) -> [f64; SKIP_LEVELS] {
    let mut weighted = [0.0f64; SKIP_LEVELS];
    let mut total_len = 0usize;
    for (psl, len) in records {
        total_len += len;
        for (acc, value) in weighted.iter_mut().zip(psl.iter()) {
            *acc += value * *len as f64;
        }
    }
    if total_len != 0 {
        let denom = (total_len + 1) as f64;
        for value in &mut weighted {
            *value /= denom;
        }
    }
    weighted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AddressSpace, BlockId, BranchTargets, Dim3, InstructionDesc};

    fn worker_with_branches(handle: u64, outcomes: &[bool]) -> WorkerState {
        let mut state = WorkerState::new();
        state.reset_for_group(Dim3::new(1, 1, 1));
        state.work_item_begin();
        for &taken in outcomes {
            let branch = InstructionDesc {
                handle,
                opcode: Opcode(2),
                block: BlockId(100),
                memory: None,
                cond_targets: Some(BranchTargets {
                    taken: BlockId(200),
                    not_taken: BlockId(300),
                }),
                debug_line: None,
            };
            state.instruction_executed(&branch, 1);
            let successor = InstructionDesc {
                handle: handle + 1,
                opcode: Opcode(3),
                block: BlockId(if taken { 200 } else { 300 }),
                memory: None,
                cond_targets: None,
                debug_line: None,
            };
            state.instruction_executed(&successor, 1);
        }
        state.work_item_complete();
        state
    }

    #[test]
    fn test_merge_adds_counts_and_concatenates_sequences() {
        let mut agg = Aggregate::default();

        let mut a = WorkerState::new();
        a.reset_for_group(Dim3::new(1, 1, 1));
        a.work_item_begin();
        a.memory_load(AddressSpace::Global, Dim3::new(0, 0, 0), 0x100, 4);
        a.memory_load(AddressSpace::Global, Dim3::new(0, 0, 0), 0x200, 4);
        a.work_item_complete();

        let mut b = WorkerState::new();
        b.reset_for_group(Dim3::new(1, 1, 1));
        b.work_item_begin();
        b.memory_load(AddressSpace::Global, Dim3::new(0, 0, 0), 0x100, 4);
        b.memory_store(AddressSpace::Global, Dim3::new(0, 0, 0), 0x300, 4);
        b.work_item_complete();

        agg.merge_group(&mut a);
        agg.merge_group(&mut b);

        assert_eq!(agg.load_ops[&0x100], 2);
        assert_eq!(agg.load_ops[&0x200], 1);
        assert_eq!(agg.store_ops[&0x300], 1);
        assert_eq!(agg.threads_invoked, 2);
        assert_eq!(agg.instructions_per_workitem, vec![0, 0]);
        assert_eq!(agg.psl_per_group.len(), 2);
    }

    #[test]
    fn test_short_branch_stream_counts_but_no_patterns() {
        let mut agg = Aggregate::default();
        let mut state = worker_with_branches(7, &[true; HISTORY_LEN - 1]);
        agg.merge_group(&mut state);

        let site = BranchSite { handle: 7, line: None };
        assert_eq!(agg.branch_counts[&site], (HISTORY_LEN - 1) as u64);
        assert!(!agg.branch_patterns.contains_key(&site));
    }

    #[test]
    fn test_pattern_extraction_all_taken() {
        let mut agg = Aggregate::default();
        let mut state = worker_with_branches(7, &[true; 32]);
        agg.merge_group(&mut state);

        let site = BranchSite { handle: 7, line: None };
        assert_eq!(agg.branch_counts[&site], 32);
        let patterns = &agg.branch_patterns[&site];
        // 32 outcomes yield 17 windows, all of them 0xFFFF.
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[&0xFFFF], 17);
    }

    #[test]
    fn test_pattern_extraction_alternating() {
        let mut agg = Aggregate::default();
        let outcomes: Vec<bool> = (0..32).map(|i| i % 2 == 0).collect();
        let mut state = worker_with_branches(7, &outcomes);
        agg.merge_group(&mut state);

        let site = BranchSite { handle: 7, line: None };
        let patterns = &agg.branch_patterns[&site];
        // The register alternates between the two phase patterns.
        assert_eq!(patterns.len(), 2);
        assert_eq!(patterns[&0xAAAA], 9);
        assert_eq!(patterns[&0x5555], 8);
        let windows: u32 = patterns.values().sum();
        assert_eq!(windows, 17);
    }

    #[test]
    fn test_pattern_counts_bounded_by_branch_counts() {
        let mut agg = Aggregate::default();
        let outcomes: Vec<bool> = (0..40).map(|i| i % 3 == 0).collect();
        let mut state = worker_with_branches(9, &outcomes);
        agg.merge_group(&mut state);

        let site = BranchSite { handle: 9, line: None };
        let pattern_total: u64 = agg.branch_patterns[&site]
            .values()
            .map(|&c| u64::from(c))
            .sum();
        assert!(agg.branch_counts[&site] >= pattern_total);
        assert_eq!(pattern_total, 40 - (HISTORY_LEN as u64 - 1));
    }

    #[test]
    fn test_merge_order_independent_for_patterns() {
        let streams: Vec<Vec<bool>> = vec![
            (0..20).map(|i| i % 2 == 0).collect(),
            (0..25).map(|i| i % 5 != 0).collect(),
            vec![true; 18],
        ];

        let run = |order: &[usize]| {
            let mut agg = Aggregate::default();
            for &idx in order {
                let mut state = worker_with_branches(7, &streams[idx]);
                agg.merge_group(&mut state);
            }
            let site = BranchSite { handle: 7, line: None };
            let mut flat: Vec<(u16, u32)> = agg.branch_patterns[&site]
                .iter()
                .map(|(&p, &c)| (p, c))
                .collect();
            flat.sort_unstable();
            (agg.branch_counts[&site], flat)
        };

        assert_eq!(run(&[0, 1, 2]), run(&[2, 0, 1]));
        assert_eq!(run(&[0, 1, 2]), run(&[1, 2, 0]));
    }

    #[test]
    fn test_residual_ledger_becomes_final_barrier_record() {
        let mut agg = Aggregate::default();
        let mut state = WorkerState::new();
        state.reset_for_group(Dim3::new(1, 1, 1));
        state.work_item_begin();
        state.memory_load(AddressSpace::Global, Dim3::new(0, 0, 0), 0x1000, 4);
        state.work_group_barrier();
        state.memory_load(AddressSpace::Global, Dim3::new(0, 0, 0), 0x2000, 4);
        state.memory_load(AddressSpace::Global, Dim3::new(0, 0, 0), 0x3000, 4);
        state.work_item_complete();

        agg.merge_group(&mut state);
        // One explicit barrier record plus the residual window.
        assert_eq!(state.psl_per_barrier.len(), 2);
        assert_eq!(state.psl_per_barrier[0].1, 1);
        assert_eq!(state.psl_per_barrier[1].1, 2);
        assert_eq!(agg.psl_per_group.len(), 1);
    }

    #[test]
    fn test_weighted_group_psl_weights_by_stream_length() {
        let mut one = [0.0; SKIP_LEVELS];
        one[0] = 1.0;
        let mut three = [0.0; SKIP_LEVELS];
        three[0] = 3.0;
        // Weights 1 and 3: (1·1 + 3·3) / (4 + 1) = 2.0.
        let avg = weighted_group_psl(&[(one, 1), (three, 3)]);
        assert!((avg[0] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_weighted_group_psl_empty_windows_yield_zeros() {
        let zero = [0.0; SKIP_LEVELS];
        assert_eq!(weighted_group_psl(&[(zero, 0), (zero, 0)]), zero);
    }
}
