//! End-of-invocation metric reduction.
//!
//! [`KernelMetrics::from_aggregate`] runs once per kernel invocation and
//! derives the full architecture-independent metric vector from the merged
//! [`Aggregate`]. Everything here is pure arithmetic over the aggregate;
//! rendering and file placement live in `report`.

use std::collections::HashMap;
use std::fmt;

use crate::aggregate::{Aggregate, HISTORY_LEN};
use crate::locality::SKIP_LEVELS;
use crate::types::{Dim3, KernelLaunch, OpcodeNames};

/// Reduction failure for an invocation with nothing to reduce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricsError {
    /// No work-item ran to completion, so the per-item sequences are empty
    /// and min/max/median are undefined.
    NoWorkItems,
}

impl fmt::Display for MetricsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoWorkItems => {
                write!(f, "invocation executed no work-items; nothing to reduce")
            }
        }
    }
}

impl std::error::Error for MetricsError {}

/// Min/max/median triple over a per-work-item sequence. The median of an
/// even-length sequence is the integer mean of the two central elements.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpreadStats {
    pub min: u32,
    pub max: u32,
    pub median: f64,
}

/// Operand vector-width statistics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimdStats {
    pub min: u16,
    pub max: u16,
    pub mean: f64,
    pub stdev: f64,
    /// Σ width·count over all executed instructions.
    pub operand_sum: u64,
}

/// The derived metric vector for one kernel invocation.
///
/// Field names say what the values are. Two report rows intentionally
/// carry swapped labels relative to these fields — see
/// `report::render_report` — because downstream consumers were trained on
/// the swapped emission and correcting it silently would break them.
#[derive(Debug, Clone)]
pub struct KernelMetrics {
    pub kernel_name: String,
    pub work_group_size_specified: bool,
    pub work_groups: Dim3,
    pub work_items_per_group: Dim3,

    /// (opcode name, execution count), count-descending.
    pub opcode_counts: Vec<(String, u64)>,
    pub freedom_to_reorder: f64,
    pub resource_pressure: f64,

    pub work_items: u64,
    pub total_barriers_hit: u64,
    pub itb: SpreadStats,
    pub ipt: SpreadStats,
    pub simd: SimdStats,

    pub memory_access_count: u64,
    pub total_memory_footprint: u64,
    pub distinct_load_addresses: u64,
    pub distinct_store_addresses: u64,
    pub total_reads: u64,
    pub total_writes: u64,
    /// distinct loads / distinct stores; IEEE NaN/inf when stores are zero.
    pub unique_read_write_ratio: f64,
    pub rereads: f64,
    pub rewrites: f64,
    pub memory_footprint_90pc: u64,
    pub global_memory_address_entropy: f64,
    /// Entropy after masking 1..=10 low-order address bits.
    pub lmae: [f64; SKIP_LEVELS - 1],
    pub normed_psl: [f64; SKIP_LEVELS],
    pub global_memory_access: u64,
    pub local_memory_access: u64,
    pub constant_memory_access: u64,

    /// (site report id, visit count), count-descending, ties by id.
    pub branch_counts: Vec<(u64, u64)>,
    pub branch_history_len: usize,
    /// Occurrence-weighted Yokota entropy, kept for analysis; the report
    /// emits the per-workload variant below.
    pub yokota_entropy: f64,
    pub yokota_branch_entropy: f64,
    pub average_linear_branch_entropy: f64,
}

impl KernelMetrics {
    /// Reduce a merged invocation aggregate to the final metric vector.
    pub fn from_aggregate(
        aggregate: &Aggregate,
        launch: &KernelLaunch,
        names: &dyn OpcodeNames,
    ) -> Result<Self, MetricsError> {
        if aggregate.threads_invoked == 0
            || aggregate.instructions_between_barriers.is_empty()
            || aggregate.instructions_per_workitem.is_empty()
        {
            return Err(MetricsError::NoWorkItems);
        }

        let mut opcode_counts: Vec<(String, u64)> = aggregate
            .compute_ops
            .iter()
            .map(|(&opcode, &count)| (names.opcode_name(opcode).to_string(), count))
            .collect();
        opcode_counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let freedom_to_reorder = mean_u32(&aggregate.instructions_between_load_or_store);

        let label_total: u64 = aggregate.load_labels.values().sum::<u64>()
            + aggregate.store_labels.values().sum::<u64>();
        let resource_pressure = label_total as f64 / aggregate.threads_invoked as f64;

        let itb = spread_stats(&aggregate.instructions_between_barriers);
        let ipt = spread_stats(&aggregate.instructions_per_workitem);
        let simd = simd_stats(&aggregate.instruction_width);

        let memory = MemoryReduction::new(&aggregate.load_ops, &aggregate.store_ops);

        let items_per_group = launch.local_size.volume() as u64;
        let normed_psl = normed_psl(&aggregate.psl_per_group, items_per_group);

        let mut branch_counts: Vec<(u64, u64)> = aggregate
            .branch_counts
            .iter()
            .map(|(site, &count)| (site.report_id(), count))
            .collect();
        branch_counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let branches = branch_entropies(&aggregate.branch_patterns);

        Ok(Self {
            kernel_name: launch.kernel_name.clone(),
            work_group_size_specified: launch.work_group_size_specified,
            work_groups: launch.num_groups,
            work_items_per_group: launch.local_size,
            opcode_counts,
            freedom_to_reorder,
            resource_pressure,
            work_items: aggregate.threads_invoked,
            total_barriers_hit: aggregate.barriers_hit,
            itb,
            ipt,
            simd,
            memory_access_count: memory.access_count,
            total_memory_footprint: memory.footprint,
            distinct_load_addresses: aggregate.load_ops.len() as u64,
            distinct_store_addresses: aggregate.store_ops.len() as u64,
            total_reads: memory.total_reads,
            total_writes: memory.total_writes,
            unique_read_write_ratio: aggregate.load_ops.len() as f64
                / aggregate.store_ops.len() as f64,
            rereads: memory.total_reads as f64 / aggregate.load_ops.len() as f64,
            rewrites: memory.total_writes as f64 / aggregate.store_ops.len() as f64,
            memory_footprint_90pc: memory.footprint_90pc,
            global_memory_address_entropy: memory.global_entropy,
            lmae: memory.lmae,
            normed_psl,
            global_memory_access: aggregate.global_memory_access,
            local_memory_access: aggregate.local_memory_access,
            constant_memory_access: aggregate.constant_memory_access,
            branch_counts,
            branch_history_len: HISTORY_LEN,
            yokota_entropy: branches.yokota_total,
            yokota_branch_entropy: branches.yokota_per_workload,
            average_linear_branch_entropy: branches.average_linear,
        })
    }
}

fn mean_u32(values: &[u32]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().map(|&v| f64::from(v)).sum::<f64>() / values.len() as f64
}

/// Min/max/median of a non-empty sequence. Callers guard emptiness.
fn spread_stats(values: &[u32]) -> SpreadStats {
    let min = *values.iter().min().expect("non-empty sequence");
    let max = *values.iter().max().expect("non-empty sequence");

    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let n = sorted.len();
    let median = if n % 2 == 0 {
        f64::from((sorted[n / 2 - 1] + sorted[n / 2]) / 2)
    } else {
        f64::from(sorted[n / 2])
    };

    SpreadStats { min, max, median }
}

fn simd_stats(widths: &HashMap<u16, u64>) -> SimdStats {
    if widths.is_empty() {
        return SimdStats { min: 0, max: 0, mean: 0.0, stdev: 0.0, operand_sum: 0 };
    }

    let min = *widths.keys().min().expect("non-empty map");
    let max = *widths.keys().max().expect("non-empty map");

    let mut operand_sum = 0u64;
    let mut count_sum = 0u64;
    for (&width, &count) in widths {
        operand_sum += u64::from(width) * count;
        count_sum += count;
    }
    let mean = operand_sum as f64 / count_sum as f64;

    let mut sq_sum = 0.0f64;
    for (&width, &count) in widths {
        let delta = f64::from(width) - mean;
        sq_sum += delta * delta * count as f64;
    }
    let stdev = (sq_sum / count_sum as f64).sqrt();

    SimdStats { min, max, mean, stdev, operand_sum }
}

/// The combined-address-histogram reductions: footprint, 90% cover,
/// entropies. Built in one pass over the load and store maps.
struct MemoryReduction {
    access_count: u64,
    footprint: u64,
    total_reads: u64,
    total_writes: u64,
    footprint_90pc: u64,
    global_entropy: f64,
    lmae: [f64; SKIP_LEVELS - 1],
}

impl MemoryReduction {
    fn new(load_ops: &HashMap<u64, u64>, store_ops: &HashMap<u64, u64>) -> Self {
        // combined[0] is the raw address histogram; combined[k] buckets by
        // address >> k for the locality-masked entropies.
        let mut combined: Vec<HashMap<u64, u64>> = vec![HashMap::new(); SKIP_LEVELS];
        let mut total_reads = 0u64;
        let mut total_writes = 0u64;

        for (&address, &count) in store_ops {
            for (skip, buckets) in combined.iter_mut().enumerate() {
                *buckets.entry(address >> skip).or_insert(0) += count;
            }
            total_writes += count;
        }
        for (&address, &count) in load_ops {
            for (skip, buckets) in combined.iter_mut().enumerate() {
                *buckets.entry(address >> skip).or_insert(0) += count;
            }
            total_reads += count;
        }

        let access_count: u64 = combined[0].values().sum();
        let footprint = combined[0].len() as u64;

        let mut sorted_counts: Vec<u64> = combined[0].values().copied().collect();
        sorted_counts.sort_unstable_by(|a, b| b.cmp(a));

        let footprint_90pc = if access_count == 0 {
            0
        } else {
            let significant = (access_count as f64 * 0.9).ceil() as u64;
            let mut covered = 0u64;
            let mut addresses = 0u64;
            for &count in &sorted_counts {
                if covered >= significant {
                    break;
                }
                covered += count;
                addresses += 1;
            }
            addresses
        };

        // The end-of-invocation entropies divide by the raw access count;
        // the +1 smoothing belongs only to the per-barrier path.
        let global_entropy = raw_entropy(&combined[0], access_count);
        let mut lmae = [0.0f64; SKIP_LEVELS - 1];
        for skip in 1..SKIP_LEVELS {
            lmae[skip - 1] = raw_entropy(&combined[skip], access_count);
        }

        Self {
            access_count,
            footprint,
            total_reads,
            total_writes,
            footprint_90pc,
            global_entropy,
            lmae,
        }
    }
}

fn raw_entropy(buckets: &HashMap<u64, u64>, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let denom = total as f64;
    let mut entropy = 0.0f64;
    for &count in buckets.values() {
        let p = count as f64 / denom;
        entropy -= p * p.log2();
    }
    entropy
}

/// Mean of the per-group PSL vectors, normalised by `log2(items + 1)`.
fn normed_psl(per_group: &[[f64; SKIP_LEVELS]], items_per_group: u64) -> [f64; SKIP_LEVELS] {
    let mut out = [0.0f64; SKIP_LEVELS];
    if per_group.is_empty() {
        return out;
    }
    let norm = ((items_per_group + 1) as f64).log2();
    for group in per_group {
        for (acc, value) in out.iter_mut().zip(group.iter()) {
            *acc += value;
        }
    }
    for value in &mut out {
        *value = (*value / per_group.len() as f64) / norm;
    }
    out
}

struct BranchEntropies {
    yokota_total: f64,
    yokota_per_workload: f64,
    average_linear: f64,
}

/// Entropy reductions over the merged 16-outcome history patterns.
///
/// Each pattern's taken probability is its popcount over the window
/// length. Patterns never observed contribute nothing; a site whose stream
/// stayed below the window length has no patterns at all.
fn branch_entropies(
    patterns: &HashMap<crate::types::BranchSite, HashMap<u16, u32>>,
) -> BranchEntropies {
    let window = HISTORY_LEN as f64;
    let mut yokota_total = 0.0f64;
    let mut yokota_per_workload = 0.0f64;
    let mut linear_sum = 0.0f64;
    let mut occurrences = 0u64;

    for site_patterns in patterns.values() {
        for (&pattern, &n) in site_patterns {
            let taken = f64::from(pattern.count_ones());
            let q = taken / window;
            if q != 0.0 {
                yokota_total -= f64::from(n) * q * q.log2();
                yokota_per_workload -= q * q.log2();
            }
            linear_sum += f64::from(n) * 2.0 * q.min(1.0 - q);
            occurrences += u64::from(n);
        }
    }

    let mut average_linear = linear_sum / occurrences as f64;
    if average_linear.is_nan() {
        average_linear = 0.0;
    }

    BranchEntropies { yokota_total, yokota_per_workload, average_linear }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BranchSite, Opcode};

    struct NameTable(HashMap<Opcode, &'static str>);

    impl OpcodeNames for NameTable {
        fn opcode_name(&self, opcode: Opcode) -> &str {
            self.0.get(&opcode).copied().unwrap_or("unknown")
        }
    }

    fn names() -> NameTable {
        NameTable(
            [(Opcode(10), "add"), (Opcode(11), "mul"), (Opcode(2), "br")]
                .into_iter()
                .collect(),
        )
    }

    fn launch(local: Dim3) -> KernelLaunch {
        KernelLaunch {
            kernel_name: "k".to_string(),
            work_group_size_specified: true,
            num_groups: Dim3::new(1, 1, 1),
            local_size: local,
        }
    }

    fn base_aggregate() -> Aggregate {
        let mut aggregate = Aggregate::default();
        aggregate.threads_invoked = 1;
        aggregate.instructions_between_barriers.push(0);
        aggregate.instructions_per_workitem.push(0);
        aggregate.psl_per_group.push([0.0; SKIP_LEVELS]);
        aggregate
    }

    #[test]
    fn test_zero_work_items_is_a_structured_error() {
        let aggregate = Aggregate::default();
        let result =
            KernelMetrics::from_aggregate(&aggregate, &launch(Dim3::new(1, 1, 1)), &names());
        assert_eq!(result.unwrap_err(), MetricsError::NoWorkItems);
    }

    #[test]
    fn test_empty_kernel_reduces_to_zeros() {
        let aggregate = base_aggregate();
        let metrics =
            KernelMetrics::from_aggregate(&aggregate, &launch(Dim3::new(1, 1, 1)), &names())
                .unwrap();

        assert!(metrics.opcode_counts.is_empty());
        assert_eq!(metrics.work_items, 1);
        assert_eq!(metrics.memory_access_count, 0);
        assert_eq!(metrics.global_memory_address_entropy, 0.0);
        assert_eq!(metrics.average_linear_branch_entropy, 0.0);
        assert_eq!(metrics.normed_psl, [0.0; SKIP_LEVELS]);
        assert_eq!(metrics.simd.operand_sum, 0);
        assert_eq!(metrics.freedom_to_reorder, 0.0);
        assert_eq!(metrics.memory_footprint_90pc, 0);
    }

    #[test]
    fn test_opcode_counts_sorted_by_count_then_name() {
        let mut aggregate = base_aggregate();
        aggregate.compute_ops.insert(Opcode(10), 5);
        aggregate.compute_ops.insert(Opcode(11), 5);
        aggregate.compute_ops.insert(Opcode(2), 9);

        let metrics =
            KernelMetrics::from_aggregate(&aggregate, &launch(Dim3::new(1, 1, 1)), &names())
                .unwrap();
        let flat: Vec<(&str, u64)> = metrics
            .opcode_counts
            .iter()
            .map(|(name, count)| (name.as_str(), *count))
            .collect();
        assert_eq!(flat, vec![("br", 9), ("add", 5), ("mul", 5)]);
    }

    #[test]
    fn test_spread_stats_median_even_uses_integer_mean() {
        let stats = spread_stats(&[5, 2, 8, 3]);
        assert_eq!(stats.min, 2);
        assert_eq!(stats.max, 8);
        // Sorted 2,3,5,8: (3 + 5) / 2 = 4.
        assert_eq!(stats.median, 4.0);

        let odd = spread_stats(&[5, 2, 8, 3, 1]);
        assert_eq!(odd.median, 3.0);

        // Integer division truncates the half.
        let truncating = spread_stats(&[2, 3]);
        assert_eq!(truncating.median, 2.0);
    }

    #[test]
    fn test_simd_stats_weighted_mean_and_stdev() {
        let widths: HashMap<u16, u64> = [(1u16, 3u64), (4, 1)].into_iter().collect();
        let stats = simd_stats(&widths);
        assert_eq!(stats.min, 1);
        assert_eq!(stats.max, 4);
        assert_eq!(stats.operand_sum, 7);
        assert!((stats.mean - 1.75).abs() < 1e-12);
        // Variance: (3·(1−1.75)² + 1·(4−1.75)²) / 4 = 1.6875.
        assert!((stats.stdev - 1.6875f64.sqrt()).abs() < 1e-12);
        assert!(stats.min as f64 <= stats.mean && stats.mean <= stats.max as f64);
    }

    #[test]
    fn test_memory_reduction_sequential_stream() {
        // 1024 loads of byte-consecutive addresses from 0x1000.
        let mut aggregate = base_aggregate();
        for offset in 0..1024u64 {
            aggregate.load_ops.insert(0x1000 + offset, 1);
        }

        let metrics =
            KernelMetrics::from_aggregate(&aggregate, &launch(Dim3::new(1, 1, 1)), &names())
                .unwrap();

        assert_eq!(metrics.total_reads, 1024);
        assert_eq!(metrics.distinct_load_addresses, 1024);
        assert_eq!(metrics.total_memory_footprint, 1024);
        assert!((metrics.rereads - 1.0).abs() < 1e-12);
        assert_eq!(metrics.memory_footprint_90pc, 922); // ceil(1024 · 0.9)
        assert!((metrics.global_memory_address_entropy - 10.0).abs() < 1e-9);
        // The whole stream fits one 1024-byte bucket.
        assert!(metrics.lmae[9].abs() < 1e-12);
    }

    #[test]
    fn test_memory_reduction_disjoint_groups() {
        // Two groups touch disjoint addresses {0,8,16} and {24,32,40}.
        let mut aggregate = base_aggregate();
        for address in [0u64, 8, 16, 24, 32, 40] {
            aggregate.load_ops.insert(address, 1);
        }
        let metrics =
            KernelMetrics::from_aggregate(&aggregate, &launch(Dim3::new(1, 1, 1)), &names())
                .unwrap();

        assert_eq!(metrics.memory_access_count, 6);
        assert_eq!(metrics.total_memory_footprint, 6);
        // address >> 3 gives six distinct buckets: entropy log2(6).
        assert!((metrics.lmae[2] - 6.0f64.log2()).abs() < 1e-9);
    }

    #[test]
    fn test_footprint_90pc_with_skewed_counts() {
        let mut aggregate = base_aggregate();
        // 90 accesses on one address, 10 spread over ten more.
        aggregate.load_ops.insert(0, 90);
        for i in 1..=10u64 {
            aggregate.load_ops.insert(i * 4096, 1);
        }
        let metrics =
            KernelMetrics::from_aggregate(&aggregate, &launch(Dim3::new(1, 1, 1)), &names())
                .unwrap();
        // significant = 90; the top address alone covers it.
        assert_eq!(metrics.memory_footprint_90pc, 1);
        assert!(metrics.memory_footprint_90pc <= metrics.total_memory_footprint);
    }

    #[test]
    fn test_branch_entropy_alternating_pattern() {
        let mut aggregate = base_aggregate();
        let site = BranchSite { handle: 1, line: None };
        aggregate.branch_counts.insert(site, 32);
        let mut histogram = HashMap::new();
        histogram.insert(0xAAAAu16, 9u32);
        histogram.insert(0x5555u16, 8u32);
        aggregate.branch_patterns.insert(site, histogram);

        let metrics =
            KernelMetrics::from_aggregate(&aggregate, &launch(Dim3::new(1, 1, 1)), &names())
                .unwrap();
        assert!((metrics.yokota_branch_entropy - 1.0).abs() < 1e-9);
        assert!((metrics.average_linear_branch_entropy - 1.0).abs() < 1e-9);
        // Occurrence-weighted total: 17 windows at q = 1/2.
        assert!((metrics.yokota_entropy - 8.5).abs() < 1e-9);
    }

    #[test]
    fn test_branch_entropy_all_taken_is_zero() {
        let mut aggregate = base_aggregate();
        let site = BranchSite { handle: 1, line: None };
        aggregate.branch_counts.insert(site, 32);
        aggregate
            .branch_patterns
            .insert(site, [(0xFFFFu16, 17u32)].into_iter().collect());

        let metrics =
            KernelMetrics::from_aggregate(&aggregate, &launch(Dim3::new(1, 1, 1)), &names())
                .unwrap();
        assert_eq!(metrics.yokota_branch_entropy, 0.0);
        assert_eq!(metrics.average_linear_branch_entropy, 0.0);
    }

    #[test]
    fn test_branch_counts_sorted_with_line_projection() {
        let mut aggregate = base_aggregate();
        aggregate
            .branch_counts
            .insert(BranchSite { handle: 0x9999, line: Some(12) }, 4);
        aggregate
            .branch_counts
            .insert(BranchSite { handle: 0x30, line: None }, 4);
        aggregate
            .branch_counts
            .insert(BranchSite { handle: 0x7777, line: Some(3) }, 9);

        let metrics =
            KernelMetrics::from_aggregate(&aggregate, &launch(Dim3::new(1, 1, 1)), &names())
                .unwrap();
        assert_eq!(metrics.branch_counts, vec![(3, 9), (12, 4), (0x30, 4)]);
    }

    #[test]
    fn test_normed_psl_divides_by_group_size_norm() {
        let mut aggregate = base_aggregate();
        aggregate.psl_per_group.clear();
        let mut a = [0.0; SKIP_LEVELS];
        a[0] = 3.0;
        let mut b = [0.0; SKIP_LEVELS];
        b[0] = 1.0;
        aggregate.psl_per_group.push(a);
        aggregate.psl_per_group.push(b);

        // 63 items per group: norm = log2(64) = 6; mean = 2.
        let metrics =
            KernelMetrics::from_aggregate(&aggregate, &launch(Dim3::new(63, 1, 1)), &names())
                .unwrap();
        assert!((metrics.normed_psl[0] - 2.0 / 6.0).abs() < 1e-12);
    }

    #[test]
    fn test_resource_pressure_and_freedom_to_reorder() {
        let mut aggregate = base_aggregate();
        aggregate.threads_invoked = 4;
        aggregate.load_labels.insert("a".to_string(), 6);
        aggregate.store_labels.insert("b".to_string(), 2);
        aggregate.instructions_between_load_or_store = vec![4, 2, 3];

        let metrics =
            KernelMetrics::from_aggregate(&aggregate, &launch(Dim3::new(1, 1, 1)), &names())
                .unwrap();
        assert!((metrics.resource_pressure - 2.0).abs() < 1e-12);
        assert!((metrics.freedom_to_reorder - 3.0).abs() < 1e-12);
    }
}
