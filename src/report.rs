//! Invocation report rendering and placement.
//!
//! The report is a flat UTF-8 CSV, `metric,category,count`, one metric per
//! row. List-valued metrics pack their entries with `;` between entries and
//! `=` between key and value, with a trailing `;` after the last entry —
//! downstream parsers depend on that exact dialect, so the renderer keeps
//! the historical row order and categories byte-for-byte.
//!
//! Placement honours two environment variables: an exact output path
//! (append mode, all invocations in one file) or an output directory with
//! `aiwc_<kernel>_<n>.csv` naming, `n` being the smallest index not yet on
//! disk. Path wins over directory, with a warning.

use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};

use crate::metrics::KernelMetrics;

/// Exact report destination, append mode. Takes precedence over the
/// directory variable.
pub const OUTPUT_PATH_ENV: &str = "OCLGRIND_WORKLOAD_CHARACTERISATION_OUTPUT_PATH";
/// Directory for per-invocation `aiwc_<kernel>_<n>.csv` files.
pub const OUTPUT_DIR_ENV: &str = "OCLGRIND_WORKLOAD_CHARACTERISATION_OUTPUT_DIR";

const LIST_DELIM: char = ';';
const KEYVAL_SEP: char = '=';

/// Render the full invocation report.
///
/// Two rows intentionally swap their labels relative to what they hold:
/// `unique_reads` carries the distinct *store* address count and
/// `unique_writes` the distinct *load* count. The swap is historical;
/// downstream classifiers were trained on it, so it must not be corrected
/// here. `unique_read_write_ratio` is distinct loads over distinct stores.
pub fn render_report(m: &KernelMetrics) -> String {
    let mut out = String::with_capacity(2048);

    out.push_str("metric,category,count\n");
    let _ = writeln!(out, "kernel_name,Meta,{}", m.kernel_name);
    let _ = writeln!(
        out,
        "work_group_size_specified,Meta,{}",
        u8::from(m.work_group_size_specified)
    );

    out.push_str("opcode_counts,Compute,");
    for (name, count) in &m.opcode_counts {
        let _ = write!(out, "{name}{KEYVAL_SEP}{count}{LIST_DELIM}");
    }
    out.push('\n');

    let _ = writeln!(out, "freedom_to_reorder,Compute,{}", m.freedom_to_reorder);
    let _ = writeln!(out, "resource_pressure,Compute,{}", m.resource_pressure);
    let _ = writeln!(out, "work_items,Parallelism,{}", m.work_items);
    let _ = writeln!(out, "work_groups,Parallelism,{}{LIST_DELIM}", m.work_groups);
    let _ = writeln!(
        out,
        "work_items_per_work_group,Parallelism,{}{LIST_DELIM}",
        m.work_items_per_group
    );
    let _ = writeln!(out, "SIMD_operand_sum,Parallelism,{}", m.simd.operand_sum);
    let _ = writeln!(out, "total_barriers_hit,Parallelism,{}", m.total_barriers_hit);
    let _ = writeln!(out, "min_ITB,Parallelism,{}", m.itb.min);
    let _ = writeln!(out, "max_ITB,Parallelism,{}", m.itb.max);
    let _ = writeln!(out, "median_ITB,Parallelism,{}", m.itb.median);
    let _ = writeln!(out, "min_IPT,Parallelism,{}", m.ipt.min);
    let _ = writeln!(out, "max_IPT,Parallelism,{}", m.ipt.max);
    let _ = writeln!(out, "median_IPT,Parallelism,{}", m.ipt.median);
    let _ = writeln!(out, "min_SIMD_width,Parallelism,{}", m.simd.min);
    let _ = writeln!(out, "max_SIMD_width,Parallelism,{}", m.simd.max);
    let _ = writeln!(out, "mean_SIMD_width,Parallelism,{}", m.simd.mean);
    let _ = writeln!(out, "sd_SIMD_width,Parallelism,{}", m.simd.stdev);
    let _ = writeln!(out, "num_memory_accesses,Memory,{}", m.memory_access_count);
    let _ = writeln!(out, "total_memory_footprint,Memory,{}", m.total_memory_footprint);
    let _ = writeln!(out, "unique_reads,Memory,{}", m.distinct_store_addresses);
    let _ = writeln!(out, "unique_writes,Memory,{}", m.distinct_load_addresses);
    let _ = writeln!(
        out,
        "unique_read_write_ratio,Memory,{}",
        m.unique_read_write_ratio
    );
    let _ = writeln!(out, "total_reads,Memory,{}", m.total_reads);
    let _ = writeln!(out, "total_writes,Memory,{}", m.total_writes);
    let _ = writeln!(out, "rereads,Memory,{}", m.rereads);
    let _ = writeln!(out, "rewrites,Memory,{}", m.rewrites);
    let _ = writeln!(out, "memory_footprint_90pc,Memory,{}", m.memory_footprint_90pc);
    let _ = writeln!(
        out,
        "global_memory_address_entropy,Memory,{}",
        m.global_memory_address_entropy
    );

    out.push_str("LMAE,Memory,");
    for (i, value) in m.lmae.iter().enumerate() {
        let _ = write!(out, "{}{KEYVAL_SEP}{value}{LIST_DELIM}", i + 1);
    }
    out.push('\n');

    out.push_str("normed_PSL,Memory,");
    for (skip, value) in m.normed_psl.iter().enumerate() {
        let _ = write!(out, "{skip}{KEYVAL_SEP}{value}{LIST_DELIM}");
    }
    out.push('\n');

    let _ = writeln!(out, "total_global_memory_accessed,Memory,{}", m.global_memory_access);
    let _ = writeln!(out, "total_local_memory_accessed,Memory,{}", m.local_memory_access);
    let _ = writeln!(
        out,
        "total_constant_memory_accessed,Memory,{}",
        m.constant_memory_access
    );

    out.push_str("branch_counts,Control,");
    for (id, count) in &m.branch_counts {
        let _ = write!(out, "{id}{KEYVAL_SEP}{count}{LIST_DELIM}");
    }
    out.push('\n');

    let _ = writeln!(out, "branch_history_size,Memory,{}", m.branch_history_len);
    let _ = writeln!(out, "yokota_branch_entropy,Memory,{}", m.yokota_branch_entropy);
    let _ = writeln!(
        out,
        "average_linear_branch_entropy,Memory,{}",
        m.average_linear_branch_entropy
    );

    out
}

/// Smallest-index free path `dir/<name(n)>` for `n = 0, 1, …`.
pub(crate) fn next_free_path(dir: &Path, name: impl Fn(usize) -> String) -> PathBuf {
    let mut n = 0usize;
    loop {
        let candidate = dir.join(name(n));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

/// Resolve the report destination from the two environment overrides.
/// An explicit path wins; setting both draws a warning.
pub fn resolve_report_path(
    path_var: Option<&str>,
    dir_var: Option<&str>,
    kernel: &str,
) -> PathBuf {
    if let Some(path) = path_var {
        if dir_var.is_some() {
            log::warn!("both output path and directory set, using path");
        }
        return PathBuf::from(path);
    }
    let dir = dir_var.map(Path::new).unwrap_or_else(|| Path::new(""));
    next_free_path(dir, |n| format!("aiwc_{kernel}_{n}.csv"))
}

/// Write one invocation's report, destination per the environment.
/// Append mode, so a fixed output path accumulates all invocations.
pub fn write_report(metrics: &KernelMetrics) -> io::Result<PathBuf> {
    let path_var = std::env::var(OUTPUT_PATH_ENV).ok();
    let dir_var = std::env::var(OUTPUT_DIR_ENV).ok();
    let path = resolve_report_path(path_var.as_deref(), dir_var.as_deref(), &metrics.kernel_name);

    let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
    file.write_all(render_report(metrics).as_bytes())?;

    log::info!(
        "workload characterisation for kernel '{}' written to {}",
        metrics.kernel_name,
        path.display()
    );
    Ok(path)
}
