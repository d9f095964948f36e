//! Host↔device transfer bookkeeping.
//!
//! Transfers happen outside kernel execution, so this sidecar never touches
//! the hot path: each host store or load appends the name of the most
//! recently enqueued kernel to a direction list. Stores that arrive before
//! any kernel is named are attributed retroactively when the next kernel is
//! enqueued — the only reason to write to the device is to feed an upcoming
//! launch.
//!
//! At teardown the lists become one CSV row per surviving name after
//! adjacent-run deduplication, each row carrying that kernel's total count
//! over the whole list. A kernel launched in non-contiguous runs therefore
//! produces one row per run, all with the same total. The ordering
//! sensitivity is intentional and relied on downstream.

use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};

use crate::report::next_free_path;

#[derive(Debug, Default)]
pub struct TransferLog {
    host_to_device: Vec<String>,
    device_to_host: Vec<String>,
    last_kernel_name: String,
    /// Suffix of `host_to_device` not yet attributed to a named kernel.
    unnamed_host_to_device: usize,
}

impl TransferLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A host→device copy; attributed to the next kernel enqueued.
    pub fn record_host_store(&mut self) {
        self.host_to_device.push(self.last_kernel_name.clone());
        self.unnamed_host_to_device += 1;
    }

    /// A device→host copy; attributed to the last kernel enqueued.
    pub fn record_host_load(&mut self) {
        self.device_to_host.push(self.last_kernel_name.clone());
    }

    /// A kernel was enqueued: rewrite the unattributed host→device suffix
    /// to its name and make it the attribution target from here on.
    pub fn kernel_named(&mut self, name: &str) {
        self.last_kernel_name = name.to_string();
        let len = self.host_to_device.len();
        for entry in &mut self.host_to_device[len - self.unnamed_host_to_device..] {
            *entry = self.last_kernel_name.clone();
        }
        self.unnamed_host_to_device = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.host_to_device.is_empty() && self.device_to_host.is_empty()
    }

    /// Render the sidecar CSV.
    pub fn render_csv(&self) -> String {
        let mut out = String::from("metric,kernel,count\n");
        direction_rows(&mut out, "transfer: host to device", &self.host_to_device);
        direction_rows(&mut out, "transfer: device to host", &self.device_to_host);
        out
    }

    /// Write the sidecar as `aiwc_memory_transfers_<n>.csv` under `dir`,
    /// with `n` the smallest index not yet on disk.
    pub fn write_to(&self, dir: &Path) -> io::Result<PathBuf> {
        let path = next_free_path(dir, |n| format!("aiwc_memory_transfers_{n}.csv"));
        std::fs::write(&path, self.render_csv())?;
        Ok(path)
    }
}

/// One row per run head of `list` (adjacent duplicates collapsed), each
/// carrying the name's total occurrence count over the whole list.
fn direction_rows(out: &mut String, metric: &str, list: &[String]) {
    for (i, name) in list.iter().enumerate() {
        if i > 0 && list[i - 1] == *name {
            continue;
        }
        let count = list.iter().filter(|entry| *entry == name).count();
        let _ = writeln!(out, "{metric},{name},{count}");
    }
}
