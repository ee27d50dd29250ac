// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `/proc` readers backing the default [`RuntimeProbe`] on Linux.
//!
//! ```text
//! /proc/
//!   ├── self/status   # VmSize, VmRSS, VmData among others (kB)
//!   ├── self/fd/      # one entry per open descriptor
//!   └── loadavg       # 1m 5m 15m running/total last_pid
//! ```
//!
//! Unreadable files yield zeroed readings; the probe never fails.

use std::fs;
use std::path::PathBuf;
use tracing::debug;

use crate::metrics::apm::{MemoryUsage, RuntimeProbe};

const PROC_SELF_STATUS_PATH: &str = "/proc/self/status";
const PROC_SELF_FD_PATH: &str = "/proc/self/fd";
const PROC_LOADAVG_PATH: &str = "/proc/loadavg";
const KILOBYTE: u64 = 1024;

#[derive(Debug, Clone)]
pub struct ProcfsProbe {
    status_path: PathBuf,
    fd_path: PathBuf,
    loadavg_path: PathBuf,
}

impl Default for ProcfsProbe {
    fn default() -> Self {
        ProcfsProbe {
            status_path: PathBuf::from(PROC_SELF_STATUS_PATH),
            fd_path: PathBuf::from(PROC_SELF_FD_PATH),
            loadavg_path: PathBuf::from(PROC_LOADAVG_PATH),
        }
    }
}

impl ProcfsProbe {
    pub fn with_paths(
        status_path: impl Into<PathBuf>,
        fd_path: impl Into<PathBuf>,
        loadavg_path: impl Into<PathBuf>,
    ) -> Self {
        ProcfsProbe {
            status_path: status_path.into(),
            fd_path: fd_path.into(),
            loadavg_path: loadavg_path.into(),
        }
    }

    /// Number of open file descriptors.
    pub fn open_handles(&self) -> u64 {
        match fs::read_dir(&self.fd_path) {
            Ok(entries) => entries.filter_map(Result::ok).count() as u64,
            Err(e) => {
                debug!("Could not list {}: {e}", self.fd_path.display());
                0
            }
        }
    }
}

impl RuntimeProbe for ProcfsProbe {
    fn memory(&self) -> MemoryUsage {
        fs::read_to_string(&self.status_path)
            .ok()
            .and_then(|contents| parse_status(&contents))
            .unwrap_or_else(|| {
                debug!("Could not read memory usage from {}", self.status_path.display());
                MemoryUsage::default()
            })
    }

    fn load_average(&self) -> f64 {
        fs::read_to_string(&self.loadavg_path)
            .ok()
            .and_then(|contents| parse_loadavg(&contents))
            .unwrap_or_else(|| {
                debug!("Could not read load average from {}", self.loadavg_path.display());
                0.0
            })
    }
}

/// Virtual size, resident set and data segment. The kernel reports them in kB
/// whatever the page size.
fn parse_status(contents: &str) -> Option<MemoryUsage> {
    let field = |name: &str| {
        contents.lines().find_map(|line| {
            let value = line.strip_prefix(name)?.strip_prefix(':')?;
            let kb = value.trim().strip_suffix("kB")?.trim().parse::<u64>().ok()?;
            Some(kb * KILOBYTE)
        })
    };

    Some(MemoryUsage {
        total_bytes: field("VmSize")?,
        rss_bytes: field("VmRSS")?,
        used_bytes: field("VmData")?,
    })
}

fn parse_loadavg(contents: &str) -> Option<f64> {
    contents.split_whitespace().next()?.parse::<f64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const STATUS: &str = "Name:\tcheckout\n\
        VmPeak:\t  210000 kB\n\
        VmSize:\t  204800 kB\n\
        VmRSS:\t   51200 kB\n\
        VmData:\t   20480 kB\n\
        Threads:\t8\n";

    #[test]
    fn test_parse_status() {
        assert_eq!(
            parse_status(STATUS),
            Some(MemoryUsage {
                total_bytes: 200 * 1024 * 1024,
                rss_bytes: 50 * 1024 * 1024,
                used_bytes: 20 * 1024 * 1024,
            })
        );
    }

    #[test]
    fn test_parse_status_malformed() {
        assert_eq!(parse_status(""), None);
        assert_eq!(parse_status("VmSize:\t 100 kB\nVmRSS:\t 50 kB\n"), None);
        assert_eq!(
            parse_status("VmSize:\t many kB\nVmRSS:\t 50 kB\nVmData:\t 1 kB\n"),
            None
        );
    }

    #[test]
    fn test_parse_loadavg() {
        assert_eq!(parse_loadavg("1.87 0.97 0.45 2/812 12345\n"), Some(1.87));
        assert_eq!(parse_loadavg(""), None);
    }

    #[test]
    fn test_probe_reads_files() {
        let mut status = tempfile::NamedTempFile::new().unwrap();
        write!(status, "{STATUS}").unwrap();
        let mut loadavg = tempfile::NamedTempFile::new().unwrap();
        write!(loadavg, "3.50 2.00 1.00 1/100 42").unwrap();

        let fd_dir = tempfile::tempdir().unwrap();
        for name in ["0", "1", "2"] {
            std::fs::File::create(fd_dir.path().join(name)).unwrap();
        }

        let probe = ProcfsProbe::with_paths(status.path(), fd_dir.path(), loadavg.path());
        assert_eq!(probe.memory().rss_bytes, 50 * 1024 * 1024);
        assert_eq!(probe.open_handles(), 3);
        assert_eq!(probe.load_average(), 3.5);
    }

    #[test]
    fn test_probe_missing_files() {
        let probe = ProcfsProbe::with_paths(
            "/nonexistent/status",
            "/nonexistent/fd",
            "/nonexistent/loadavg",
        );
        assert_eq!(probe.memory(), MemoryUsage::default());
        assert_eq!(probe.open_handles(), 0);
        assert_eq!(probe.load_average(), 0.0);
    }
}
