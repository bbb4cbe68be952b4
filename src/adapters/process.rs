//! Resident memory of the current process, via sysinfo.

use crate::ports::queue::MemorySampler;
use parking_lot::Mutex;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::warn;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

pub struct ProcessMemorySampler {
    pid: Option<Pid>,
    system: Mutex<System>,
}

impl ProcessMemorySampler {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!(error = %e, "cannot determine own pid, memory sampling disabled");
                None
            }
        };
        Self {
            pid,
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for ProcessMemorySampler {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySampler for ProcessMemorySampler {
    fn used_mb(&self) -> Option<f64> {
        let pid = self.pid?;
        let mut system = self.system.lock();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system
            .process(pid)
            .map(|process| process.memory() as f64 / BYTES_PER_MB)
    }
}
