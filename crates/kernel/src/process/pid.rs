/// PID allocation and the process table
///
/// PIDs are handed out monotonically; a slot becomes reusable only once
/// the parent has reaped the process, so a PID never refers to two
/// processes while anyone can still observe the first.

use super::process::Process;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::{Mutex, MutexGuard};

pub type Pid = u32;

/// PID of the init process; orphans are re-parented to it.
pub const INIT_PID: Pid = 1;

static NEXT_PID: AtomicU32 = AtomicU32::new(INIT_PID);

pub fn alloc_pid() -> Pid {
    NEXT_PID.fetch_add(1, Ordering::SeqCst)
}

pub struct ProcessTable {
    map: BTreeMap<Pid, Process>,
}

impl ProcessTable {
    pub const fn new() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, process: Process) {
        self.map.insert(process.pid, process);
    }

    pub fn get(&self, pid: Pid) -> Option<&Process> {
        self.map.get(&pid)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.map.get_mut(&pid)
    }

    pub fn remove(&mut self, pid: Pid) -> Option<Process> {
        self.map.remove(&pid)
    }

    pub fn pids(&self) -> Vec<Pid> {
        self.map.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Hand all children of a dying process to init.
    pub fn reparent_to_init(&mut self, dying: Pid) {
        let orphans: Vec<Pid> = self
            .map
            .values()
            .filter(|p| p.parent == Some(dying))
            .map(|p| p.pid)
            .collect();
        for pid in &orphans {
            if let Some(child) = self.map.get_mut(pid) {
                child.parent = Some(INIT_PID);
            }
        }
        if let Some(init) = self.map.get_mut(&INIT_PID) {
            init.children.extend_from_slice(&orphans);
        }
    }
}

static PROCESSES: Mutex<ProcessTable> = Mutex::new(ProcessTable::new());

pub fn processes() -> MutexGuard<'static, ProcessTable> {
    PROCESSES.lock()
}
