// linux_affinity_ops.rs

use std::fs;
use std::str::FromStr;

use libc::pid_t;
use nix::sched::{CpuSet, sched_getaffinity, sched_setaffinity};
use nix::unistd::Pid;

pub struct OS;

impl OS {
    fn cpuset_from_cpus(cpus: &[usize]) -> Result<CpuSet, String> {
        if cpus.is_empty() {
            return Err("affinity cpu list is empty".into());
        }
        let mut cpu_set = CpuSet::new();
        for &cpu in cpus {
            cpu_set
                .set(cpu)
                .map_err(|e| format!("cpu {} out of range for affinity set: {}", cpu, e))?;
        }
        Ok(cpu_set)
    }

    fn cpus_from_cpuset(set: &CpuSet) -> Vec<usize> {
        (0..CpuSet::count())
            .filter(|&i| set.is_set(i).unwrap_or(false))
            .collect()
    }

    /// Gets the CPUs a process is currently allowed to run on, ascending.
    pub fn get_process_affinity(pid: u32) -> Result<Vec<usize>, String> {
        let set = sched_getaffinity(Pid::from_raw(pid as pid_t))
            .map_err(|e| format!("sched_getaffinity({}) failed: {}", pid, e))?;
        Ok(Self::cpus_from_cpuset(&set))
    }

    /// Restricts a process to the given CPUs.
    pub fn set_process_affinity(pid: u32, cpus: &[usize]) -> Result<(), String> {
        let cpu_set = Self::cpuset_from_cpus(cpus)?;
        sched_setaffinity(Pid::from_raw(pid as pid_t), &cpu_set)
            .map_err(|e| format!("sched_setaffinity({}) failed: {}", pid, e))
    }

    /// Gets the parent process ID of a given process from `/proc/{pid}/stat`.
    pub fn get_parent_pid(pid: u32) -> Option<u32> {
        let stat = fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;

        // Format: pid (comm) state ppid ... where comm may contain spaces,
        // so fields are counted from the closing parenthesis.
        let after_paren = &stat[stat.rfind(')')? + 1..];
        after_paren
            .split_whitespace()
            .nth(1)
            .and_then(|ppid| u32::from_str(ppid).ok())
    }

    /// Gets all process IDs listed in `/proc`.
    pub fn get_all_pids() -> Vec<u32> {
        let Ok(entries) = fs::read_dir("/proc") else {
            return Vec::new();
        };

        entries
            .flatten()
            .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|entry| entry.file_name().to_string_lossy().parse::<u32>().ok())
            .collect()
    }

    /// Recursively collects every descendant of `parent_pid` into `descendants`.
    pub fn find_all_descendants(parent_pid: u32, descendants: &mut Vec<u32>) {
        let all = Self::get_all_pids();
        let mut frontier = vec![parent_pid];

        while let Some(parent) = frontier.pop() {
            for &pid in &all {
                if Self::get_parent_pid(pid) == Some(parent) && !descendants.contains(&pid) {
                    descendants.push(pid);
                    frontier.push(pid);
                }
            }
        }
    }

    /// Checks if a process with a given PID is still running.
    pub fn is_pid_live(pid: u32) -> bool {
        fs::metadata(format!("/proc/{}", pid))
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_affinity_roundtrip() {
        let pid = std::process::id();
        let cpus = OS::get_process_affinity(pid).unwrap();
        assert!(!cpus.is_empty());
        OS::set_process_affinity(pid, &cpus).unwrap();
        assert_eq!(OS::get_process_affinity(pid).unwrap(), cpus);
    }

    #[test]
    fn test_empty_affinity_rejected() {
        assert!(OS::set_process_affinity(std::process::id(), &[]).is_err());
    }

    #[test]
    fn test_self_is_live() {
        assert!(OS::is_pid_live(std::process::id()));
        assert!(OS::get_parent_pid(std::process::id()).is_some());
    }
}
