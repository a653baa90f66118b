pub struct OS;

const UNSUPPORTED: &str = "process affinity is only supported on Linux";

impl OS {
    pub fn get_process_affinity(_pid: u32) -> Result<Vec<usize>, String> {
        Err(UNSUPPORTED.into())
    }

    pub fn set_process_affinity(_pid: u32, _cpus: &[usize]) -> Result<(), String> {
        Err(UNSUPPORTED.into())
    }

    pub fn get_parent_pid(_pid: u32) -> Option<u32> {
        None
    }

    pub fn get_all_pids() -> Vec<u32> {
        Vec::new()
    }

    pub fn find_all_descendants(_parent_pid: u32, _descendants: &mut Vec<u32>) {}

    pub fn is_pid_live(_pid: u32) -> bool {
        false
    }
}
