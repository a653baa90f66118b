//! Thin OS layer for reading and pinning the CPU affinity of processes.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(not(target_os = "linux"))]
mod unsupported;

// Export the platform implementation under a common interface
#[cfg(target_os = "linux")]
pub use linux::OS;
#[cfg(not(target_os = "linux"))]
pub use unsupported::OS;
