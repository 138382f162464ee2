use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::time::Duration;

pub struct ProcessUtils;

impl ProcessUtils {
    pub fn i32_to_pid(pid: i32) -> Pid {
        Pid::from_raw(pid)
    }

    /// Signal 0 check; false when the process is gone or not ours to signal
    pub fn is_process_running(pid: Pid) -> bool {
        signal::kill(pid, None).is_ok()
    }

    pub fn send_signal(pid: Pid, sig: Signal) -> Result<(), String> {
        signal::kill(pid, sig)
            .map_err(|e| format!("Failed to send {:?} to process {}: {}", sig, pid.as_raw(), e))
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL.
    ///
    /// `exited` reports whether the caller has already reaped the process;
    /// a reaped PID must never be signalled again since it may have been reused.
    pub async fn terminate_process<F>(pid: Pid, grace: Duration, mut exited: F) -> Result<(), String>
    where
        F: FnMut() -> bool,
    {
        if exited() || !Self::is_process_running(pid) {
            return Ok(());
        }

        Self::send_signal(pid, Signal::SIGTERM)?;

        let step = Duration::from_millis(100);
        let mut waited = Duration::ZERO;
        while waited < grace {
            tokio::time::sleep(step).await;
            waited += step;
            if exited() || !Self::is_process_running(pid) {
                return Ok(());
            }
        }

        tracing::warn!("Process {} ignored SIGTERM for {:?}, sending SIGKILL", pid.as_raw(), grace);
        Self::send_signal(pid, Signal::SIGKILL)?;
        Ok(())
    }
}
