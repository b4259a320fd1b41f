//! Small process-related helpers shared across the workspace.
//!
//! Every media subprocess in the workspace is created through [`tokio_command`]
//! and torn down through [`request_terminate`], so platform differences live in
//! one place.

use std::ffi::OsStr;
use std::process::ExitStatus;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `tokio::process::Command` for a media subprocess.
///
/// The child is killed when its handle is dropped, so a supervisor that loses
/// track of a process never leaks it.
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd.kill_on_drop(true);
    cmd
}

/// Ask a running child to exit.
///
/// On Unix this sends `SIGTERM`, giving ffmpeg the chance to flush and close
/// its outputs. Other platforms have no graceful equivalent, so the child is
/// killed outright. Returns `Ok(false)` if the child had already exited.
pub fn request_terminate(child: &mut tokio::process::Child) -> std::io::Result<bool> {
    let Some(pid) = child.id() else {
        return Ok(false);
    };

    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let pid = i32::try_from(pid)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid overflow"))?;
        match kill(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) => Ok(true),
            Err(nix::errno::Errno::ESRCH) => Ok(false),
            Err(errno) => Err(std::io::Error::from(errno)),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        child.start_kill()?;
        Ok(true)
    }
}

/// Render an exit status for logs and error messages.
///
/// Signal terminations are reported by name on Unix (`signal SIGKILL`).
pub fn describe_exit(status: &ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exit code {code}");
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return match nix::sys::signal::Signal::try_from(signal) {
                Ok(sig) => format!("signal {}", sig.as_str()),
                Err(_) => format!("signal {signal}"),
            };
        }
    }

    "unknown exit status".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_describe_exit_code() {
        use std::os::unix::process::ExitStatusExt;

        let status = ExitStatus::from_raw(3 << 8);
        assert_eq!(describe_exit(&status), "exit code 3");
    }

    #[cfg(unix)]
    #[test]
    fn test_describe_exit_signal() {
        use std::os::unix::process::ExitStatusExt;

        let status = ExitStatus::from_raw(9);
        assert_eq!(describe_exit(&status), "signal SIGKILL");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_request_terminate_stops_child() {
        let mut child = tokio_command("sleep").arg("30").spawn().unwrap();

        assert!(request_terminate(&mut child).unwrap());
        let status = child.wait().await.unwrap();
        assert!(!status.success());
        assert_eq!(describe_exit(&status), "signal SIGTERM");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_request_terminate_after_exit() {
        let mut child = tokio_command("true").spawn().unwrap();
        child.wait().await.unwrap();

        // tokio clears the pid once the child has been reaped.
        assert!(!request_terminate(&mut child).unwrap());
    }
}
