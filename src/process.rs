#![allow(unsafe_code)]

use crate::error::Result;
use std::io;
use std::process::{Child, Command, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

/// A supervised command, running in its own process group so that
/// terminating it also takes down whatever it spawned.
pub struct Process {
    child: Mutex<Child>,
    pid: u32,
    exited: AtomicBool,
}

pub fn spawn(cmd: &[String], no_shell: bool) -> Result<Process> {
    let mut command = assemble(cmd, no_shell)?;
    debug!("Assembled command {:?}", command);

    imp::isolate(&mut command);
    let child = command.spawn()?;
    Ok(Process {
        pid: child.id(),
        child: Mutex::new(child),
        exited: AtomicBool::new(false),
    })
}

// Either the first argument from cmd (if no_shell was given) or the shell.
// Going through the shell gives us pipes and redirects.
fn assemble(cmd: &[String], no_shell: bool) -> io::Result<Command> {
    if no_shell {
        let (head, tail) = cmd
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "command is empty"))?;
        let mut command = Command::new(head);
        command.args(tail);
        return Ok(command);
    }

    if cmd.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "command is empty",
        ));
    }

    let mut command = Command::new(imp::SHELL.0);
    command.arg(imp::SHELL.1).arg(cmd.join(" "));
    Ok(command)
}

impl Process {
    pub fn id(&self) -> u32 {
        self.pid
    }

    /// Ask the whole process group to stop. A process that was already
    /// waited on is left alone, its id may have been reused.
    pub fn terminate(&self) {
        if self.exited.load(Ordering::SeqCst) {
            return;
        }

        debug!("Terminating process group {}", self.pid);
        imp::terminate(self.pid);
    }

    pub fn wait(&self) -> Result<ExitStatus> {
        let status = self
            .child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .wait()?;
        self.exited.store(true, Ordering::SeqCst);
        Ok(status)
    }
}

/// Map an exit status onto a process exit code. Signal deaths become
/// `128 + signal` on unix, like a shell reports them.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }

    1
}

#[cfg(unix)]
mod imp {
    use nix::{self, Error};
    use std::io;
    use std::process::Command;

    pub const SHELL: (&str, &str) = ("sh", "-c");

    fn from_nix_error(err: nix::Error) -> io::Error {
        match err {
            Error::Sys(errno) => io::Error::from_raw_os_error(errno as i32),
            Error::InvalidPath => io::Error::new(io::ErrorKind::InvalidInput, err),
            _ => io::Error::new(io::ErrorKind::Other, err),
        }
    }

    pub fn isolate(command: &mut Command) {
        use nix::unistd::setsid;
        use std::os::unix::process::CommandExt;

        unsafe {
            command.pre_exec(|| setsid().map_err(from_nix_error).map(|_| ()));
        }
    }

    pub fn terminate(pid: u32) {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Err(err) = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!("Unable to signal process group {}: {}", pid, err);
        }
    }
}

#[cfg(windows)]
mod imp {
    use std::process::{Command, Stdio};

    pub const SHELL: (&str, &str) = ("cmd.exe", "/C");

    pub fn isolate(_: &mut Command) {}

    pub fn terminate(pid: u32) {
        let killed = Command::new("taskkill")
            .args(&["/F", "/T", "/PID", &pid.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if let Err(err) = killed {
            debug!("Unable to kill process tree {}: {}", pid, err);
        }
    }
}
