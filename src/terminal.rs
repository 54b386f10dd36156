/// Turn terminal echo back on if a previous run died with it off.
///
/// An interactive prompt killed by a reload leaves the terminal with echo
/// disabled, and the relaunched process inherits that.
#[cfg(unix)]
#[allow(unsafe_code)]
pub fn ensure_echo_on() {
    use nix::sys::signal::{signal, SigHandler, Signal};
    use nix::sys::termios::{tcgetattr, tcsetattr, LocalFlags, SetArg};
    use nix::unistd::isatty;
    use std::os::unix::io::AsRawFd;

    let fd = std::io::stdin().as_raw_fd();
    if !isatty(fd).unwrap_or(false) {
        return;
    }

    let mut attrs = match tcgetattr(fd) {
        Ok(attrs) => attrs,
        Err(err) => {
            debug!("Unable to read terminal attributes: {}", err);
            return;
        }
    };
    if attrs.local_flags.contains(LocalFlags::ECHO) {
        return;
    }
    attrs.local_flags.insert(LocalFlags::ECHO);

    // Background process groups get SIGTTOU for touching the terminal
    let old_handler = unsafe { signal(Signal::SIGTTOU, SigHandler::SigIgn) }.ok();
    if let Err(err) = tcsetattr(fd, SetArg::TCSANOW, &attrs) {
        warn!("Unable to turn terminal echo back on: {}", err);
    }
    if let Some(handler) = old_handler {
        if let Err(err) = unsafe { signal(Signal::SIGTTOU, handler) } {
            debug!("Unable to restore the SIGTTOU handler: {}", err);
        }
    }
}

#[cfg(not(unix))]
pub fn ensure_echo_on() {}
