//! Termination signals end the process cleanly, with exit code 0.
//!
//! Cleanups registered with [`add_cleanup`] run first, e.g. to take a
//! supervised command down with us.

use std::sync::{Mutex, Once, PoisonError};

lazy_static! {
    static ref CLEANUP: Mutex<Vec<Box<dyn Fn() + Send>>> = Mutex::new(Vec::new());
}

static INSTALL: Once = Once::new();

/// Install the termination handler. Only the first call does anything.
pub fn install_handler() {
    INSTALL.call_once(imp::install);
}

pub fn add_cleanup<F>(cleanup: F)
where
    F: Fn() + 'static + Send,
{
    CLEANUP
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(Box::new(cleanup));
}

fn terminate() -> ! {
    for cleanup in CLEANUP
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
    {
        cleanup();
    }

    std::process::exit(0)
}

#[cfg(unix)]
mod imp {
    use nix::sys::signal::{SigSet, SIGINT, SIGTERM};
    use std::thread;

    pub fn install() {
        // Mask the termination signals. The mask propagates to all threads
        // started after this point; spawned commands get a clean mask back.
        let mut mask = SigSet::empty();
        mask.add(SIGTERM);
        mask.add(SIGINT);
        if let Err(err) = mask.thread_block() {
            warn!("Unable to mask termination signals: {}", err);
            return;
        }

        let spawned = thread::Builder::new()
            .name("signals".into())
            .spawn(move || match mask.wait() {
                Ok(sig) => {
                    debug!("Received {:?}", sig);
                    super::terminate()
                }
                Err(err) => warn!("Unable to wait for signals: {}", err),
            });

        if let Err(err) = spawned {
            warn!("Unable to start the signal thread: {}", err);
        }
    }
}

#[cfg(windows)]
#[allow(unsafe_code)]
mod imp {
    use winapi::shared::minwindef::{BOOL, DWORD, TRUE};
    use winapi::um::consoleapi::SetConsoleCtrlHandler;

    unsafe extern "system" fn ctrl_handler(_: DWORD) -> BOOL {
        debug!("Received console control event");
        super::terminate()
    }

    pub fn install() {
        unsafe {
            SetConsoleCtrlHandler(Some(ctrl_handler), TRUE);
        }
    }
}
