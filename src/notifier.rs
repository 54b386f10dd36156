//! Broadcasting of reloader events to observers.
//!
//! Observers of [`FileChanged`] decide whether a change is theirs to handle;
//! when none of them claims it, the reload action runs. The default action
//! terminates the process with [`RELOAD_EXIT_CODE`] so the supervising parent
//! relaunches it.

use crate::pathop::ChangeKind;
use crate::reloader::WatchSet;
use crate::run::RELOAD_EXIT_CODE;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

/// Broadcast payload for a file change.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FileChanged {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

/// What became of a notification.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Notification {
    /// An observer took care of it.
    Handled,
    /// Nobody did, the reload action ran (and returned).
    Reloaded,
}

type Observer = Arc<dyn Fn(&FileChanged) -> bool + Send + Sync>;
type StartedObserver = Arc<dyn Fn(&WatchSet) + Send + Sync>;
type ReloadAction = Box<dyn Fn(&Path) + Send + Sync>;

pub struct Notifier {
    observers: RwLock<Vec<Observer>>,
    started: RwLock<Vec<StartedObserver>>,
    reload: ReloadAction,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::with_reload_action(trigger_reload)
    }
}

impl Notifier {
    /// A notifier whose unhandled changes run `action` instead of exiting.
    pub fn with_reload_action<F>(action: F) -> Self
    where
        F: Fn(&Path) + Send + Sync + 'static,
    {
        Self {
            observers: RwLock::new(Vec::new()),
            started: RwLock::new(Vec::new()),
            reload: Box::new(action),
        }
    }

    /// Observe file changes. Return `true` to claim the change.
    pub fn connect<F>(&self, observer: F)
    where
        F: Fn(&FileChanged) -> bool + Send + Sync + 'static,
    {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(observer));
    }

    /// Observe the start of watching, typically to register more files.
    pub fn on_started<F>(&self, observer: F)
    where
        F: Fn(&WatchSet) + Send + Sync + 'static,
    {
        self.started
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(observer));
    }

    // Observers run on a snapshot, without the lock held, so they may
    // connect further observers.
    pub(crate) fn started(&self, watches: &WatchSet) {
        debug!("Sending autoreload started signal");
        let observers = self
            .started
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in observers {
            observer(watches);
        }
    }

    pub fn notify_file_changed(&self, path: &Path, kind: ChangeKind) -> Notification {
        let event = FileChanged {
            path: path.to_path_buf(),
            kind,
        };

        let observers = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let results: Vec<bool> = observers.iter().map(|observer| observer(&event)).collect();
        debug!("{:?} notified as {}. Observer results: {:?}", path, kind, results);

        if results.into_iter().any(|handled| handled) {
            Notification::Handled
        } else {
            (self.reload)(path);
            Notification::Reloaded
        }
    }
}

/// Exit with the reload code, for the supervisor to pick up.
pub fn trigger_reload(path: &Path) {
    info!("{} changed, reloading.", path.display());
    std::process::exit(RELOAD_EXIT_CODE);
}
