//! Change detection from OS filesystem events.
//!
//! Subscribes through `notify`'s raw watcher (inotify, FSEvents, kqueue,
//! ReadDirectoryChangesW) to the directories holding watched files and to
//! the roots of the directory globs, then translates raw events back into
//! watched paths.

use crate::config::Config;
use crate::error::Result;
use crate::pathop::PathOp;
use crate::paths::common_roots;
use crate::reloader::{compile_globs, is_recursive, Reloader, WatchSet};
use globset::GlobSet;
use notify::{raw_watcher, RawEvent, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Something whose completed work can change what needs watching, like a
/// request handler that may have loaded modules on the fly.
pub trait RequestSender {
    /// Static file handlers load no code; their requests are skipped.
    fn serves_static_files(&self) -> bool {
        false
    }
}

/// Handle for marking a [`NotifyReloader`]'s subscriptions stale.
#[derive(Clone)]
pub struct Resubscriber {
    stale: Arc<AtomicBool>,
}

impl Resubscriber {
    pub fn request_finished(&self, sender: &dyn RequestSender) {
        if sender.serves_static_files() {
            trace!("Request served static files, keeping subscriptions");
            return;
        }

        self.stale.store(true, Ordering::SeqCst);
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::SeqCst)
    }
}

/// Paths and patterns raw events are matched against.
#[derive(Default)]
pub struct Targets {
    files: HashSet<PathBuf>,
    globs: HashMap<PathBuf, GlobSet>,
}

impl Targets {
    /// The watched path an event on `path` stands for, if any.
    ///
    /// Watched files match exactly; otherwise the patterns registered on
    /// each ancestor directory are tried, nearest first.
    pub fn match_path(&self, path: &Path) -> Option<PathBuf> {
        if self.files.contains(path) {
            return Some(path.to_path_buf());
        }

        path.ancestors().skip(1).find_map(|directory| {
            let set = self.globs.get(directory)?;
            let relative = path.strip_prefix(directory).ok()?;
            if set.is_match(relative) {
                Some(path.to_path_buf())
            } else {
                None
            }
        })
    }
}

/// Directories to subscribe to, `true` for recursive subscriptions.
pub type Subscriptions = BTreeMap<PathBuf, bool>;

pub struct NotifyReloader {
    watches: Arc<WatchSet>,
    timeout: Duration,
    debounce: Duration,
    stale: Arc<AtomicBool>,
    subscribed: AtomicBool,
    active: Mutex<Subscriptions>,
}

impl NotifyReloader {
    pub fn new(watches: impl Into<Arc<WatchSet>>, config: &Config) -> Self {
        Self {
            watches: watches.into(),
            timeout: config.event_timeout,
            debounce: config.debounce,
            stale: Arc::new(AtomicBool::new(false)),
            subscribed: AtomicBool::new(false),
            active: Mutex::new(Subscriptions::new()),
        }
    }

    /// Whether the platform can deliver native events right now.
    pub fn check_availability() -> bool {
        let (tx, _rx) = channel();
        match raw_watcher(tx) {
            Ok(_) => true,
            Err(err) => {
                debug!("Native watcher unavailable: {}", err);
                false
            }
        }
    }

    pub fn resubscriber(&self) -> Resubscriber {
        Resubscriber {
            stale: Arc::clone(&self.stale),
        }
    }

    /// Whether the first subscription is in place.
    pub fn is_watching(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst)
    }

    /// Directories the running loop is subscribed to.
    pub fn watched_directories(&self) -> Vec<PathBuf> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    fn set_active(&self, subscriptions: Subscriptions) {
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = subscriptions;
    }

    /// What to subscribe to and what to match events against, from the
    /// current watch set.
    pub fn subscriptions(&self) -> (Subscriptions, Targets) {
        let mut targets = Targets::default();
        let mut shallow = Vec::new();
        let mut deep = Vec::new();

        for file in self.watches.watched_files(false) {
            if let Some(parent) = file.parent() {
                shallow.push(parent.to_path_buf());
            }
            targets.files.insert(file);
        }

        for (directory, patterns) in self.watches.directory_globs() {
            let directory = directory.canonicalize().unwrap_or(directory);
            let set = match compile_globs(&patterns) {
                Ok(set) => set,
                Err(err) => {
                    warn!("Skipping globs in {:?}: {}", directory, err);
                    continue;
                }
            };

            let recursive = patterns
                .iter()
                .any(|p| is_recursive(p) || Path::new(p).components().count() > 1);
            if recursive {
                deep.push(directory.clone());
            } else {
                shallow.push(directory.clone());
            }
            targets.globs.insert(directory, set);
        }

        let deep: Vec<PathBuf> = deep.into_iter().filter(|dir| dir.is_dir()).collect();
        let deep = common_roots(&deep);

        let mut subscriptions = Subscriptions::new();
        for directory in shallow {
            if !directory.is_dir() {
                debug!("Not subscribing to missing directory {:?}", directory);
                continue;
            }
            if deep.iter().any(|root| directory.starts_with(root)) {
                continue;
            }
            subscriptions.insert(directory, false);
        }
        for root in deep {
            subscriptions.insert(root, true);
        }

        (subscriptions, targets)
    }

    fn update_watches(
        &self,
        watcher: &mut RecommendedWatcher,
        current: &mut Subscriptions,
    ) -> Targets {
        let (wanted, targets) = self.subscriptions();

        for (directory, recursive) in current.iter() {
            if wanted.get(directory) != Some(recursive) {
                if let Err(err) = watcher.unwatch(directory) {
                    debug!("Unable to unwatch {:?}: {}", directory, err);
                }
            }
        }

        let mut subscribed = Subscriptions::new();
        for (directory, recursive) in wanted {
            if current.get(&directory) == Some(&recursive) {
                subscribed.insert(directory, recursive);
                continue;
            }

            let mode = if recursive {
                RecursiveMode::Recursive
            } else {
                RecursiveMode::NonRecursive
            };
            match watcher.watch(&directory, mode) {
                Ok(()) => {
                    debug!("Watching {:?} (recursive: {})", directory, recursive);
                    subscribed.insert(directory, recursive);
                }
                Err(err) => warn!("Unable to watch {:?}: {}", directory, err),
            }
        }

        self.set_active(subscribed.clone());
        *current = subscribed;
        targets
    }
}

/// Wait up to `timeout` for an event, then collect whatever else arrives
/// until the events are `debounce` apart. Each path appears once.
fn wait_events(
    rx: &Receiver<RawEvent>,
    timeout: Duration,
    debounce: Duration,
) -> std::result::Result<Vec<PathOp>, RecvTimeoutError> {
    let mut pathops: Vec<PathOp> = Vec::new();
    let mut index: HashMap<PathBuf, usize> = HashMap::new();

    let mut collect = |event: RawEvent| {
        let path = match event.path {
            Some(path) => path,
            None => return,
        };
        let op = event.op.ok();
        match index.get(&path) {
            Some(&i) => {
                let existing = &mut pathops[i];
                existing.op = match (existing.op, op) {
                    (Some(a), Some(b)) => Some(a | b),
                    _ => None,
                };
            }
            None => {
                index.insert(path.clone(), pathops.len());
                pathops.push(PathOp::new(&path, op));
            }
        }
    };

    match rx.recv_timeout(timeout) {
        Ok(event) => collect(event),
        Err(RecvTimeoutError::Timeout) => return Ok(Vec::new()),
        Err(err) => return Err(err),
    }

    // Wait for filesystem activity to cool off, but no longer than `timeout`
    // so a file that never stops changing can't keep us from stopping.
    let deadline = Instant::now() + timeout;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        if left == Duration::from_secs(0) {
            break;
        }
        match rx.recv_timeout(debounce.min(left)) {
            Ok(event) => collect(event),
            Err(_) => break,
        }
    }

    Ok(pathops)
}

impl Reloader for NotifyReloader {
    fn name(&self) -> &'static str {
        "NotifyReloader"
    }

    fn watches(&self) -> &WatchSet {
        &self.watches
    }

    fn watch_set(&self) -> Arc<WatchSet> {
        Arc::clone(&self.watches)
    }

    fn run_loop(&self) -> Result<()> {
        let (tx, rx) = channel();
        let mut watcher = raw_watcher(tx)?;
        let mut subscriptions = Subscriptions::new();
        let mut targets = self.update_watches(&mut watcher, &mut subscriptions);
        self.subscribed.store(true, Ordering::SeqCst);

        while !self.should_stop() {
            if self.stale.swap(false, Ordering::SeqCst) {
                debug!("Refreshing subscriptions");
                targets = self.update_watches(&mut watcher, &mut subscriptions);
            }

            let pathops = match wait_events(&rx, self.timeout, self.debounce) {
                Ok(pathops) => pathops,
                Err(err) => {
                    self.subscribed.store(false, Ordering::SeqCst);
                    self.set_active(Subscriptions::new());
                    return Err(notify::Error::Generic(format!(
                        "native event source closed: {}",
                        err
                    ))
                    .into());
                }
            };

            for pathop in pathops.iter().filter(|p| p.is_relevant()) {
                if let Some(path) = targets.match_path(&pathop.path) {
                    self.watches.notify_file_changed(&path, pathop.kind());
                }
            }
        }

        drop(watcher);
        self.subscribed.store(false, Ordering::SeqCst);
        self.set_active(Subscriptions::new());
        self.stop();
        Ok(())
    }
}
