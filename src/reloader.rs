//! What to watch, and the contract shared by both reloaders.

use crate::config::{Config, ReloaderKind};
use crate::error::{Error, Result};
use crate::native::NotifyReloader;
use crate::notifier::{Notification, Notifier};
use crate::pathop::ChangeKind;
use crate::registry::Registry;
use crate::stat::StatReloader;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use walkdir::WalkDir;

/// Registered files and directory globs, plus what a reloader needs to act
/// on them: the module registry, the notifier and the stop flag.
pub struct WatchSet {
    registry: Arc<Registry>,
    notifier: Arc<Notifier>,
    extra_files: RwLock<BTreeSet<PathBuf>>,
    directory_globs: RwLock<BTreeMap<PathBuf, BTreeSet<String>>>,
    stop: AtomicBool,
}

impl WatchSet {
    pub fn new(registry: Arc<Registry>, notifier: Arc<Notifier>) -> Self {
        Self {
            registry,
            notifier,
            extra_files: RwLock::new(BTreeSet::new()),
            directory_globs: RwLock::new(BTreeMap::new()),
            stop: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    /// Watch files under `path` that match `pattern`.
    ///
    /// The pattern is relative to the directory. `*` stays within one path
    /// component, `**` makes the pattern recursive.
    pub fn watch_dir(&self, path: impl AsRef<Path>, pattern: &str) -> Result<()> {
        let path = path.as_ref();
        if !path.is_absolute() {
            return Err(Error::NotAbsolute(path.to_path_buf()));
        }

        compile_glob(pattern)?;
        debug!("Watching dir {:?} with glob {}", path, pattern);
        self.directory_globs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(path.to_path_buf())
            .or_default()
            .insert(pattern.to_owned());
        Ok(())
    }

    pub fn watch_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if !path.is_absolute() {
            return Err(Error::NotAbsolute(path.to_path_buf()));
        }

        debug!("Watching file {:?}", path);
        self.extra_files
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_path_buf());
        Ok(())
    }

    pub fn extra_files(&self) -> Vec<PathBuf> {
        self.extra_files
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn directory_globs(&self) -> Vec<(PathBuf, BTreeSet<String>)> {
        self.directory_globs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(dir, patterns)| (dir.clone(), patterns.clone()))
            .collect()
    }

    /// Every file that needs watching: module files, files that failed to
    /// load, extra files, and matches of the directory globs.
    ///
    /// A file can come up more than once when registrations overlap.
    pub fn watched_files(&self, include_globs: bool) -> impl Iterator<Item = PathBuf> {
        let modules = self.registry.module_files();
        let extra = self.extra_files().into_iter().map(|path| {
            // Kept when missing, its creation is a change too
            path.canonicalize().unwrap_or(path)
        });
        let globs = if include_globs {
            self.directory_globs()
        } else {
            Vec::new()
        };

        let module_files: Vec<PathBuf> = modules.iter().cloned().collect();
        module_files
            .into_iter()
            .chain(extra)
            .chain(
                globs
                    .into_iter()
                    .flat_map(|(dir, patterns)| glob_matches(&dir, &patterns)),
            )
    }

    pub fn notify_file_changed(&self, path: &Path, kind: ChangeKind) -> Notification {
        self.notifier.notify_file_changed(path, kind)
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

pub(crate) fn is_recursive(pattern: &str) -> bool {
    pattern.contains("**")
}

pub(crate) fn compile_glob(pattern: &str) -> Result<globset::Glob> {
    Ok(GlobBuilder::new(pattern).literal_separator(true).build()?)
}

pub(crate) fn compile_globs(patterns: &BTreeSet<String>) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(compile_glob(pattern)?);
    }
    Ok(builder.build()?)
}

// How deep below the directory a pattern can reach
fn pattern_depth(pattern: &str) -> usize {
    if is_recursive(pattern) {
        usize::MAX
    } else {
        Path::new(pattern).components().count().max(1)
    }
}

/// Files under `directory` matching any of `patterns`, canonicalized.
///
/// A directory that doesn't exist has no matches.
pub fn glob_matches(directory: &Path, patterns: &BTreeSet<String>) -> Vec<PathBuf> {
    let set = match compile_globs(patterns) {
        Ok(set) => set,
        Err(err) => {
            warn!("Skipping globs in {:?}: {}", directory, err);
            return Vec::new();
        }
    };
    let depth = patterns.iter().map(|p| pattern_depth(p)).max().unwrap_or(1);

    WalkDir::new(directory)
        .min_depth(1)
        .max_depth(depth)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .path()
                .strip_prefix(directory)
                .map_or(false, |relative| set.is_match(relative))
        })
        .filter_map(|entry| entry.path().canonicalize().ok())
        .collect()
}

/// The contract shared by the reloaders.
pub trait Reloader: Send + Sync {
    fn name(&self) -> &'static str;

    fn watches(&self) -> &WatchSet;

    /// The watch set, shared. Another reloader built on it sees the same
    /// registrations and the same stop flag.
    fn watch_set(&self) -> Arc<WatchSet>;

    /// Watch until stopped.
    fn run_loop(&self) -> Result<()>;

    /// Tell observers watching has started, then watch until stopped.
    fn run(&self) -> Result<()> {
        self.watches().notifier().started(self.watches());
        self.run_loop()
    }

    fn watch_file(&self, path: &Path) -> Result<()> {
        self.watches().watch_file(path)
    }

    fn watch_dir(&self, path: &Path, pattern: &str) -> Result<()> {
        self.watches().watch_dir(path, pattern)
    }

    fn stop(&self) {
        self.watches().stop()
    }

    fn should_stop(&self) -> bool {
        self.watches().should_stop()
    }
}

/// One of the two reloaders
///
/// `StatReloader` and `NotifyReloader` are distinct types; callers get
/// whichever the platform and configuration allow and handle it through
/// [`Reloader`].
pub enum AnyReloader {
    Stat(StatReloader),
    Native(NotifyReloader),
}

impl AnyReloader {
    pub fn is_polling(&self) -> bool {
        matches!(self, AnyReloader::Stat(_))
    }
}

impl Reloader for AnyReloader {
    fn name(&self) -> &'static str {
        match self {
            AnyReloader::Stat(r) => r.name(),
            AnyReloader::Native(r) => r.name(),
        }
    }

    fn watches(&self) -> &WatchSet {
        match self {
            AnyReloader::Stat(r) => r.watches(),
            AnyReloader::Native(r) => r.watches(),
        }
    }

    fn watch_set(&self) -> Arc<WatchSet> {
        match self {
            AnyReloader::Stat(r) => r.watch_set(),
            AnyReloader::Native(r) => r.watch_set(),
        }
    }

    fn run_loop(&self) -> Result<()> {
        match self {
            AnyReloader::Stat(r) => r.run_loop(),
            AnyReloader::Native(r) => r.run_loop(),
        }
    }
}

/// Pick a reloader for `config` and register its extra files and globs.
pub fn get_reloader(
    config: &Config,
    registry: Arc<Registry>,
    notifier: Arc<Notifier>,
) -> Result<AnyReloader> {
    let watches = WatchSet::new(registry, notifier);
    for file in &config.extra_files {
        watches.watch_file(file)?;
    }
    for (dir, pattern) in &config.globs {
        watches.watch_dir(dir, pattern)?;
    }

    let native = match config.reloader {
        ReloaderKind::Stat => false,
        ReloaderKind::Auto => NotifyReloader::check_availability(),
        ReloaderKind::Native => {
            let available = NotifyReloader::check_availability();
            if !available {
                warn!("Native file events are unavailable, falling back to polling");
            }
            available
        }
    };

    Ok(if native {
        AnyReloader::Native(NotifyReloader::new(watches, config))
    } else {
        AnyReloader::Stat(StatReloader::new(watches, config.poll_interval))
    })
}
