//! Process-scoped state shared by the reloaders.
//!
//! The host application reports the modules it has loaded here, and wraps
//! its load operations in [`Registry::check_errors`] so that files which fail
//! to load stay watched even though they never made it into the module table.
//! Everything in a [`Registry`] is either append-only or recomputed wholesale,
//! so the entry point and the watcher can share one without coordination.

use crate::error::{Error, Result};
use std::any::Any;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once, PoisonError, RwLock};

lazy_static! {
    static ref GLOBAL: Arc<Registry> = Arc::new(Registry::default());
}

static PANIC_HOOK: Once = Once::new();

thread_local! {
    // Source file of the last panic on this thread
    static PANIC_LOCATION: RefCell<Option<PathBuf>> = RefCell::new(None);
}

// Chain a hook in front of the current one so a panicking load can be
// attributed to the file it panicked in.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if let Some(location) = info.location() {
                let _ = PANIC_LOCATION.try_with(|slot| {
                    *slot.borrow_mut() = Some(PathBuf::from(location.file()));
                });
            }
            previous(info);
        }));
    });
}

fn take_panic_location() -> Option<PathBuf> {
    PANIC_LOCATION
        .try_with(|slot| slot.borrow_mut().take())
        .unwrap_or(None)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "load panicked".to_owned())
}

/// Where a loaded module came from.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum ModuleOrigin {
    /// Loaded from a source file on disk.
    File(PathBuf),
    /// Loaded from a member of an archive; the archive itself is watched.
    Archive(PathBuf),
    /// Compiled in, or otherwise without a location.
    Builtin,
    /// An entry in the module table that isn't a real module (a proxy, an
    /// alias for a type namespace...). Never watched.
    Shim,
}

impl ModuleOrigin {
    pub fn location(&self) -> Option<&Path> {
        match self {
            ModuleOrigin::File(path) | ModuleOrigin::Archive(path) => Some(path),
            ModuleOrigin::Builtin | ModuleOrigin::Shim => None,
        }
    }
}

/// An error raised while loading a module.
///
/// Implement this for whatever the host's loader returns. The file a failure
/// is attributed to is its own [`file_name`](LoadFailure::file_name) if it has
/// one, else the innermost entry of its [`trace`](LoadFailure::trace).
pub trait LoadFailure: fmt::Display {
    fn kind(&self) -> &str {
        "Load"
    }

    fn file_name(&self) -> Option<&Path> {
        None
    }

    /// Files of the frames the failure unwound through, outermost first.
    fn trace(&self) -> Vec<PathBuf> {
        Vec::new()
    }
}

/// A ready-made [`LoadFailure`] for hosts without their own error type.
#[derive(Clone, Debug)]
pub struct LoadError {
    kind: String,
    message: String,
    file_name: Option<PathBuf>,
    trace: Vec<PathBuf>,
}

impl LoadError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            file_name: None,
            trace: Vec::new(),
        }
    }

    pub fn with_file_name(mut self, path: impl Into<PathBuf>) -> Self {
        self.file_name = Some(path.into());
        self
    }

    /// Push a frame; the last frame pushed is the innermost.
    pub fn with_frame(mut self, path: impl Into<PathBuf>) -> Self {
        self.trace.push(path.into());
        self
    }

    /// Take a detached copy of any failure.
    pub fn capture<E: LoadFailure + ?Sized>(err: &E) -> Self {
        Self {
            kind: err.kind().to_owned(),
            message: err.to_string(),
            file_name: err.file_name().map(Path::to_path_buf),
            trace: err.trace(),
        }
    }
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl StdError for LoadError {}

impl LoadFailure for LoadError {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn file_name(&self) -> Option<&Path> {
        self.file_name.as_deref()
    }

    fn trace(&self) -> Vec<PathBuf> {
        self.trace.clone()
    }
}

impl LoadFailure for io::Error {
    fn kind(&self) -> &str {
        "I/O"
    }
}

impl LoadFailure for Box<dyn StdError + Send + Sync> {}

/// Hit and miss counts of the module file cache.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CacheInfo {
    pub hits: usize,
    pub misses: usize,
}

struct Cached {
    modules: Vec<(String, ModuleOrigin)>,
    error_files: BTreeSet<PathBuf>,
    files: Arc<BTreeSet<PathBuf>>,
}

#[derive(Default)]
pub struct Registry {
    modules: RwLock<BTreeMap<String, ModuleOrigin>>,
    error_files: RwLock<Vec<PathBuf>>,
    last_error: Mutex<Option<LoadError>>,
    cache: Mutex<Option<Cached>>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl Registry {
    /// The registry of the current process.
    pub fn global() -> Arc<Self> {
        Arc::clone(&GLOBAL)
    }

    pub fn register_module(&self, name: impl Into<String>, origin: ModuleOrigin) {
        let name = name.into();
        trace!("Registering module {} from {:?}", name, origin);
        self.modules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, origin);
    }

    pub fn unregister_module(&self, name: &str) -> Option<ModuleOrigin> {
        self.modules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }

    pub fn error_files(&self) -> Vec<PathBuf> {
        self.error_files
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run a load operation, remembering the file responsible if it fails.
    ///
    /// The error is handed back untouched. A panic is recorded against the
    /// file it was raised in and then resumed.
    pub fn check_errors<T, E, F>(&self, load: F) -> std::result::Result<T, E>
    where
        F: FnOnce() -> std::result::Result<T, E>,
        E: LoadFailure,
    {
        install_panic_hook();
        take_panic_location();

        match panic::catch_unwind(AssertUnwindSafe(load)) {
            Ok(result) => result.map_err(|err| {
                self.record_failure(&err);
                err
            }),
            Err(payload) => {
                let mut failure = LoadError::new("Panic", panic_message(&*payload));
                if let Some(file) = take_panic_location() {
                    failure = failure.with_file_name(file);
                }
                self.record_failure(&failure);
                panic::resume_unwind(payload)
            }
        }
    }

    pub fn record_failure<E: LoadFailure + ?Sized>(&self, err: &E) {
        let filename = err
            .file_name()
            .map(Path::to_path_buf)
            .or_else(|| err.trace().pop());

        match filename {
            Some(filename) => {
                let mut files = self
                    .error_files
                    .write()
                    .unwrap_or_else(PoisonError::into_inner);
                if !files.contains(&filename) {
                    debug!("Load of {:?} failed, keeping it watched", filename);
                    files.push(filename);
                }
            }
            None => warn!("Load failed without a file to blame: {}", err),
        }

        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(LoadError::capture(err));
    }

    /// Surface the last load failure captured in this process, if any.
    pub fn raise_last_exception(&self) -> Result<()> {
        match &*self.last_error.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(err) => Err(Error::Load(err.clone())),
            None => Ok(()),
        }
    }

    /// Files of all loaded modules plus files that failed to load.
    ///
    /// Paths that don't exist are dropped, the rest are canonicalized. The
    /// result is memoized on the module table and the error files, so as long
    /// as nothing is loaded on the fly this is a cheap lookup.
    pub fn module_files(&self) -> Arc<BTreeSet<PathBuf>> {
        let modules: Vec<(String, ModuleOrigin)> = self
            .modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, origin)| (name.clone(), origin.clone()))
            .collect();
        let error_files: BTreeSet<PathBuf> = self.error_files().into_iter().collect();

        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(cached) = cache.as_ref() {
            if cached.modules == modules && cached.error_files == error_files {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Arc::clone(&cached.files);
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let files = Arc::new(modules_and_files(&modules, &error_files));
        *cache = Some(Cached {
            modules,
            error_files,
            files: Arc::clone(&files),
        });
        files
    }

    pub fn cache_info(&self) -> CacheInfo {
        CacheInfo {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    pub fn clear_cache(&self) {
        *self.cache.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    /// Forget everything. For tests.
    pub fn reset(&self) {
        self.modules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.error_files
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.clear_cache();
    }
}

fn modules_and_files(
    modules: &[(String, ModuleOrigin)],
    error_files: &BTreeSet<PathBuf>,
) -> BTreeSet<PathBuf> {
    modules
        .iter()
        .filter_map(|(_, origin)| origin.location())
        .chain(error_files.iter().map(PathBuf::as_path))
        .filter(|path| !path.as_os_str().is_empty())
        // A module can be deleted while loaded; canonicalize fails on those
        .filter_map(|path| path.canonicalize().ok())
        .collect()
}
