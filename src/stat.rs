//! Change detection by polling modification times.
//!
//! Works on every filesystem, at the price of a `stat` per watched file per
//! tick.

use crate::error::Result;
use crate::pathop::ChangeKind;
use crate::reloader::{Reloader, WatchSet};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, SystemTime};

/// Lifecycle of a [`StatReloader`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    Idle,
    Polling,
    Stopped,
}

pub type Snapshot = HashMap<PathBuf, SystemTime>;

pub struct StatReloader {
    watches: Arc<WatchSet>,
    interval: Duration,
    state: Mutex<State>,
    // Paths present in the previous snapshot
    present: Mutex<HashSet<PathBuf>>,
}

impl StatReloader {
    /// Check for changes once per second.
    pub const SLEEP_TIME: Duration = Duration::from_secs(1);

    pub fn new(watches: impl Into<Arc<WatchSet>>, interval: Duration) -> Self {
        Self {
            watches: watches.into(),
            interval,
            state: Mutex::new(State::Idle),
            present: Mutex::new(HashSet::new()),
        }
    }

    pub fn check_availability() -> bool {
        true
    }

    pub fn state(&self) -> State {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: State) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Start ticking by hand. `run_loop` is a ticker driven until stopped.
    pub fn ticker(&self) -> Ticker<'_> {
        Ticker {
            reloader: self,
            times: Snapshot::new(),
            previous_timestamp: SystemTime::now(),
        }
    }

    pub fn snapshot_files(&self) -> Vec<(PathBuf, SystemTime)> {
        snapshot(self.watches.watched_files(true))
    }

    /// Compare a fresh snapshot to `previous_times` and notify changes.
    ///
    /// A file that wasn't seen before only counts as changed if it was
    /// modified after `previous_timestamp`: files are seen for the first time
    /// both when they're created and when a module gets loaded on the fly,
    /// and only the former is a change. Files present in the previous call
    /// change as `Modified`, others as `Created`. Returns the times of the
    /// files that notified.
    pub fn loop_files(&self, previous_times: &Snapshot, previous_timestamp: SystemTime) -> Snapshot {
        let mut updated_times = Snapshot::new();
        let mut seen = HashSet::new();
        let was_present = self
            .present
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for (path, mtime) in self.snapshot_files() {
            // Overlapping globs yield some files more than once
            if !seen.insert(path.clone()) {
                continue;
            }

            let previous_time = previous_times.get(&path);
            let is_newly_created = previous_time.is_none() && mtime > previous_timestamp;
            let is_changed = previous_time.map_or(false, |time| *time != mtime);

            if is_newly_created || is_changed {
                debug!(
                    "File {:?}. is_changed: {}, is_new: {}",
                    path, is_changed, is_newly_created
                );
                debug!(
                    "File {:?} previous mtime: {:?}, current mtime: {:?}",
                    path, previous_time, mtime
                );
                let kind = if is_changed || was_present.contains(&path) {
                    ChangeKind::Modified
                } else {
                    ChangeKind::Created
                };
                self.watches.notify_file_changed(&path, kind);
                updated_times.insert(path, mtime);
            }
        }

        *self.present.lock().unwrap_or_else(PoisonError::into_inner) = seen;
        updated_times
    }
}

/// Modification times of `files`; files that can't be stat'ed are skipped.
pub fn snapshot(files: impl IntoIterator<Item = PathBuf>) -> Vec<(PathBuf, SystemTime)> {
    files
        .into_iter()
        .filter_map(|file| match fs::metadata(&file).and_then(|meta| meta.modified()) {
            Ok(mtime) => Some((file, mtime)),
            Err(err) => {
                trace!("Not stat'ing {:?}: {}", file, err);
                None
            }
        })
        .collect()
}

/// One poll per call to [`tick`](Ticker::tick).
pub struct Ticker<'a> {
    reloader: &'a StatReloader,
    times: Snapshot,
    previous_timestamp: SystemTime,
}

impl<'a> Ticker<'a> {
    pub fn tick(&mut self) {
        let updated = self
            .reloader
            .loop_files(&self.times, self.previous_timestamp);
        self.times.extend(updated);
        self.previous_timestamp = SystemTime::now();
        thread::sleep(self.reloader.interval);
    }
}

impl Reloader for StatReloader {
    fn name(&self) -> &'static str {
        "StatReloader"
    }

    fn watches(&self) -> &WatchSet {
        &self.watches
    }

    fn watch_set(&self) -> Arc<WatchSet> {
        Arc::clone(&self.watches)
    }

    fn run_loop(&self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state != State::Idle {
                debug!("StatReloader is {:?}, not polling", *state);
                return Ok(());
            }
            *state = State::Polling;
        }

        let mut ticker = self.ticker();
        while !self.should_stop() {
            ticker.tick();
        }

        self.set_state(State::Stopped);
        self.stop();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::Notifier;
    use crate::registry::Registry;
    use std::fs::OpenOptions;
    use std::path::Path;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        tempdir: PathBuf,
        existing_file: PathBuf,
        nonexistent_file: PathBuf,
        reloader: StatReloader,
        notified: Arc<Mutex<Vec<(PathBuf, ChangeKind)>>>,
    }

    fn set_mtime(path: &Path, time: SystemTime) {
        OpenOptions::new()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(time)
            .unwrap();
    }

    fn increment_mtime(path: &Path) {
        set_mtime(path, SystemTime::now() + Duration::from_secs(1));
    }

    // Touching leaves an mtime from the last kernel tick, which can be in the
    // past. Pin it to the observed time instead.
    fn ensure_file(path: &Path) -> PathBuf {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "").unwrap();
        set_mtime(path, SystemTime::now());
        path.to_path_buf()
    }

    fn setup() -> Fixture {
        let dir = TempDir::new().unwrap();
        let tempdir = dir.path().canonicalize().unwrap();
        let existing_file = ensure_file(&tempdir.join("test.rs"));
        let nonexistent_file = tempdir.join("does_not_exist.rs");

        let notified = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&notified);
        let notifier = Notifier::with_reload_action(|_| {});
        notifier.connect(move |event| {
            record.lock().unwrap().push((event.path.clone(), event.kind));
            true
        });

        let watches = WatchSet::new(Arc::new(Registry::default()), Arc::new(notifier));
        Fixture {
            _dir: dir,
            tempdir,
            existing_file,
            nonexistent_file,
            reloader: StatReloader::new(watches, Duration::from_millis(10)),
            notified,
        }
    }

    impl Fixture {
        fn tick_twice(&self, between: impl FnOnce()) {
            let mut ticker = self.reloader.ticker();
            ticker.tick();
            between();
            ticker.tick();
        }

        fn notified_paths(&self) -> Vec<PathBuf> {
            let mut paths: Vec<PathBuf> = self
                .notified
                .lock()
                .unwrap()
                .iter()
                .map(|(path, _)| path.clone())
                .collect();
            paths.sort();
            paths
        }
    }

    #[test]
    fn file() {
        let f = setup();
        f.reloader.watches().watch_file(&f.existing_file).unwrap();
        f.tick_twice(|| increment_mtime(&f.existing_file));
        assert_eq!(f.notified_paths(), vec![f.existing_file.clone()]);
    }

    #[test]
    fn nonexistent_file() {
        let f = setup();
        f.reloader.watches().watch_file(&f.nonexistent_file).unwrap();
        f.tick_twice(|| {
            ensure_file(&f.nonexistent_file);
        });
        assert_eq!(f.notified_paths(), vec![f.nonexistent_file.clone()]);
        assert_eq!(f.notified.lock().unwrap()[0].1, ChangeKind::Created);
    }

    #[test]
    fn nonexistent_file_in_non_existing_directory() {
        let f = setup();
        let file = f.tempdir.join("non_existing_dir").join("test");
        f.reloader.watches().watch_file(&file).unwrap();
        f.tick_twice(|| {
            ensure_file(&file);
        });
        assert_eq!(f.notified_paths(), vec![file]);
    }

    #[test]
    fn glob() {
        let f = setup();
        let non_rs_file = ensure_file(&f.tempdir.join("non_rs_file"));
        f.reloader.watches().watch_dir(&f.tempdir, "*.rs").unwrap();
        f.tick_twice(|| {
            increment_mtime(&non_rs_file);
            increment_mtime(&f.existing_file);
        });
        assert_eq!(f.notified_paths(), vec![f.existing_file.clone()]);
    }

    #[test]
    fn glob_creates_only_matching() {
        let f = setup();
        f.reloader.watches().watch_dir(&f.tempdir, "*.rs").unwrap();
        let module = f.tempdir.join("m.rs");
        f.tick_twice(|| {
            ensure_file(&f.tempdir.join("data.txt"));
            ensure_file(&module);
        });
        assert_eq!(f.notified_paths(), vec![module]);
    }

    #[test]
    fn glob_non_existing_directory() {
        let f = setup();
        let dir = f.tempdir.join("does_not_exist");
        let file = dir.join("test.rs");
        f.reloader.watches().watch_dir(&dir, "*.rs").unwrap();
        f.tick_twice(|| {
            ensure_file(&file);
        });
        assert_eq!(f.notified_paths(), vec![file]);
    }

    #[test]
    fn multiple_globs() {
        let f = setup();
        ensure_file(&f.tempdir.join("x.test"));
        f.reloader.watches().watch_dir(&f.tempdir, "*.rs").unwrap();
        f.reloader.watches().watch_dir(&f.tempdir, "*.test").unwrap();
        f.tick_twice(|| increment_mtime(&f.existing_file));
        assert_eq!(f.notified_paths(), vec![f.existing_file.clone()]);
    }

    #[test]
    fn overlapping_globs() {
        let f = setup();
        f.reloader.watches().watch_dir(&f.tempdir, "*.rs").unwrap();
        f.reloader.watches().watch_dir(&f.tempdir, "*.r*").unwrap();
        f.tick_twice(|| increment_mtime(&f.existing_file));
        assert_eq!(f.notified_paths(), vec![f.existing_file.clone()]);
    }

    #[test]
    fn glob_recursive() {
        let f = setup();
        let non_rs_file = ensure_file(&f.tempdir.join("dir").join("non_rs_file"));
        let rs_file = ensure_file(&f.tempdir.join("dir").join("file.rs"));
        f.reloader.watches().watch_dir(&f.tempdir, "**/*.rs").unwrap();
        f.tick_twice(|| {
            increment_mtime(&non_rs_file);
            increment_mtime(&rs_file);
        });
        assert_eq!(f.notified_paths(), vec![rs_file]);
    }

    #[test]
    fn non_recursive_glob_misses_nested() {
        let f = setup();
        let rs_file = ensure_file(&f.tempdir.join("dir").join("file.rs"));
        f.reloader.watches().watch_dir(&f.tempdir, "*.rs").unwrap();
        f.tick_twice(|| increment_mtime(&rs_file));
        assert!(f.notified_paths().is_empty());
    }

    #[test]
    fn multiple_recursive_globs() {
        let f = setup();
        let txt_file = ensure_file(&f.tempdir.join("dir").join("test.txt"));
        let rs_file = ensure_file(&f.tempdir.join("dir").join("file.rs"));
        f.reloader.watches().watch_dir(&f.tempdir, "**/*.txt").unwrap();
        f.reloader.watches().watch_dir(&f.tempdir, "**/*.rs").unwrap();
        f.tick_twice(|| {
            increment_mtime(&txt_file);
            increment_mtime(&rs_file);
        });
        assert_eq!(f.notified_paths(), vec![rs_file, txt_file]);
    }

    #[test]
    fn nested_glob_recursive() {
        let f = setup();
        let inner_rs_file = ensure_file(&f.tempdir.join("dir").join("file.rs"));
        f.reloader.watches().watch_dir(&f.tempdir, "**/*.rs").unwrap();
        f.reloader
            .watches()
            .watch_dir(inner_rs_file.parent().unwrap(), "**/*.rs")
            .unwrap();
        f.tick_twice(|| increment_mtime(&inner_rs_file));
        assert_eq!(f.notified_paths(), vec![inner_rs_file]);
    }

    #[test]
    fn overlapping_glob_recursive() {
        let f = setup();
        let rs_file = ensure_file(&f.tempdir.join("dir").join("file.rs"));
        f.reloader.watches().watch_dir(&f.tempdir, "**/*.r*").unwrap();
        f.reloader.watches().watch_dir(&f.tempdir, "**/*.rs*").unwrap();
        f.tick_twice(|| increment_mtime(&rs_file));
        assert_eq!(f.notified_paths(), vec![rs_file]);
    }

    #[test]
    fn snapshot_files_ignores_missing_files() {
        let f = setup();
        assert!(snapshot(vec![f.nonexistent_file.clone()]).is_empty());
    }

    #[test]
    fn snapshot_files_updates() {
        let f = setup();
        let first = snapshot(vec![f.existing_file.clone()]);
        increment_mtime(&f.existing_file);
        let second = snapshot(vec![f.existing_file.clone()]);
        assert_eq!(first[0].0, f.existing_file);
        assert_ne!(first[0].1, second[0].1);
    }

    #[test]
    fn does_not_fire_without_changes() {
        let f = setup();
        f.reloader.watches().watch_file(&f.existing_file).unwrap();
        let mtime = fs::metadata(&f.existing_file).unwrap().modified().unwrap();
        let mut initial = Snapshot::new();
        initial.insert(f.existing_file.clone(), mtime);

        let second = f.reloader.loop_files(&initial, SystemTime::now());
        assert!(second.is_empty());
        assert!(f.notified_paths().is_empty());
    }

    #[test]
    fn untouched_file_never_fires() {
        let f = setup();
        f.reloader.watches().watch_file(&f.existing_file).unwrap();
        let mut ticker = f.reloader.ticker();
        for _ in 0..3 {
            ticker.tick();
        }
        assert!(f.notified_paths().is_empty());
    }

    #[test]
    fn fires_when_created() {
        let f = setup();
        f.reloader.watches().watch_file(&f.nonexistent_file).unwrap();
        ensure_file(&f.nonexistent_file);
        let mtime = fs::metadata(&f.nonexistent_file).unwrap().modified().unwrap();

        let second = f
            .reloader
            .loop_files(&Snapshot::new(), mtime - Duration::from_secs(1));
        assert_eq!(second.keys().collect::<Vec<_>>(), vec![&f.nonexistent_file]);
        assert_eq!(f.notified_paths(), vec![f.nonexistent_file.clone()]);
    }

    #[test]
    fn fires_with_changes() {
        let f = setup();
        f.reloader.watches().watch_file(&f.existing_file).unwrap();
        let mut initial = Snapshot::new();
        initial.insert(f.existing_file.clone(), SystemTime::UNIX_EPOCH);

        let second = f.reloader.loop_files(&initial, SystemTime::now());
        assert_eq!(f.notified_paths(), vec![f.existing_file.clone()]);
        assert_eq!(second.keys().collect::<Vec<_>>(), vec![&f.existing_file]);
        assert_eq!(f.notified.lock().unwrap()[0].1, ChangeKind::Modified);
    }

    fn notified_kinds(f: &Fixture) -> Vec<ChangeKind> {
        f.notified.lock().unwrap().iter().map(|(_, kind)| *kind).collect()
    }

    #[test]
    fn edit_to_existing_file_is_a_modification() {
        let f = setup();
        set_mtime(&f.existing_file, SystemTime::now() - Duration::from_secs(60));
        f.reloader.watches().watch_file(&f.existing_file).unwrap();

        f.tick_twice(|| increment_mtime(&f.existing_file));

        assert_eq!(f.notified_paths(), vec![f.existing_file.clone()]);
        assert_eq!(notified_kinds(&f), vec![ChangeKind::Modified]);
    }

    #[test]
    fn new_file_is_a_creation() {
        let f = setup();
        f.reloader.watches().watch_file(&f.nonexistent_file).unwrap();

        f.tick_twice(|| {
            ensure_file(&f.nonexistent_file);
            increment_mtime(&f.nonexistent_file);
        });

        assert_eq!(f.notified_paths(), vec![f.nonexistent_file.clone()]);
        assert_eq!(notified_kinds(&f), vec![ChangeKind::Created]);
    }

    #[test]
    fn run_loop_stops() {
        let f = setup();
        let reloader = Arc::new(f.reloader);
        let running = Arc::clone(&reloader);
        let handle = thread::spawn(move || running.run_loop());

        while reloader.state() == State::Idle {
            thread::sleep(Duration::from_millis(1));
        }
        reloader.stop();
        handle.join().unwrap().unwrap();
        assert_eq!(reloader.state(), State::Stopped);
    }

    #[test]
    fn stopped_reloader_does_not_run_again() {
        let f = setup();
        f.reloader.stop();
        f.reloader.run_loop().unwrap();
        assert_eq!(f.reloader.state(), State::Stopped);
        f.reloader.run_loop().unwrap();
        assert_eq!(f.reloader.state(), State::Stopped);
    }
}
