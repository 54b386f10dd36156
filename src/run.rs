//! Supervision across process boundaries.
//!
//! The parent process relaunches itself as a child with [`RUN_MAIN`] set and
//! keeps doing so while the child exits with [`RELOAD_EXIT_CODE`]. The child
//! runs the entry point on a worker thread and the reloader on the current
//! one.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::native::Resubscriber;
use crate::notifier::Notifier;
use crate::process;
use crate::registry::Registry;
use crate::reloader::{get_reloader, AnyReloader, Reloader};
use crate::signal;
use crate::stat::StatReloader;
use crate::terminal;
use std::env;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;

/// Exit code asking the supervisor for a fresh child.
pub const RELOAD_EXIT_CODE: i32 = 3;

/// Set to `true` in the environment of supervised children.
pub const RUN_MAIN: &str = "RUN_MAIN";

pub fn is_reloaded_child() -> bool {
    env::var_os(RUN_MAIN).map_or(false, |value| value == "true")
}

/// What the child runs after the executable and its options.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Entry {
    /// The executable is the program.
    Binary,
    /// A script handed to an interpreter.
    Script(PathBuf),
    /// A package run as a module, `-m <name>`.
    Module(String),
}

/// The command line that started this process, rebuilt for the child.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Invocation {
    pub executable: PathBuf,
    pub options: Vec<OsString>,
    pub entry: Entry,
    pub args: Vec<OsString>,
}

impl Invocation {
    /// The running binary with the arguments it was given.
    pub fn current() -> Result<Self> {
        Ok(Self {
            executable: env::current_exe()?,
            options: Vec::new(),
            entry: Entry::Binary,
            args: env::args_os().skip(1).collect(),
        })
    }

    /// A script or package run by `interpreter`.
    ///
    /// `argv[0]` is the script as the interpreter saw it. When the program
    /// was started as a module, `package_main` names the package and its
    /// main file, and the child is started with `-m <package>` again.
    pub fn interpreted(
        interpreter: impl Into<PathBuf>,
        options: Vec<OsString>,
        argv: &[OsString],
        package_main: Option<(&str, &Path)>,
    ) -> Result<Self> {
        let interpreter = interpreter.into();
        let (script, args) = match argv.split_first() {
            Some((script, args)) => (PathBuf::from(script), args.to_vec()),
            None => {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "no script in the argument list",
                )))
            }
        };

        if let Some((package, main)) = package_main {
            debug!("{:?} runs as module {}", main, package);
            return Ok(Self {
                executable: interpreter,
                options,
                entry: Entry::Module(package.to_owned()),
                args,
            });
        }

        if script.exists() {
            return Ok(Self {
                executable: interpreter,
                options,
                entry: Entry::Script(script),
                args,
            });
        }

        // Launchers installed as `name.exe` or `name-script.py` are invoked
        // without their suffix.
        let exe = with_suffix(&script, ".exe");
        if exe.exists() {
            return Ok(Self {
                executable: exe,
                options: Vec::new(),
                entry: Entry::Binary,
                args,
            });
        }
        let launcher = with_suffix(&script, "-script.py");
        if launcher.exists() {
            return Ok(Self {
                executable: interpreter,
                options,
                entry: Entry::Script(launcher),
                args,
            });
        }

        Err(Error::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("Script {} does not exist.", script.display()),
        )))
    }

    /// Everything after the executable on the child's command line.
    pub fn child_arguments(&self) -> Vec<OsString> {
        let mut arguments = self.options.clone();
        match &self.entry {
            Entry::Binary => {}
            Entry::Script(script) => arguments.push(script.clone().into_os_string()),
            Entry::Module(package) => {
                arguments.push("-m".into());
                arguments.push(package.into());
            }
        }
        arguments.extend(self.args.iter().cloned());
        arguments
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Starts one child and reports its exit code.
pub trait Spawn {
    fn spawn(&mut self, invocation: &Invocation) -> Result<i32>;
}

impl<F> Spawn for F
where
    F: FnMut(&Invocation) -> Result<i32>,
{
    fn spawn(&mut self, invocation: &Invocation) -> Result<i32> {
        self(invocation)
    }
}

/// Spawns real children with the inherited environment plus `RUN_MAIN`.
pub struct ChildSpawner;

impl Spawn for ChildSpawner {
    fn spawn(&mut self, invocation: &Invocation) -> Result<i32> {
        let mut command = Command::new(&invocation.executable);
        command
            .args(invocation.child_arguments())
            .env(RUN_MAIN, "true");
        debug!("Assembled command {:?}", command);

        let status = command.status()?;
        Ok(process::exit_code(status))
    }
}

/// Relaunch until a child exits with something other than the reload code.
pub fn restart_with<S: Spawn>(invocation: &Invocation, spawner: &mut S) -> Result<i32> {
    loop {
        let code = spawner.spawn(invocation)?;
        if code != RELOAD_EXIT_CODE {
            return Ok(code);
        }
        debug!("Child asked for a reload");
    }
}

pub fn restart_with_reloader(invocation: &Invocation) -> Result<i32> {
    restart_with(invocation, &mut ChildSpawner)
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Readiness {
    Pending,
    Ready,
    Abandoned,
}

/// One-shot latch the entry point flips once it is up.
#[derive(Clone)]
pub struct Ready(Arc<(Mutex<Readiness>, Condvar)>);

impl Ready {
    fn new() -> Self {
        Ready(Arc::new((Mutex::new(Readiness::Pending), Condvar::new())))
    }

    fn resolve(&self, outcome: Readiness) {
        let (lock, cvar) = &*self.0;
        let mut state = lock.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == Readiness::Pending {
            *state = outcome;
            cvar.notify_all();
        }
    }

    pub fn set(&self) {
        self.resolve(Readiness::Ready)
    }

    fn abandon(&self) {
        self.resolve(Readiness::Abandoned)
    }

    pub fn is_set(&self) -> bool {
        *(self.0).0.lock().unwrap_or_else(PoisonError::into_inner) == Readiness::Ready
    }

    /// Block until set or abandoned. `true` when set.
    fn wait(&self) -> bool {
        let (lock, cvar) = &*self.0;
        let mut state = lock.lock().unwrap_or_else(PoisonError::into_inner);
        while *state == Readiness::Pending {
            state = cvar.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        *state == Readiness::Ready
    }
}

struct AbandonOnDrop(Ready);

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        self.0.abandon();
    }
}

/// What the entry point gets to see of its supervision.
pub struct Supervised {
    ready: Ready,
    reloader: Arc<AnyReloader>,
}

impl Supervised {
    /// Start watching. Until this is called the reloader does not run.
    pub fn ready(&self) {
        self.ready.set()
    }

    pub fn reloader(&self) -> &Arc<AnyReloader> {
        &self.reloader
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        self.reloader.watches().notifier()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        self.reloader.watches().registry()
    }

    /// Hook for request-finished events, native reloader only.
    pub fn resubscriber(&self) -> Option<Resubscriber> {
        match &*self.reloader {
            AnyReloader::Native(reloader) => Some(reloader.resubscriber()),
            AnyReloader::Stat(_) => None,
        }
    }
}

/// Run `main` on a worker thread and `reloader` here, once `main` is ready.
///
/// Returns the code of `main` when it finishes before getting ready, 0 when
/// the reloader was stopped.
pub fn start_watching<F>(reloader: Arc<AnyReloader>, config: &Config, main: F) -> Result<i32>
where
    F: FnOnce(&Supervised) -> i32 + Send + 'static,
{
    let ready = Ready::new();
    let supervised = Supervised {
        ready: ready.clone(),
        reloader: Arc::clone(&reloader),
    };

    let entry = thread::Builder::new()
        .name("main".into())
        .spawn(move || {
            let _guard = AbandonOnDrop(supervised.ready.clone());

            // A failed load stays watched; wait for it to be fixed.
            if let Err(err) = supervised.registry().raise_last_exception() {
                error!("{}", err);
                supervised.ready();
                return 1;
            }

            main(&supervised)
        })?;

    if !ready.wait() {
        return match entry.join() {
            Ok(code) => {
                debug!("Entry point finished before getting ready");
                Ok(code)
            }
            Err(_) => {
                error!("Entry point panicked");
                Ok(1)
            }
        };
    }

    info!("Watching for file changes with {}", reloader.name());
    match reloader.run() {
        Ok(()) => {}
        Err(err) if !reloader.is_polling() && !reloader.should_stop() => {
            warn!("{} failed, falling back to polling: {}", reloader.name(), err);
            StatReloader::new(reloader.watch_set(), config.poll_interval).run_loop()?;
        }
        Err(err) => return Err(err),
    }

    Ok(0)
}

/// Supervise `main`: relaunch in a child process, and in the child run
/// `main` under a reloader.
pub fn run_with_reloader<F>(config: &Config, main: F) -> Result<i32>
where
    F: FnOnce(&Supervised) -> i32 + Send + 'static,
{
    signal::install_handler();

    if is_reloaded_child() {
        terminal::ensure_echo_on();
        let reloader = get_reloader(
            config,
            Registry::global(),
            Arc::new(Notifier::default()),
        )?;
        start_watching(Arc::new(reloader), config, main)
    } else {
        restart_with_reloader(&Invocation::current()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigBuilder, ReloaderKind};
    use crate::registry::LoadError;
    use crate::reloader::WatchSet;
    use std::fs;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    fn stat_config() -> Config {
        ConfigBuilder::default()
            .reloader(ReloaderKind::Stat)
            .poll_interval(Duration::from_millis(10))
            .build()
            .unwrap()
    }

    fn stat_reloader(registry: Arc<Registry>) -> Arc<AnyReloader> {
        let notifier = Arc::new(Notifier::with_reload_action(|_| {}));
        Arc::new(get_reloader(&stat_config(), registry, notifier).unwrap())
    }

    fn binary(args: &[&str]) -> Invocation {
        Invocation {
            executable: "/usr/bin/app".into(),
            options: Vec::new(),
            entry: Entry::Binary,
            args: args.iter().map(OsString::from).collect(),
        }
    }

    #[test]
    fn relaunches_while_reload_is_requested() {
        let mut codes = vec![3, 3, 3, 7].into_iter();
        let mut spawned = 0;
        let code = restart_with(&binary(&["runserver"]), &mut |_: &Invocation| -> Result<i32> {
            spawned += 1;
            Ok(codes.next().unwrap())
        })
        .unwrap();

        assert_eq!(code, 7);
        assert_eq!(spawned, 4);
    }

    #[test]
    fn exits_with_the_first_other_code() {
        let code = restart_with(&binary(&[]), &mut |_: &Invocation| -> Result<i32> { Ok(0) }).unwrap();
        assert_eq!(code, 0);
    }

    #[test]
    fn spawn_failure_is_reported() {
        let err = restart_with(&binary(&[]), &mut |_: &Invocation| -> Result<i32> {
            Err(io::Error::new(io::ErrorKind::NotFound, "gone").into())
        });
        assert!(err.is_err());
    }

    #[test]
    fn binary_arguments_are_passed_through() {
        assert_eq!(
            binary(&["runserver", "--noreload"]).child_arguments(),
            vec![OsString::from("runserver"), OsString::from("--noreload")]
        );
    }

    #[test]
    fn module_invocation_is_preserved() {
        let argv = vec![OsString::from("/srv/app/__main__.py"), "runserver".into()];
        let invocation = Invocation::interpreted(
            "/usr/bin/python",
            vec!["-Wall".into()],
            &argv,
            Some(("app", Path::new("/srv/app/__main__.py"))),
        )
        .unwrap();

        assert_eq!(invocation.entry, Entry::Module("app".into()));
        assert_eq!(
            invocation.child_arguments(),
            vec![
                OsString::from("-Wall"),
                "-m".into(),
                "app".into(),
                "runserver".into()
            ]
        );
    }

    #[test]
    fn script_invocation() {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("manage.py");
        fs::write(&script, "").unwrap();
        let argv = vec![script.clone().into_os_string(), "runserver".into()];

        let invocation =
            Invocation::interpreted("/usr/bin/python", Vec::new(), &argv, None).unwrap();

        assert_eq!(
            invocation.child_arguments(),
            vec![script.into_os_string(), "runserver".into()]
        );
    }

    #[test]
    fn exe_launcher_runs_directly() {
        let dir = TempDir::new().unwrap();
        let exe = dir.path().join("manage.exe");
        fs::write(&exe, "").unwrap();
        let argv = vec![dir.path().join("manage").into_os_string(), "runserver".into()];

        let invocation =
            Invocation::interpreted("/usr/bin/python", vec!["-O".into()], &argv, None).unwrap();

        assert_eq!(invocation.executable, exe);
        assert_eq!(invocation.child_arguments(), vec![OsString::from("runserver")]);
    }

    #[test]
    fn script_launcher_is_found() {
        let dir = TempDir::new().unwrap();
        let launcher = dir.path().join("manage-script.py");
        fs::write(&launcher, "").unwrap();
        let argv = vec![dir.path().join("manage").into_os_string()];

        let invocation =
            Invocation::interpreted("/usr/bin/python", Vec::new(), &argv, None).unwrap();

        assert_eq!(invocation.entry, Entry::Script(launcher));
    }

    #[test]
    fn missing_script_is_an_error() {
        let dir = TempDir::new().unwrap();
        let argv = vec![dir.path().join("missing.py").into_os_string()];
        let err = Invocation::interpreted("/usr/bin/python", Vec::new(), &argv, None).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn ready_is_one_shot() {
        let ready = Ready::new();
        ready.set();
        ready.abandon();
        assert!(ready.is_set());
        assert!(ready.wait());
    }

    #[test]
    fn abandoned_before_ready() {
        let ready = Ready::new();
        drop(AbandonOnDrop(ready.clone()));
        assert!(!ready.wait());
        assert!(!ready.is_set());
    }

    #[test]
    fn entry_returning_early_skips_watching() {
        let reloader = stat_reloader(Arc::new(Registry::default()));
        let code = start_watching(Arc::clone(&reloader), &stat_config(), |_| 5).unwrap();

        assert_eq!(code, 5);
        match &*reloader {
            AnyReloader::Stat(stat) => assert_eq!(stat.state(), crate::stat::State::Idle),
            AnyReloader::Native(_) => unreachable!(),
        }
    }

    #[test]
    fn panicking_entry_is_reported() {
        let reloader = stat_reloader(Arc::new(Registry::default()));
        let code = start_watching(reloader, &stat_config(), |_| panic!("boom")).unwrap();
        assert_eq!(code, 1);
    }

    #[test]
    fn watches_after_ready_until_stopped() {
        let reloader = stat_reloader(Arc::new(Registry::default()));
        let started = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&started);
        reloader
            .watches()
            .notifier()
            .on_started(move |_: &WatchSet| {
                counter.fetch_add(1, Ordering::SeqCst);
            });

        let code = start_watching(Arc::clone(&reloader), &stat_config(), |supervised| {
            supervised.ready();
            thread::sleep(Duration::from_millis(50));
            supervised.reloader().stop();
            0
        })
        .unwrap();

        assert_eq!(code, 0);
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert!(reloader.should_stop());
    }

    #[test]
    fn replayed_load_error_skips_main() {
        let registry = Arc::new(Registry::default());
        let _ = registry.check_errors(|| -> std::result::Result<(), LoadError> {
            Err(LoadError::new("SyntaxError", "invalid syntax").with_file_name("/srv/app/views.py"))
        });
        let reloader = stat_reloader(Arc::clone(&registry));
        let called = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&called);

        let watcher = Arc::clone(&reloader);
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            watcher.stop();
        });

        let code = start_watching(Arc::clone(&reloader), &stat_config(), move |supervised| {
            flag.store(true, Ordering::SeqCst);
            supervised.ready();
            0
        })
        .unwrap();
        stopper.join().unwrap();

        assert_eq!(code, 0);
        assert!(!called.load(Ordering::SeqCst));
        assert_eq!(registry.error_files(), vec![PathBuf::from("/srv/app/views.py")]);
    }

    #[test]
    fn resubscriber_only_for_native() {
        let reloader = stat_reloader(Arc::new(Registry::default()));
        let supervised = Supervised {
            ready: Ready::new(),
            reloader,
        };
        assert!(supervised.resubscriber().is_none());
    }
}
