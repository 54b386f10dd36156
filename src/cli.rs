use crate::config::{Config, ConfigBuilder, ReloaderKind};
use crate::error::Result;
use clap::{App, AppSettings, Arg, ArgMatches, Error};
use std::env;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

#[derive(Debug)]
pub struct Args {
    pub cmd: Vec<String>,
    pub config: Config,
    pub no_shell: bool,
    pub debug: bool,
}

pub fn app<'a, 'b>() -> App<'a, 'b> {
    App::new("autoreload")
        .version(crate_version!())
        .about("Run a command and start it over when watched files change")
        .setting(AppSettings::TrailingVarArg)
        .arg(Arg::with_name("command")
                 .help("Command to supervise")
                 .multiple(true)
                 .required(true))
        .arg(Arg::with_name("watch")
                 .help("Watch a specific file")
                 .short("w")
                 .long("watch")
                 .number_of_values(1)
                 .multiple(true)
                 .takes_value(true)
                 .value_name("file"))
        .arg(Arg::with_name("glob")
                 .help("Watch files matching the pattern, e.g. 'src/**/*.rs'")
                 .short("g")
                 .long("glob")
                 .number_of_values(1)
                 .multiple(true)
                 .takes_value(true)
                 .value_name("pattern"))
        .arg(Arg::with_name("poll")
                 .help("Forces polling mode")
                 .long("force-poll")
                 .takes_value(true)
                 .value_name("interval")
                 .conflicts_with("native"))
        .arg(Arg::with_name("native")
                 .help("Use native file events, falling back to polling if unavailable")
                 .long("native"))
        .arg(Arg::with_name("no-shell")
                 .help("Do not wrap command in 'sh -c' resp. 'cmd.exe /C'")
                 .short("n")
                 .long("no-shell"))
        .arg(Arg::with_name("verbose")
                 .help("Print debugging messages to stderr")
                 .short("v")
                 .long("verbose"))
}

pub fn get_args() -> Args {
    let matches = app().get_matches();
    let cwd = env::current_dir().unwrap_or_else(|err| {
        Error::with_description(&err.to_string(), clap::ErrorKind::Io).exit()
    });

    from_matches(&matches, &cwd)
        .unwrap_or_else(|err| Error::value_validation_auto(err.to_string()).exit())
}

pub fn from_matches(args: &ArgMatches, cwd: &Path) -> Result<Args> {
    let cmd = values_t!(args.values_of("command"), String).unwrap_or_default();

    let extra_files = values_t!(args.values_of("watch"), String)
        .unwrap_or_default()
        .into_iter()
        .map(|file| cwd.join(file))
        .collect::<Vec<_>>();

    let globs = values_t!(args.values_of("glob"), String)
        .unwrap_or_default()
        .iter()
        .map(|glob| split_glob(cwd, glob))
        .collect::<Vec<_>>();

    let mut builder = ConfigBuilder::default();
    builder.extra_files(extra_files).globs(globs);

    if args.occurrences_of("poll") > 0 {
        let interval = value_t!(args.value_of("poll"), u64).unwrap_or_else(|e| e.exit());
        builder
            .reloader(ReloaderKind::Stat)
            .poll_interval(Duration::from_millis(interval));
    } else if args.is_present("native") {
        builder.reloader(ReloaderKind::Native);
    }

    Ok(Args {
        cmd,
        config: builder.build()?,
        no_shell: args.is_present("no-shell"),
        debug: args.is_present("verbose"),
    })
}

/// Split a glob into the directory to watch and the pattern below it.
///
/// The directory is everything before the first component with a glob
/// metacharacter, resolved against `cwd`.
pub fn split_glob(cwd: &Path, glob: &str) -> (PathBuf, String) {
    let mut directory = cwd.to_path_buf();
    let mut pattern = Vec::new();

    for component in Path::new(glob).components() {
        if !pattern.is_empty() {
            pattern.push(component.as_os_str().to_string_lossy().into_owned());
            continue;
        }

        let text = component.as_os_str().to_string_lossy();
        match component {
            Component::Normal(_) if text.contains(|c| "*?[{".contains(c)) => {
                pattern.push(text.into_owned())
            }
            _ => directory.push(component),
        }
    }

    // A glob without metacharacters names a single file
    if pattern.is_empty() {
        if let Some(name) = directory.file_name().map(|n| n.to_string_lossy().into_owned()) {
            directory.pop();
            pattern.push(name);
        }
    }

    (directory, pattern.join("/"))
}
