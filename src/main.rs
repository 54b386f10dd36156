use autoreload::{cli, notifier::FileChanged, process, run_with_reloader, signal};
use std::sync::Arc;

fn init_logger(debug: bool) {
    let mut log_builder = env_logger::Builder::new();
    let level = if debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Warn
    };

    log_builder
        .format(|buf, r| {
            use std::io::Write;
            writeln!(buf, "*** {}", r.args())
        })
        .filter(None, level)
        .init();
}

fn main() {
    let args = cli::get_args();
    init_logger(args.debug);

    let cli::Args {
        cmd,
        config,
        no_shell,
        ..
    } = args;

    let code = run_with_reloader(&config, move |supervised| {
        let child = match process::spawn(&cmd, no_shell) {
            Ok(child) => Arc::new(child),
            Err(err) => {
                log::error!("Unable to start {:?}: {}", cmd, err);
                return 1;
            }
        };

        // Take the command down before the reload exits this process
        let running = Arc::clone(&child);
        supervised.notifier().connect(move |_: &FileChanged| {
            running.terminate();
            false
        });
        let running = Arc::clone(&child);
        signal::add_cleanup(move || running.terminate());

        supervised.ready();
        match child.wait() {
            Ok(status) => process::exit_code(status),
            Err(err) => {
                log::error!("Unable to wait for {:?}: {}", cmd, err);
                1
            }
        }
    });

    match code {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            log::error!("{}", err);
            std::process::exit(1);
        }
    }
}
