//! Configuration for the reloader.
//!
//! The [`Config`] struct is not constructable, use [`ConfigBuilder`].
//!
//! # Examples
//!
//! ```
//! # use autoreload::config::{ConfigBuilder, ReloaderKind};
//! ConfigBuilder::default()
//!     .reloader(ReloaderKind::Stat)
//!     .extra_files(vec!["/srv/app/settings.toml".into()])
//!     .build()
//!     .expect("mission failed");
//! ```

use std::path::PathBuf;
use std::time::Duration;

/// Which change detection strategy to use.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReloaderKind {
    /// Native events when the platform supports them, polling otherwise.
    Auto,
    /// Always poll modification times.
    Stat,
    /// Ask for native events; falls back to polling with a warning.
    Native,
}

impl Default for ReloaderKind {
    fn default() -> Self {
        ReloaderKind::Auto
    }
}

/// Arguments to the reloader
#[derive(Builder, Clone, Debug)]
#[builder(setter(into))]
#[builder(build_fn(validate = "Self::validate"))]
pub struct Config {
    /// Change detection strategy.
    #[builder(default)]
    pub reloader: ReloaderKind,
    /// Sleep between two polls of the stat reloader.
    #[builder(default = "Duration::from_secs(1)")]
    pub poll_interval: Duration,
    /// Longest the native reloader blocks on the event source before it
    /// checks whether it should stop.
    #[builder(default = "Duration::from_secs(1)")]
    pub event_timeout: Duration,
    /// Window in which native events are merged.
    #[builder(default = "Duration::from_millis(50)")]
    pub debounce: Duration,
    /// Files to watch in addition to loaded modules. Absolute.
    #[builder(default)]
    pub extra_files: Vec<PathBuf>,
    /// Directory and glob pattern pairs. Directories are absolute.
    #[builder(default)]
    pub globs: Vec<(PathBuf, String)>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            reloader: ReloaderKind::default(),
            poll_interval: Duration::from_secs(1),
            event_timeout: Duration::from_secs(1),
            debounce: Duration::from_millis(50),
            extra_files: Vec::new(),
            globs: Vec::new(),
        }
    }
}

impl ConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        if self.poll_interval.map_or(false, |d| d == Duration::from_secs(0)) {
            return Err("poll_interval must not be zero".into());
        }

        if self.event_timeout.map_or(false, |d| d == Duration::from_secs(0)) {
            return Err("event_timeout must not be zero".into());
        }

        if let Some(file) = self
            .extra_files
            .as_ref()
            .and_then(|files| files.iter().find(|f| f.is_relative()))
        {
            return Err(format!("{} must be absolute.", file.display()));
        }

        if let Some((dir, _)) = self
            .globs
            .as_ref()
            .and_then(|globs| globs.iter().find(|(d, _)| d.is_relative()))
        {
            return Err(format!("{} must be absolute.", dir.display()));
        }

        Ok(())
    }
}
