//! Autoreload: the library
//!
//! Relaunches a development process whenever the files it loaded, or any
//! file it asked to watch, change on disk. The process runs as a child of
//! itself; the child exits with [`RELOAD_EXIT_CODE`] when a change needs a
//! fresh start and the parent starts it again.
//!
//! Changes are detected either by polling modification times
//! ([`stat::StatReloader`]) or from native file events
//! ([`native::NotifyReloader`]). See [`run_with_reloader`] to get started.

#![deny(unsafe_code)]
#![allow(clippy::default_trait_access, clippy::cognitive_complexity)]

#[macro_use]
extern crate clap;
#[macro_use]
extern crate derive_builder;
#[macro_use]
extern crate log;
#[macro_use]
extern crate lazy_static;

pub mod cli;
pub mod config;
pub mod error;
pub mod native;
pub mod notifier;
pub mod pathop;
pub mod paths;
pub mod process;
pub mod registry;
pub mod reloader;
pub mod run;
pub mod signal;
pub mod stat;
mod terminal;

pub use crate::reloader::{get_reloader, Reloader};
pub use crate::run::{run_with_reloader, RELOAD_EXIT_CODE, RUN_MAIN};
