use crate::registry::{LoadError, LoadFailure};
use std::{error::Error as StdError, fmt, io, path::PathBuf};

pub type Result<T> = ::std::result::Result<T, Error>;

pub enum Error {
    Config(String),
    Glob(globset::Error),
    Io(io::Error),
    Load(LoadError),
    Notify(notify::Error),
    NotAbsolute(PathBuf),
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            Error::Glob(err) => Some(err),
            _ => None,
        }
    }
}

impl From<globset::Error> for Error {
    fn from(err: globset::Error) -> Self {
        Error::Glob(err)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<notify::Error> for Error {
    fn from(err: notify::Error) -> Self {
        match err {
            notify::Error::Io(err) => Error::Io(err),
            other => Error::Notify(other),
        }
    }
}

impl From<String> for Error {
    fn from(err: String) -> Self {
        Error::Config(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} error: {}",
            match self {
                Error::NotAbsolute(_) => "Path",
                Error::Config(_) => "Config",
                Error::Glob(_) => "Globset",
                Error::Io(_) => "I/O",
                Error::Load(err) => err.kind(),
                Error::Notify(_) => "Notify",
            },
            match self {
                Error::Config(msg) => msg.clone(),
                Error::Glob(err) => format!("{}", err),
                Error::Io(err) => format!("{}", err),
                Error::Load(err) => format!("{}", err),
                Error::Notify(err) => format!("{}", err),
                Error::NotAbsolute(path) => format!("{} must be absolute.", path.display()),
            }
        )
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
