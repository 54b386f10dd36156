use notify::op::{self, Op};
use std::fmt;
use std::path::{Path, PathBuf};

/// What happened to a watched file.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum ChangeKind {
    Created,
    Modified,
    Metadata,
    Removed,
    Renamed,
    Unknown,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            ChangeKind::Created => "created",
            ChangeKind::Modified => "modified",
            ChangeKind::Metadata => "metadata changed",
            ChangeKind::Removed => "removed",
            ChangeKind::Renamed => "renamed",
            ChangeKind::Unknown => "changed",
        })
    }
}

/// A path and the raw `notify` operation reported for it
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct PathOp {
    pub path: PathBuf,
    pub op: Option<Op>,
}

impl PathOp {
    pub fn new(path: &Path, op: Option<Op>) -> Self {
        Self {
            path: path.to_path_buf(),
            op,
        }
    }

    /// Whether the operation can change what a reload would see.
    ///
    /// Unknown operations count, a rescan means events were dropped.
    pub fn is_relevant(&self) -> bool {
        self.op.map_or(true, |op_| {
            op_.intersects(
                op::WRITE | op::CLOSE_WRITE | op::CHMOD | op::REMOVE | op::RENAME | op::CREATE
                    | op::RESCAN,
            )
        })
    }

    pub fn kind(&self) -> ChangeKind {
        match self.op {
            Some(op_) if Self::is_remove(op_) => ChangeKind::Removed,
            Some(op_) if Self::is_rename(op_) => ChangeKind::Renamed,
            Some(op_) if Self::is_create(op_) => ChangeKind::Created,
            Some(op_) if Self::is_write(op_) => ChangeKind::Modified,
            Some(op_) if Self::is_meta(op_) => ChangeKind::Metadata,
            _ => ChangeKind::Unknown,
        }
    }

    pub fn is_create(op_: Op) -> bool {
        op_.contains(op::CREATE)
    }

    pub fn is_remove(op_: Op) -> bool {
        op_.contains(op::REMOVE)
    }

    pub fn is_rename(op_: Op) -> bool {
        op_.contains(op::RENAME)
    }

    pub fn is_write(op_: Op) -> bool {
        op_.intersects(op::WRITE | op::CLOSE_WRITE)
    }

    pub fn is_meta(op_: Op) -> bool {
        op_.contains(op::CHMOD)
    }
}
