//! Tracks which directory levels are open while a tree is walked.
//!
//! # Overview
//!
//! Every `D` line sent to the sink opens a directory level that must later be closed with an
//! `E` line. `WalkState` keeps a stack of the open levels, each tagged with its depth (the
//! number of path components between the walk root and the directory, the root being depth 0)
//! and the device/inode pair identifying it.
//!
//! Depth is threaded through the traversal explicitly; it never depends on how the path is
//! spelled.
//!
//! # Closing levels
//!
//! Before the walker handles a node at depth `d`, every open level with depth `>= d` belongs to
//! a subtree that is finished and must be left. [`WalkState::leave_before`] pops those levels
//! one at a time (innermost first) so the caller can send one acked `E` per level. When the
//! traversal is exhausted [`WalkState::leave`] drains whatever is still open, root last.
//!
//! # Loops
//!
//! When symbolic links are followed a directory can show up inside itself. The open levels are
//! exactly the ancestors of the node being visited, so [`WalkState::ancestor`] finds such a loop
//! before the directory is entered a second time. The same directory reached twice through
//! unrelated branches is not a loop and is walked both times.

use std::os::unix::fs::MetadataExt;

/// Device and inode pair identifying a directory independently of the path used to reach it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DirectoryId {
    pub dev: u64,
    pub ino: u64,
}

impl DirectoryId {
    pub fn of(metadata: &std::fs::Metadata) -> Self {
        Self {
            dev: metadata.dev(),
            ino: metadata.ino(),
        }
    }
}

/// A directory level for which `D` was sent and `E` was not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenDirectory {
    pub depth: usize,
    pub path: std::path::PathBuf,
    pub id: DirectoryId,
}

/// Stack of open directory levels; its length always equals the number of unmatched `D` lines.
#[derive(Debug, Default)]
pub struct WalkState {
    open: Vec<OpenDirectory>,
}

impl WalkState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of directory levels currently open.
    pub fn open_levels(&self) -> usize {
        self.open.len()
    }

    /// Records that the directory at `path` was entered at `depth`.
    pub fn enter(&mut self, depth: usize, path: &std::path::Path, id: DirectoryId) {
        debug_assert_eq!(
            depth,
            self.open.len(),
            "directory {path:?} entered at depth {depth} with {} levels open",
            self.open.len()
        );
        self.open.push(OpenDirectory {
            depth,
            path: path.to_path_buf(),
            id,
        });
        tracing::trace!("entered {:?} at depth {}", path, depth);
    }

    /// Open level that is the same directory as `id`, if any.
    pub fn ancestor(&self, id: DirectoryId) -> Option<&OpenDirectory> {
        self.open.iter().find(|open| open.id == id)
    }

    /// Pops the innermost level if it must be closed before visiting a node at `depth`.
    pub fn leave_before(&mut self, depth: usize) -> Option<OpenDirectory> {
        if self.open.last()?.depth >= depth {
            self.open.pop()
        } else {
            None
        }
    }

    /// Pops the innermost open level.
    pub fn leave(&mut self) -> Option<OpenDirectory> {
        self.open.pop()
    }
}
