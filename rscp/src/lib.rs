//! Sending side of the rcp/scp protocol - `rscp`
//!
//! `rscp` pushes local files and directory trees to a remote host by starting `scp -t` (the
//! "sink") over SSH and speaking the classic line based protocol to it. The remote host needs
//! nothing but a stock `scp` binary.
//!
//! # Usage
//!
//! ```bash
//! # Copy a single file into the remote home directory
//! rscp report.pdf user@host:
//!
//! # Copy a tree, keeping modification and access times
//! rscp -r -p ./photos user@host:2222:/srv/backup/
//!
//! # Several sources require the target to be an existing directory
//! rscp a.txt b.txt host:/tmp/inbox
//! ```
//!
//! # How a transfer proceeds
//!
//! 1. The sink acknowledges that it is ready with a single `0x00` byte.
//! 2. Every file is announced with a `C` line (optionally preceded by a `T` line carrying its
//!    times), followed by its content and a NUL byte.
//! 3. Directories are entered with `D` and left with `E`; the tree is walked depth first,
//!    regular files before subdirectories, names in byte order.
//! 4. The sink answers every line and every NUL with one status byte. A non-zero status aborts
//!    the whole transfer.
//!
//! # Symbolic links
//!
//! By default symbolic links are refused with an error. With `--dereference` (`-L`) the link
//! target is sent in its place, under the name of the link.
//!
//! # Modules
//!
//! - [`source`]: file and directory senders and the [`source::Session`] driving them
//! - [`walk_state`]: open directory levels during a walk
//! - [`path`]: parsing of `[user@]host[:port]:path` destinations

pub mod path;
pub mod source;
pub mod walk_state;
