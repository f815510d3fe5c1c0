use anyhow::Context;
use common::Summary;
use remote::protocol::{ControlMessage, Error, FileDescriptor, Step};
use remote::streams::ScpStream;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tracing::instrument;

use crate::walk_state::{DirectoryId, WalkState};

/// Knobs for a transfer; one value is shared by every file of a session.
#[derive(Debug, Clone, Copy)]
pub struct Settings {
    /// Send a `T` line before every `C` and `D` line
    pub preserve_times: bool,
    /// Follow symbolic links instead of rejecting them
    pub dereference: bool,
    /// Read buffer size used when streaming file content
    pub chunk_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            preserve_times: false,
            dereference: false,
            chunk_size: 128 * 1024,
        }
    }
}

async fn stat(path: &std::path::Path, dereference: bool) -> Result<std::fs::Metadata, Error> {
    let metadata = if dereference {
        tokio::fs::metadata(path).await
    } else {
        tokio::fs::symlink_metadata(path).await
    };
    metadata.map_err(|source| Error::LocalIo {
        action: "read metadata of",
        path: path.to_path_buf(),
        source,
    })
}

async fn send_timestamp_if_needed<W, R>(
    stream: &mut ScpStream<W, R>,
    descriptor: &FileDescriptor,
    settings: &Settings,
) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    if settings.preserve_times {
        stream
            .send_and_ack(&ControlMessage::timestamp(descriptor), &descriptor.path)
            .await?;
    }
    Ok(())
}

/// Sends a single file: optional `T` line, `C` line, content, and the terminating NUL.
///
/// Exactly `descriptor.size` bytes are taken from `content`. A source that yields fewer bytes
/// fails with [`Error::SizeMismatch`]; at that point the sink is still waiting for the rest of
/// the announced content and the session cannot be reused.
#[instrument(skip(stream, descriptor, content, settings), fields(path = ?descriptor.path, size = descriptor.size))]
pub async fn send_file<W, R, C>(
    stream: &mut ScpStream<W, R>,
    descriptor: &FileDescriptor,
    content: C,
    settings: &Settings,
) -> Result<Summary, Error>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
    C: AsyncRead + Unpin,
{
    let path = descriptor.path.as_path();
    send_timestamp_if_needed(stream, descriptor, settings).await?;
    stream
        .send_and_ack(&ControlMessage::copy_file(descriptor), path)
        .await?;
    // buffer is capped at file size to avoid over-allocation for small files
    let file_size = usize::try_from(descriptor.size).unwrap_or(usize::MAX);
    let buffer_size = settings.chunk_size.min(file_size).max(1);
    let mut content = tokio::io::BufReader::with_capacity(buffer_size, content.take(descriptor.size));
    let sent = stream.send_data(&mut content, path).await?;
    if sent != descriptor.size {
        return Err(Error::SizeMismatch {
            path: path.to_path_buf(),
            declared: descriptor.size,
            sent,
        });
    }
    stream.complete_and_ack(path).await?;
    tracing::info!("Sent file: {:?} ({} bytes)", path, sent);
    Ok(Summary {
        bytes_sent: sent,
        files_sent: 1,
        ..Default::default()
    })
}

async fn send_local_file<W, R>(
    stream: &mut ScpStream<W, R>,
    descriptor: &FileDescriptor,
    settings: &Settings,
) -> Result<Summary, Error>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    // open the file BEFORE announcing it, the sink can't be told to skip it afterwards
    let file = tokio::fs::File::open(&descriptor.path)
        .await
        .map_err(|source| Error::LocalIo {
            action: "open",
            path: descriptor.path.clone(),
            source,
        })?;
    send_file(stream, descriptor, file, settings).await
}

async fn enter_directory<W, R>(
    stream: &mut ScpStream<W, R>,
    descriptor: &FileDescriptor,
    settings: &Settings,
) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    send_timestamp_if_needed(stream, descriptor, settings).await?;
    stream
        .send_and_ack(
            &ControlMessage::enter_directory(descriptor),
            &descriptor.path,
        )
        .await?;
    tracing::info!("Entered directory: {:?}", descriptor.path);
    Ok(())
}

/// Lists the children of `dir`: regular files first, then everything else, each group ordered
/// by file name bytes.
async fn list_children(
    dir: &std::path::Path,
    settings: &Settings,
) -> Result<Vec<(std::path::PathBuf, std::fs::Metadata)>, Error> {
    let read_dir_error = |source| Error::LocalIo {
        action: "read directory",
        path: dir.to_path_buf(),
        source,
    };
    let mut entries = tokio::fs::read_dir(dir).await.map_err(read_dir_error)?;
    let mut children = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(read_dir_error)? {
        let entry_path = entry.path();
        let metadata = stat(&entry_path, settings.dereference).await?;
        children.push((entry_path, metadata));
    }
    children.sort_by(|(path_a, md_a), (path_b, md_b)| {
        md_b.is_file()
            .cmp(&md_a.is_file())
            .then_with(|| path_a.file_name().cmp(&path_b.file_name()))
    });
    Ok(children)
}

/// A node of a directory tree, in the order it goes on the wire.
#[derive(Debug)]
struct PlannedNode {
    descriptor: FileDescriptor,
    /// Path components below the walk root
    depth: usize,
    id: DirectoryId,
}

/// Walks the tree under `root` without sending anything.
///
/// Every name is validated and every node's type checked up front, so a tree that can't be
/// sent as a whole fails before the first line reaches the sink. Directories reached again
/// through one of their own descendants fail with [`Error::DirectoryCycle`].
async fn plan_tree(
    root: &std::path::Path,
    root_metadata: std::fs::Metadata,
    settings: &Settings,
) -> Result<Vec<PlannedNode>, Error> {
    let mut ancestors = WalkState::new();
    let mut plan = Vec::new();
    // nodes still to visit together with their depth below the root, next one on top
    let mut pending = vec![(root.to_path_buf(), root_metadata, 0usize)];
    while let Some((path, metadata, depth)) = pending.pop() {
        while ancestors.leave_before(depth).is_some() {}
        let descriptor = FileDescriptor::from_metadata(&path, &metadata)?;
        let id = DirectoryId::of(&metadata);
        if metadata.is_dir() {
            if let Some(ancestor) = ancestors.ancestor(id) {
                return Err(Error::DirectoryCycle {
                    path,
                    ancestor: ancestor.path.clone(),
                });
            }
            let children = list_children(&path, settings).await?;
            ancestors.enter(depth, &path, id);
            for (child_path, child_metadata) in children.into_iter().rev() {
                pending.push((child_path, child_metadata, depth + 1));
            }
        } else if !metadata.is_file() {
            return Err(Error::UnsupportedFileType { path });
        }
        plan.push(PlannedNode {
            descriptor,
            depth,
            id,
        });
    }
    tracing::debug!("planned {} nodes under {:?}", plan.len(), root);
    Ok(plan)
}

/// Sends the directory tree rooted at `root`, depth first.
///
/// The whole tree is listed and checked before anything is written. Directory levels are
/// then bracketed with `D`/`E` lines; every line is acked before the next one is written.
/// An error while sending aborts the walk without closing the levels still open, the session
/// must be discarded afterwards.
#[instrument(skip(stream, settings))]
pub async fn send_directory<W, R>(
    stream: &mut ScpStream<W, R>,
    root: &std::path::Path,
    settings: &Settings,
) -> Result<Summary, Error>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    let root_metadata = stat(root, settings.dereference).await?;
    if !root_metadata.is_dir() {
        return Err(Error::UnsupportedFileType {
            path: root.to_path_buf(),
        });
    }
    let plan = plan_tree(root, root_metadata, settings).await?;
    let mut state = WalkState::new();
    let mut summary = Summary::default();
    for node in &plan {
        while let Some(finished) = state.leave_before(node.depth) {
            stream
                .send_and_ack(&ControlMessage::LeaveDirectory, &finished.path)
                .await?;
            tracing::debug!("Left directory: {:?}", finished.path);
        }
        if node.descriptor.is_dir {
            enter_directory(stream, &node.descriptor, settings).await?;
            state.enter(node.depth, &node.descriptor.path, node.id);
            summary.directories_sent += 1;
        } else {
            summary += send_local_file(stream, &node.descriptor, settings).await?;
        }
    }
    while let Some(finished) = state.leave() {
        stream
            .send_and_ack(&ControlMessage::LeaveDirectory, &finished.path)
            .await?;
        tracing::debug!("Left directory: {:?}", finished.path);
    }
    tracing::info!("Sent directory: {:?}", root);
    Ok(summary)
}

/// One connected sink and the files sent to it.
///
/// A session may send several sources in a row; nothing but the [`Summary`] carries over from
/// one [`Session::send`] to the next. After any error the session must be dropped.
#[derive(Debug)]
pub struct Session<W, R> {
    stream: ScpStream<W, R>,
    settings: Settings,
    summary: Summary,
}

impl<W: AsyncWrite + Unpin, R: AsyncRead + Unpin> Session<W, R> {
    pub fn new(stream: ScpStream<W, R>, settings: Settings) -> Self {
        Self {
            stream,
            settings,
            summary: Summary::default(),
        }
    }

    /// Consumes the status byte a freshly started `scp -t` sends once it is ready.
    pub async fn wait_ready(&mut self) -> Result<(), Error> {
        self.stream
            .expect_ack(Step::Handshake, std::path::Path::new(""))
            .await?;
        tracing::debug!("sink is ready");
        Ok(())
    }

    /// Sends a regular file or a whole directory tree.
    #[instrument(skip(self))]
    pub async fn send(&mut self, path: &std::path::Path) -> Result<Summary, Error> {
        // "." and ".." have no usable base name, the sink needs the real one
        let path = if path.file_name().is_none() {
            tokio::fs::canonicalize(path)
                .await
                .map_err(|source| Error::LocalIo {
                    action: "resolve",
                    path: path.to_path_buf(),
                    source,
                })?
        } else {
            path.to_path_buf()
        };
        let metadata = stat(&path, self.settings.dereference).await?;
        let summary = if metadata.is_file() {
            let descriptor = FileDescriptor::from_metadata(&path, &metadata)?;
            send_local_file(&mut self.stream, &descriptor, &self.settings).await?
        } else if metadata.is_dir() {
            send_directory(&mut self.stream, &path, &self.settings).await?
        } else {
            return Err(Error::UnsupportedFileType { path });
        };
        self.summary += summary;
        Ok(summary)
    }

    /// Totals across every successful [`Session::send`] so far.
    pub fn summary(&self) -> Summary {
        self.summary
    }

    /// Shuts the write side down so the sink sees end of input.
    pub async fn close(&mut self) -> Result<(), Error> {
        self.stream
            .shutdown()
            .await
            .map_err(|source| Error::Transport {
                step: Step::Shutdown,
                path: std::path::PathBuf::new(),
                source,
            })
    }

    /// Closes the write side so the sink can exit, returning the session totals.
    pub async fn finish(mut self) -> Result<Summary, Error> {
        self.close().await?;
        Ok(self.summary)
    }

    pub fn into_inner(self) -> ScpStream<W, R> {
        self.stream
    }
}

async fn send_all<W: AsyncWrite + Unpin, R: AsyncRead + Unpin>(
    session: &mut Session<W, R>,
    sources: &[std::path::PathBuf],
) -> anyhow::Result<()> {
    session
        .wait_ready()
        .await
        .context("Remote scp sink did not become ready")?;
    for src in sources {
        session
            .send(src)
            .await
            .with_context(|| format!("Failed to send {src:?}"))?;
    }
    Ok(())
}

/// Waits for the sink and sends every source in order.
///
/// The write side is shut down whether or not a send fails, so the sink reaches end of input
/// and exits on its own; its diagnostics can then be collected by the caller. The transfer
/// error wins over a failure to shut down.
pub async fn transfer<W: AsyncWrite + Unpin, R: AsyncRead + Unpin>(
    session: &mut Session<W, R>,
    sources: &[std::path::PathBuf],
) -> anyhow::Result<Summary> {
    let sent = send_all(session, sources).await;
    let closed = session.close().await;
    match sent {
        Ok(()) => {
            closed.context("Failed to close the stream to the scp sink")?;
            Ok(session.summary())
        }
        Err(error) => {
            if let Err(close_error) = closed {
                tracing::debug!("could not close the stream after a failed transfer: {close_error}");
            }
            Err(error)
        }
    }
}
