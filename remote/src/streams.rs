use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::instrument;

use crate::protocol::{AckResult, ControlMessage, Error, Step};

/// Bounds for reading the optional message that follows a non-zero status byte.
#[derive(Debug, Clone, Copy)]
pub struct AckSettings {
    /// How long to wait for the message line before giving up on it
    pub message_timeout: std::time::Duration,
    /// Longest message accepted; anything beyond is left unread
    pub max_message_len: usize,
}

impl Default for AckSettings {
    fn default() -> Self {
        Self {
            message_timeout: std::time::Duration::from_secs(1),
            max_message_len: 1024,
        }
    }
}

/// Read side of the protocol: status bytes sent back by the sink.
#[derive(Debug)]
pub struct AckChannel<R> {
    reader: R,
    settings: AckSettings,
}

impl<R: AsyncRead + Unpin> AckChannel<R> {
    pub fn new(reader: R, settings: AckSettings) -> Self {
        Self { reader, settings }
    }

    /// Reads a single status byte.
    ///
    /// An I/O error (including EOF) means the transport is gone and is returned as such; a
    /// rejection by the peer is a successful read of [`AckResult::Error`].
    #[instrument(level = "trace", skip(self))]
    pub async fn read_ack(&mut self) -> std::io::Result<AckResult> {
        let code = self.reader.read_u8().await?;
        if code == 0 {
            tracing::trace!("ack ok");
            return Ok(AckResult::Ok);
        }
        let message = self.read_message().await;
        tracing::debug!("ack error {code}: {message:?}");
        Ok(AckResult::Error { code, message })
    }

    // peers usually follow a non-zero status with a message line, but nothing forces them to
    async fn read_message(&mut self) -> String {
        let mut line = Vec::new();
        let max_len = self.settings.max_message_len;
        let reader = &mut self.reader;
        let read_line = async {
            while line.len() < max_len {
                match reader.read_u8().await {
                    Ok(b'\n') | Err(_) => break,
                    Ok(byte) => line.push(byte),
                }
            }
        };
        if tokio::time::timeout(self.settings.message_timeout, read_line)
            .await
            .is_err()
        {
            tracing::debug!("no complete error message received from peer");
        }
        String::from_utf8_lossy(&line).into_owned()
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

/// Write side paired with its [`AckChannel`].
///
/// Every control line goes through [`ScpStream::send_and_ack`], which flushes the line and then
/// waits for the sink's status byte, so a write is never issued while an ack is outstanding.
#[derive(Debug)]
pub struct ScpStream<W, R> {
    writer: W,
    acks: AckChannel<R>,
}

/// Type alias for boxed write stream (remote command stdin)
pub type BoxedWrite = Box<dyn AsyncWrite + Unpin + Send>;
/// Type alias for boxed read stream (remote command stdout)
pub type BoxedRead = Box<dyn AsyncRead + Unpin + Send>;
/// Protocol stream over boxed halves
pub type BoxedScpStream = ScpStream<BoxedWrite, BoxedRead>;

fn transport(step: Step, path: &std::path::Path) -> impl FnOnce(std::io::Error) -> Error + '_ {
    move |source| Error::Transport {
        step,
        path: path.to_path_buf(),
        source,
    }
}

impl<W: AsyncWrite + Unpin, R: AsyncRead + Unpin> ScpStream<W, R> {
    pub fn new(writer: W, reader: R, settings: AckSettings) -> Self {
        Self {
            writer,
            acks: AckChannel::new(reader, settings),
        }
    }

    /// Waits for one ack and turns a rejection into [`Error::RemoteRejected`].
    pub async fn expect_ack(&mut self, step: Step, path: &std::path::Path) -> Result<(), Error> {
        self.acks
            .read_ack()
            .await
            .map_err(transport(step, path))?
            .into_result(step, path)
    }

    /// Sends one control line and waits for its ack.
    #[instrument(level = "trace", skip(self))]
    pub async fn send_and_ack(
        &mut self,
        message: &ControlMessage,
        path: &std::path::Path,
    ) -> Result<(), Error> {
        let line = message.encode()?;
        let step = message.step();
        tracing::debug!("sending {:?} for {:?}", line.trim_end(), path);
        self.writer
            .write_all(line.as_bytes())
            .await
            .map_err(transport(step, path))?;
        self.writer.flush().await.map_err(transport(step, path))?;
        self.expect_ack(step, path).await
    }

    /// Streams file content verbatim, returning the number of bytes sent.
    ///
    /// Uses the reader's own buffer, wrap the source in `BufReader::with_capacity` to control
    /// the chunk size. No ack is expected here, see [`ScpStream::complete_and_ack`].
    #[instrument(level = "trace", skip(self, content))]
    pub async fn send_data<C: AsyncBufRead + Unpin>(
        &mut self,
        content: &mut C,
        path: &std::path::Path,
    ) -> Result<u64, Error> {
        let mut sent = 0u64;
        loop {
            let chunk = content.fill_buf().await.map_err(|source| Error::LocalIo {
                action: "read",
                path: path.to_path_buf(),
                source,
            })?;
            if chunk.is_empty() {
                break;
            }
            let len = chunk.len();
            self.writer
                .write_all(chunk)
                .await
                .map_err(transport(Step::Data, path))?;
            content.consume(len);
            sent += len as u64;
        }
        Ok(sent)
    }

    /// Terminates file content with a NUL byte and waits for the final ack.
    pub async fn complete_and_ack(&mut self, path: &std::path::Path) -> Result<(), Error> {
        self.writer
            .write_all(&[0])
            .await
            .map_err(transport(Step::Complete, path))?;
        self.writer
            .flush()
            .await
            .map_err(transport(Step::Complete, path))?;
        self.expect_ack(Step::Complete, path).await
    }

    /// Flushes and closes the write side so the sink sees EOF.
    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        self.writer.shutdown().await
    }

    pub fn into_inner(self) -> (W, R) {
        (self.writer, self.acks.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn stream(acks: &[u8]) -> ScpStream<Vec<u8>, &[u8]> {
        ScpStream::new(Vec::new(), acks, AckSettings::default())
    }

    #[tokio::test]
    #[traced_test]
    async fn zero_byte_is_ok() -> anyhow::Result<()> {
        let mut acks = AckChannel::new(&[0u8][..], AckSettings::default());
        assert_eq!(acks.read_ack().await?, AckResult::Ok);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn non_zero_byte_carries_message() -> anyhow::Result<()> {
        let mut acks = AckChannel::new(
            &b"\x01scp: /nope: No such file or directory\n\x00"[..],
            AckSettings::default(),
        );
        assert_eq!(
            acks.read_ack().await?,
            AckResult::Error {
                code: 1,
                message: "scp: /nope: No such file or directory".to_string()
            }
        );
        // the message line is consumed entirely, the next status byte is intact
        assert_eq!(acks.read_ack().await?, AckResult::Ok);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn missing_message_is_empty() -> anyhow::Result<()> {
        let mut acks = AckChannel::new(&[2u8][..], AckSettings::default());
        assert_eq!(
            acks.read_ack().await?,
            AckResult::Error {
                code: 2,
                message: String::new()
            }
        );
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn silent_peer_does_not_block_forever() -> anyhow::Result<()> {
        let (mut remote, local) = tokio::io::duplex(64);
        remote.write_all(b"\x01partial").await?;
        let mut acks = AckChannel::new(
            local,
            AckSettings {
                message_timeout: std::time::Duration::from_millis(50),
                max_message_len: 1024,
            },
        );
        // `remote` stays open, so only the timeout can end the message read
        let ack = acks.read_ack().await?;
        assert_eq!(
            ack,
            AckResult::Error {
                code: 1,
                message: "partial".to_string()
            }
        );
        drop(remote);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn message_length_is_bounded() -> anyhow::Result<()> {
        let mut data = vec![1u8];
        data.extend(std::iter::repeat_n(b'x', 100));
        data.push(b'\n');
        let mut acks = AckChannel::new(
            &data[..],
            AckSettings {
                message_timeout: std::time::Duration::from_secs(1),
                max_message_len: 10,
            },
        );
        match acks.read_ack().await? {
            AckResult::Error { message, .. } => assert_eq!(message.len(), 10),
            other => panic!("expected error ack, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn closed_stream_is_a_transport_error() {
        let mut acks = AckChannel::new(&[][..], AckSettings::default());
        let error = acks.read_ack().await.unwrap_err();
        assert_eq!(error.kind(), std::io::ErrorKind::UnexpectedEof);
        let mut stream = stream(&[]);
        let result = stream
            .send_and_ack(&ControlMessage::LeaveDirectory, std::path::Path::new("d"))
            .await;
        assert!(matches!(
            result,
            Err(Error::Transport {
                step: Step::LeaveDirectory,
                ..
            })
        ));
    }

    #[tokio::test]
    #[traced_test]
    async fn send_and_ack_writes_one_line_per_ack() -> anyhow::Result<()> {
        let mut stream = stream(&[0, 0]);
        let path = std::path::Path::new("dir");
        stream
            .send_and_ack(
                &ControlMessage::EnterDirectory {
                    mode: 0o755,
                    name: "dir".to_string(),
                },
                path,
            )
            .await?;
        stream
            .send_and_ack(&ControlMessage::LeaveDirectory, path)
            .await?;
        let (written, remaining) = stream.into_inner();
        assert_eq!(written, b"D0755 0 dir\nE\n");
        assert!(remaining.is_empty());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn invalid_name_writes_nothing() {
        let mut stream = stream(&[0]);
        let result = stream
            .send_and_ack(
                &ControlMessage::CopyFile {
                    mode: 0o644,
                    size: 1,
                    name: "a/b".to_string(),
                },
                std::path::Path::new("a/b"),
            )
            .await;
        assert!(matches!(result, Err(Error::InvalidName { .. })));
        let (written, remaining) = stream.into_inner();
        assert!(written.is_empty());
        assert_eq!(remaining, [0u8]);
    }

    #[tokio::test]
    #[traced_test]
    async fn data_is_streamed_verbatim_and_terminated() -> anyhow::Result<()> {
        let mut stream = stream(&[0]);
        let path = std::path::Path::new("blob");
        let payload: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        let mut content = tokio::io::BufReader::with_capacity(333, &payload[..]);
        let sent = stream.send_data(&mut content, path).await?;
        assert_eq!(sent, payload.len() as u64);
        stream.complete_and_ack(path).await?;
        let (written, _) = stream.into_inner();
        assert_eq!(&written[..payload.len()], &payload[..]);
        assert_eq!(written[payload.len()..], [0]);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn rejected_completion_reports_step() {
        let mut stream = stream(b"\x02disk full\n");
        let result = stream
            .complete_and_ack(std::path::Path::new("big.iso"))
            .await;
        match result {
            Err(Error::RemoteRejected {
                step,
                code,
                message,
                ..
            }) => {
                assert_eq!(step, Step::Complete);
                assert_eq!(code, 2);
                assert_eq!(message, "disk full");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }
}
