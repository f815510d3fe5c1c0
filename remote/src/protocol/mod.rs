//! Wire format of the rcp/scp sink protocol.
//!
//! Every control message is a single `\n`-terminated ASCII line. A file is announced with a `C`
//! line and followed by exactly `size` raw bytes plus a trailing NUL. Directories are bracketed
//! by `D` and `E` lines. An optional `T` line carries timestamps for the `C`/`D` line following
//! it. The sink answers every line (and the NUL that ends a file) with a single status byte.

use std::os::unix::fs::MetadataExt;

/// The protocol step that was in progress when something went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum Step {
    /// Initial readiness ack sent by the sink when it starts
    Handshake,
    Timestamp,
    CopyFile,
    EnterDirectory,
    LeaveDirectory,
    /// Raw file content following a `C` line
    Data,
    /// NUL byte terminating the file content
    Complete,
    /// Closing the write side at the end of a session
    Shutdown,
}

/// Errors produced while sending files over the scp protocol.
///
/// Any of these leaves the session in an unknown protocol state; the caller is expected to tear
/// the remote command down rather than continue.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transport failure during {step} for {path:?}")]
    Transport {
        step: Step,
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("remote rejected {step} for {path:?} (status {code}): {message}")]
    RemoteRejected {
        step: Step,
        path: std::path::PathBuf,
        code: u8,
        message: String,
    },
    #[error("invalid file name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },
    #[error("unsupported file type: {path:?} is neither a regular file nor a directory")]
    UnsupportedFileType { path: std::path::PathBuf },
    #[error("size of {path:?} changed during transfer: declared {declared} bytes, sent {sent}")]
    SizeMismatch {
        path: std::path::PathBuf,
        declared: u64,
        sent: u64,
    },
    #[error("failed to {action} {path:?}")]
    LocalIo {
        action: &'static str,
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("directory {path:?} is the same as its ancestor {ancestor:?}, refusing to follow the loop")]
    DirectoryCycle {
        path: std::path::PathBuf,
        ancestor: std::path::PathBuf,
    },
    #[error("malformed control message {line:?}")]
    MalformedMessage { line: String },
}

/// Checks that `name` can be put on a control line as-is.
pub fn validate_name(name: &str) -> Result<(), Error> {
    let reason = if name.is_empty() {
        "name is empty"
    } else if name.contains('/') {
        "name contains a path separator"
    } else if name.contains('\n') {
        "name contains a newline"
    } else if name == "." || name == ".." {
        "name refers to a relative directory"
    } else {
        return Ok(());
    };
    Err(Error::InvalidName {
        name: name.to_string(),
        reason,
    })
}

/// Local file or directory as announced to the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    pub path: std::path::PathBuf,
    /// Permission bits, masked to 12 bits
    pub mode: u32,
    /// Content length; always 0 for directories
    pub size: u64,
    /// Base name sent on the wire
    pub name: String,
    pub mtime: i64,
    pub atime: i64,
    pub is_dir: bool,
}

impl FileDescriptor {
    /// Describes `path` using its own base name.
    pub fn from_metadata(
        path: &std::path::Path,
        metadata: &std::fs::Metadata,
    ) -> Result<Self, Error> {
        let name = path.file_name().ok_or_else(|| Error::InvalidName {
            name: path.to_string_lossy().into_owned(),
            reason: "path has no base name",
        })?;
        Self::with_name(path, name, metadata)
    }

    /// Describes `path` but announces it under `name`.
    pub fn with_name(
        path: &std::path::Path,
        name: &std::ffi::OsStr,
        metadata: &std::fs::Metadata,
    ) -> Result<Self, Error> {
        let name = name.to_str().ok_or_else(|| Error::InvalidName {
            name: name.to_string_lossy().into_owned(),
            reason: "name is not valid UTF-8",
        })?;
        validate_name(name)?;
        let is_dir = metadata.is_dir();
        Ok(Self {
            path: path.to_path_buf(),
            mode: metadata.mode() & 0o7777,
            size: if is_dir { 0 } else { metadata.len() },
            name: name.to_string(),
            mtime: metadata.mtime(),
            atime: metadata.atime(),
            is_dir,
        })
    }
}

/// One control line of the protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    CopyFile { mode: u32, size: u64, name: String },
    EnterDirectory { mode: u32, name: String },
    Timestamp { mtime: i64, atime: i64 },
    LeaveDirectory,
}

impl ControlMessage {
    pub fn copy_file(descriptor: &FileDescriptor) -> Self {
        ControlMessage::CopyFile {
            mode: descriptor.mode,
            size: descriptor.size,
            name: descriptor.name.clone(),
        }
    }

    pub fn enter_directory(descriptor: &FileDescriptor) -> Self {
        ControlMessage::EnterDirectory {
            mode: descriptor.mode,
            name: descriptor.name.clone(),
        }
    }

    pub fn timestamp(descriptor: &FileDescriptor) -> Self {
        ControlMessage::Timestamp {
            mtime: descriptor.mtime,
            atime: descriptor.atime,
        }
    }

    pub fn step(&self) -> Step {
        match self {
            ControlMessage::CopyFile { .. } => Step::CopyFile,
            ControlMessage::EnterDirectory { .. } => Step::EnterDirectory,
            ControlMessage::Timestamp { .. } => Step::Timestamp,
            ControlMessage::LeaveDirectory => Step::LeaveDirectory,
        }
    }

    /// Formats the message as a newline-terminated line.
    ///
    /// Fails with [`Error::InvalidName`] instead of producing a line the sink would misparse.
    pub fn encode(&self) -> Result<String, Error> {
        let line = match self {
            ControlMessage::CopyFile { mode, size, name } => {
                validate_name(name)?;
                format!("C{:04o} {} {}\n", mode & 0o7777, size, name)
            }
            ControlMessage::EnterDirectory { mode, name } => {
                validate_name(name)?;
                format!("D{:04o} 0 {}\n", mode & 0o7777, name)
            }
            ControlMessage::Timestamp { mtime, atime } => format!("T{mtime} 0 {atime} 0\n"),
            ControlMessage::LeaveDirectory => "E\n".to_string(),
        };
        Ok(line)
    }

    /// Parses a control line, with or without its trailing newline.
    pub fn parse(line: &str) -> Result<Self, Error> {
        let malformed = || Error::MalformedMessage {
            line: line.to_string(),
        };
        let body = line.strip_suffix('\n').unwrap_or(line);
        let mut chars = body.chars();
        let tag = chars.next().ok_or_else(malformed)?;
        let rest = chars.as_str();
        match tag {
            'C' | 'D' => {
                let mut fields = rest.splitn(3, ' ');
                let mode = fields.next().ok_or_else(malformed)?;
                let size = fields.next().ok_or_else(malformed)?;
                let name = fields.next().ok_or_else(malformed)?;
                if mode.len() != 4 {
                    return Err(malformed());
                }
                let mode = u32::from_str_radix(mode, 8).map_err(|_| malformed())?;
                let size = size.parse::<u64>().map_err(|_| malformed())?;
                validate_name(name)?;
                if tag == 'C' {
                    Ok(ControlMessage::CopyFile {
                        mode,
                        size,
                        name: name.to_string(),
                    })
                } else if size == 0 {
                    Ok(ControlMessage::EnterDirectory {
                        mode,
                        name: name.to_string(),
                    })
                } else {
                    Err(malformed())
                }
            }
            'T' => {
                let fields: Vec<&str> = rest.split(' ').collect();
                if fields.len() != 4 {
                    return Err(malformed());
                }
                let mtime = fields[0].parse::<i64>().map_err(|_| malformed())?;
                let atime = fields[2].parse::<i64>().map_err(|_| malformed())?;
                for micros in [fields[1], fields[3]] {
                    micros.parse::<u32>().map_err(|_| malformed())?;
                }
                Ok(ControlMessage::Timestamp { mtime, atime })
            }
            'E' if rest.is_empty() => Ok(ControlMessage::LeaveDirectory),
            _ => Err(malformed()),
        }
    }
}

/// Status returned by the sink for a single control line or file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckResult {
    Ok,
    /// Non-zero status byte; by convention 1 is a warning and 2 a fatal error, but both end the
    /// transfer
    Error { code: u8, message: String },
}

impl AckResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, AckResult::Ok)
    }

    /// Converts a rejection into [`Error::RemoteRejected`] for the given step.
    pub fn into_result(self, step: Step, path: &std::path::Path) -> Result<(), Error> {
        match self {
            AckResult::Ok => Ok(()),
            AckResult::Error { code, message } => Err(Error::RemoteRejected {
                step,
                path: path.to_path_buf(),
                code,
                message,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_copy_file_line() -> Result<(), Error> {
        let message = ControlMessage::CopyFile {
            mode: 0o644,
            size: 1234,
            name: "report.pdf".to_string(),
        };
        assert_eq!(message.encode()?, "C0644 1234 report.pdf\n");
        Ok(())
    }

    #[test]
    fn encodes_directory_lines() -> Result<(), Error> {
        let enter = ControlMessage::EnterDirectory {
            mode: 0o755,
            name: "docs".to_string(),
        };
        assert_eq!(enter.encode()?, "D0755 0 docs\n");
        assert_eq!(ControlMessage::LeaveDirectory.encode()?, "E\n");
        Ok(())
    }

    #[test]
    fn encodes_timestamp_line() -> Result<(), Error> {
        let message = ControlMessage::Timestamp {
            mtime: 1_700_000_000,
            atime: 1_700_000_100,
        };
        assert_eq!(message.encode()?, "T1700000000 0 1700000100 0\n");
        Ok(())
    }

    #[test]
    fn mode_is_zero_padded_and_masked() -> Result<(), Error> {
        let message = ControlMessage::CopyFile {
            mode: 0o100_007,
            size: 0,
            name: "x".to_string(),
        };
        assert_eq!(message.encode()?, "C0007 0 x\n");
        let message = ControlMessage::CopyFile {
            mode: 0o4755,
            size: 0,
            name: "x".to_string(),
        };
        assert_eq!(message.encode()?, "C4755 0 x\n");
        Ok(())
    }

    #[test]
    fn rejects_names_that_would_break_the_line() {
        for name in ["", "a/b", "line\nbreak", ".", ".."] {
            let message = ControlMessage::CopyFile {
                mode: 0o644,
                size: 1,
                name: name.to_string(),
            };
            assert!(
                matches!(message.encode(), Err(Error::InvalidName { .. })),
                "{name:?} should be rejected"
            );
            let message = ControlMessage::EnterDirectory {
                mode: 0o755,
                name: name.to_string(),
            };
            assert!(matches!(message.encode(), Err(Error::InvalidName { .. })));
        }
    }

    #[test]
    fn names_with_spaces_are_allowed() -> Result<(), Error> {
        let message = ControlMessage::CopyFile {
            mode: 0o600,
            size: 3,
            name: "my file.txt".to_string(),
        };
        let line = message.encode()?;
        assert_eq!(line, "C0600 3 my file.txt\n");
        assert_eq!(ControlMessage::parse(&line)?, message);
        Ok(())
    }

    #[test]
    fn copy_file_fields_survive_parsing() -> Result<(), Error> {
        for (mode, size, name) in [
            (0o644, 0, "empty"),
            (0o755, 4096, "run.sh"),
            (0o600, u64::MAX, "id_ed25519"),
        ] {
            let message = ControlMessage::CopyFile {
                mode,
                size,
                name: name.to_string(),
            };
            match ControlMessage::parse(&message.encode()?)? {
                ControlMessage::CopyFile {
                    mode: parsed_mode,
                    size: parsed_size,
                    name: parsed_name,
                } => {
                    assert_eq!(parsed_mode, mode);
                    assert_eq!(parsed_size, size);
                    assert_eq!(parsed_name, name);
                }
                other => panic!("expected CopyFile, got {other:?}"),
            }
        }
        Ok(())
    }

    #[test]
    fn parses_all_message_kinds() -> Result<(), Error> {
        assert_eq!(
            ControlMessage::parse("D0700 0 secrets")?,
            ControlMessage::EnterDirectory {
                mode: 0o700,
                name: "secrets".to_string()
            }
        );
        assert_eq!(
            ControlMessage::parse("T12 0 34 0\n")?,
            ControlMessage::Timestamp {
                mtime: 12,
                atime: 34
            }
        );
        assert_eq!(
            ControlMessage::parse("E\n")?,
            ControlMessage::LeaveDirectory
        );
        Ok(())
    }

    #[test]
    fn parse_rejects_garbage() {
        for line in [
            "",
            "\n",
            "X0644 1 a\n",
            "C644 1 a\n",
            "C0648 1 a\n",
            "C0644 -1 a\n",
            "C0644 1\n",
            "D0755 12 dir\n",
            "T1 0 2\n",
            "Tx 0 2 0\n",
            "E extra\n",
        ] {
            assert!(
                ControlMessage::parse(line).is_err(),
                "{line:?} should not parse"
            );
        }
    }

    #[test]
    fn steps_match_message_kinds() {
        assert_eq!(ControlMessage::LeaveDirectory.step(), Step::LeaveDirectory);
        assert_eq!(
            ControlMessage::Timestamp { mtime: 0, atime: 0 }.step(),
            Step::Timestamp
        );
        assert_eq!(Step::CopyFile.to_string(), "copy-file");
        assert_eq!(Step::EnterDirectory.to_string(), "enter-directory");
    }

    #[test]
    fn descriptor_reads_local_metadata() -> anyhow::Result<()> {
        use std::os::unix::fs::PermissionsExt;
        let tmp_dir = tempfile::tempdir()?;
        let path = tmp_dir.path().join("data.bin");
        std::fs::write(&path, b"hello")?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o640))?;
        let descriptor = FileDescriptor::from_metadata(&path, &std::fs::metadata(&path)?)?;
        assert_eq!(descriptor.name, "data.bin");
        assert_eq!(descriptor.mode, 0o640);
        assert_eq!(descriptor.size, 5);
        assert!(!descriptor.is_dir);
        let dir_descriptor =
            FileDescriptor::from_metadata(tmp_dir.path(), &std::fs::metadata(tmp_dir.path())?)?;
        assert!(dir_descriptor.is_dir);
        assert_eq!(dir_descriptor.size, 0);
        Ok(())
    }

    #[test]
    fn descriptor_requires_a_base_name() -> anyhow::Result<()> {
        let metadata = std::fs::metadata("/")?;
        assert!(matches!(
            FileDescriptor::from_metadata(std::path::Path::new("/"), &metadata),
            Err(Error::InvalidName { .. })
        ));
        Ok(())
    }

    #[test]
    fn rejection_carries_step_and_message() {
        let ack = AckResult::Error {
            code: 1,
            message: "scp: /tmp/x: Permission denied".to_string(),
        };
        assert!(!ack.is_ok());
        match ack.into_result(Step::CopyFile, std::path::Path::new("x")) {
            Err(Error::RemoteRejected {
                step,
                code,
                message,
                ..
            }) => {
                assert_eq!(step, Step::CopyFile);
                assert_eq!(code, 1);
                assert!(message.contains("Permission denied"));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert!(
            AckResult::Ok
                .into_result(Step::Complete, std::path::Path::new("x"))
                .is_ok()
        );
    }
}
