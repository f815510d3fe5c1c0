/// Totals for a transfer session.
///
/// Summaries of individual files and directories are added together as the
/// walk progresses; the final value is printed with `--summary`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Summary {
    pub bytes_sent: u64,
    pub files_sent: usize,
    pub directories_sent: usize,
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            bytes_sent: self.bytes_sent + other.bytes_sent,
            files_sent: self.files_sent + other.files_sent,
            directories_sent: self.directories_sent + other.directories_sent,
        }
    }
}

impl std::ops::AddAssign for Summary {
    fn add_assign(&mut self, other: Self) {
        *self = *self + other;
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "bytes sent: {}\n\
            files sent: {}\n\
            directories sent: {}",
            bytesize::ByteSize(self.bytes_sent),
            self.files_sent,
            self.directories_sent,
        )
    }
}
