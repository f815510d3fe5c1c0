use anyhow::Context;

/// Destination on a remote host, as given on the command line.
#[derive(Debug, Clone, PartialEq)]
pub struct RemotePath {
    session: remote::SshSession,
    path: String,
}

impl RemotePath {
    pub fn new(session: remote::SshSession, path: &str) -> Self {
        // an empty path means the remote login directory, same as `scp host:`
        let path = if path.is_empty() { "." } else { path };
        Self {
            session,
            path: path.to_string(),
        }
    }

    pub fn session(&self) -> &remote::SshSession {
        &self.session
    }

    /// Path handed to the sink verbatim; relative paths resolve on the remote side.
    pub fn path(&self) -> &str {
        &self.path
    }
}

#[derive(Debug, PartialEq)]
pub enum PathType {
    Local(std::path::PathBuf),
    Remote(RemotePath),
}

pub fn parse_path(path: &str) -> anyhow::Result<PathType> {
    // Regular expression for remote paths with named groups
    let re = regex::Regex::new(
        r"^(?:(?P<user>[^@/]+)@)?(?P<host>(?:\[[^\]]+\]|[^:\[\]/]+))(?::(?P<port>\d+))?:(?P<path>.*)$",
    )
    .context("Failed to compile remote path pattern")?;
    let Some(captures) = re.captures(path) else {
        return Ok(PathType::Local(path.into()));
    };
    let user = captures.name("user").map(|m| m.as_str().to_string());
    let host = captures
        .name("host")
        .map(|m| m.as_str().to_string())
        .with_context(|| format!("Missing host in remote path {path:?}"))?;
    let port = captures
        .name("port")
        .map(|m| m.as_str().parse::<u16>())
        .transpose()
        .with_context(|| format!("Invalid port in remote path {path:?}"))?;
    let remote_path = captures.name("path").map_or("", |m| m.as_str());
    Ok(PathType::Remote(RemotePath::new(
        remote::SshSession { user, host, port },
        remote_path,
    )))
}
