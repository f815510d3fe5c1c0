//! scp wire protocol and the plumbing to start a remote `scp -t` sink over SSH.
//!
//! Authentication and host verification are left to the system `ssh` client (agent, keys and
//! `~/.ssh/config`), which `openssh` drives through a multiplexed master connection.

use anyhow::{Context, anyhow};
use tracing::instrument;

pub mod protocol;
pub mod streams;

#[derive(Debug, Clone, PartialEq)]
pub struct SshSession {
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
}

impl SshSession {
    /// Destination string understood by `ssh`.
    pub fn destination(&self) -> String {
        let host = self.host.as_str();
        match (self.user.as_deref(), self.port) {
            (Some(user), Some(port)) => format!("ssh://{user}@{host}:{port}"),
            (None, Some(port)) => format!("ssh://{host}:{port}"),
            (Some(user), None) => format!("ssh://{user}@{host}"),
            (None, None) => format!("ssh://{host}"),
        }
    }
}

/// How to treat hosts missing from `known_hosts`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Refuse unknown hosts
    #[default]
    Strict,
    /// Accept and record unknown hosts
    Accept,
}

impl From<HostKeyPolicy> for openssh::KnownHosts {
    fn from(policy: HostKeyPolicy) -> Self {
        match policy {
            HostKeyPolicy::Strict => openssh::KnownHosts::Strict,
            HostKeyPolicy::Accept => openssh::KnownHosts::Accept,
        }
    }
}

async fn setup_ssh_session(
    session: &SshSession,
    policy: HostKeyPolicy,
) -> anyhow::Result<std::sync::Arc<openssh::Session>> {
    let destination = session.destination();
    tracing::debug!("Connecting to SSH destination: {}", destination);
    let session = std::sync::Arc::new(
        openssh::Session::connect(destination, policy.into())
            .await
            .context("Failed to establish SSH connection")?,
    );
    Ok(session)
}

/// Remote `scp` invocation in sink ("to") mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkCommand {
    /// Program started on the remote host, usually `scp`
    pub program: String,
    /// Where the sink writes; relative paths resolve against the remote home directory
    pub target: String,
    /// Accept directory (`D`/`E`) messages
    pub recursive: bool,
    /// Apply the times carried by `T` messages
    pub preserve_times: bool,
    /// Target must be an existing directory (more than one source)
    pub target_is_dir: bool,
}

impl SinkCommand {
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec!["-t".to_string()];
        if self.recursive {
            args.push("-r".to_string());
        }
        if self.preserve_times {
            args.push("-p".to_string());
        }
        if self.target_is_dir {
            args.push("-d".to_string());
        }
        args.push("--".to_string());
        args.push(self.target.clone());
        args
    }
}

/// Running sink process together with its protocol streams.
pub struct RemoteSink {
    pub child: openssh::Child<std::sync::Arc<openssh::Session>>,
    /// Remote stdin, carries control lines and file content
    pub writer: openssh::ChildStdin,
    /// Remote stdout, carries acks
    pub reader: openssh::ChildStdout,
}

#[instrument]
pub async fn start_sink(
    session: &SshSession,
    policy: HostKeyPolicy,
    command: &SinkCommand,
) -> anyhow::Result<RemoteSink> {
    tracing::info!("Starting scp sink on: {:?}", session);
    let ssh = setup_ssh_session(session, policy).await?;
    let args = command.to_args();
    tracing::debug!("sink arguments: {:?}", args);
    let mut cmd = ssh.arc_command(command.program.clone());
    let mut child = cmd
        .args(args)
        .stdin(openssh::Stdio::piped())
        .stdout(openssh::Stdio::piped())
        .stderr(openssh::Stdio::piped())
        .spawn()
        .await
        .with_context(|| format!("Failed to spawn {} on {}", command.program, session.host))?;
    let writer = child
        .stdin()
        .take()
        .ok_or_else(|| anyhow!("sink stdin was not captured"))?;
    let reader = child
        .stdout()
        .take()
        .ok_or_else(|| anyhow!("sink stdout was not captured"))?;
    Ok(RemoteSink {
        child,
        writer,
        reader,
    })
}

/// Waits for the sink to exit; its stdin must already be closed.
#[instrument]
pub async fn wait_for_sink(
    child: openssh::Child<std::sync::Arc<openssh::Session>>,
) -> anyhow::Result<()> {
    tracing::info!("Waiting on scp sink: {:?}", child);
    let output = child
        .wait_with_output()
        .await
        .context("Failed to wait for scp sink completion")?;
    if !output.status.success() {
        return Err(anyhow!(
            "scp sink failed on remote host, status code: {:?}\nstderr:\n{}",
            output.status.code(),
            String::from_utf8_lossy(&output.stderr),
        ));
    }
    Ok(())
}
