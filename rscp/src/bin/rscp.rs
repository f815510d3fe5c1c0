use anyhow::{Context, anyhow};
use clap::Parser;
use tracing::instrument;

use scp_tools_rscp::{path, source};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "rscp",
    version,
    about = "Copy files to a remote host using the scp protocol",
    long_about = "`rscp` copies local files and directory trees to a remote host.

It connects over SSH, starts `scp -t` on the remote side and streams files using the classic scp/rcp protocol, so the remote host needs nothing but a stock `scp` binary.

EXAMPLES:
    # Copy a file into the remote home directory
    rscp report.pdf user@host:

    # Copy a directory tree keeping timestamps
    rscp -r -p ./photos user@host:2222:/srv/backup/

    # Copy several files into an existing remote directory
    rscp a.txt b.txt host:/tmp/inbox --summary"
)]
struct Args {
    // Copy options
    /// Copy directories recursively
    #[arg(short, long, help_heading = "Copy options")]
    recursive: bool,

    /// Preserve modification and access times
    #[arg(short, long, help_heading = "Copy options")]
    preserve: bool,

    /// Always follow symbolic links in source
    #[arg(short = 'L', long, help_heading = "Copy options")]
    dereference: bool,

    // Progress & output
    /// Print summary at the end
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    // Performance
    /// Size of the buffer used to read file content
    #[arg(
        long,
        default_value = "128KiB",
        value_name = "SIZE",
        help_heading = "Performance"
    )]
    chunk_size: bytesize::ByteSize,

    // Advanced settings
    /// Number of worker threads (0 = number of CPU cores)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    // Remote copy options
    /// Program started on the remote host in sink mode
    #[arg(
        long,
        default_value = "scp",
        value_name = "PROGRAM",
        help_heading = "Remote copy options"
    )]
    scp_command: String,

    /// How long to wait for the message following a non-zero status from the remote side
    #[arg(
        long,
        default_value = "1s",
        value_name = "DURATION",
        value_parser = humantime::parse_duration,
        help_heading = "Remote copy options"
    )]
    ack_message_timeout: std::time::Duration,

    /// Accept and remember host keys missing from known_hosts
    #[arg(long, help_heading = "Remote copy options")]
    accept_unknown_hosts: bool,

    // ARGUMENTS
    /// Source path(s) followed by the remote destination `[user@]host[:port]:path`
    #[arg(required = true, num_args = 2.., value_name = "PATHS")]
    paths: Vec<String>,
}

/// Checks every source locally so that obvious mistakes fail before connecting.
///
/// Returns whether any of the sources is a directory.
async fn check_sources(
    sources: &[std::path::PathBuf],
    recursive: bool,
    dereference: bool,
) -> anyhow::Result<bool> {
    let mut any_directory = false;
    for src in sources {
        let metadata = if dereference {
            tokio::fs::metadata(src).await
        } else {
            tokio::fs::symlink_metadata(src).await
        }
        .with_context(|| format!("{}: cannot access source", src.display()))?;
        if metadata.is_dir() {
            if !recursive {
                return Err(anyhow!("{}: not a regular file", src.display()));
            }
            any_directory = true;
        } else if !metadata.is_file() {
            return Err(anyhow!("{}: not a regular file", src.display()));
        }
    }
    Ok(any_directory)
}

#[instrument]
async fn async_main(args: Args) -> anyhow::Result<common::Summary> {
    let (dst, srcs) = args
        .paths
        .split_last()
        .ok_or_else(|| anyhow!("You must specify a source and destination path"))?;
    let dst = match path::parse_path(dst)? {
        path::PathType::Remote(remote_path) => remote_path,
        path::PathType::Local(local) => {
            return Err(anyhow!(
                "Destination {local:?} is not remote, expected [user@]host[:port]:path"
            ));
        }
    };
    let mut sources = Vec::with_capacity(srcs.len());
    for src in srcs {
        match path::parse_path(src)? {
            path::PathType::Local(local) => sources.push(local),
            path::PathType::Remote(_) => {
                return Err(anyhow!(
                    "Source {src:?} is remote, only local sources can be sent"
                ));
            }
        }
    }
    let any_directory = check_sources(&sources, args.recursive, args.dereference).await?;
    let chunk_size = usize::try_from(args.chunk_size.as_u64())
        .context("--chunk-size does not fit in memory")?;
    if chunk_size == 0 {
        return Err(anyhow!("--chunk-size must be greater than 0"));
    }
    let command = remote::SinkCommand {
        program: args.scp_command.clone(),
        target: dst.path().to_string(),
        recursive: any_directory,
        preserve_times: args.preserve,
        target_is_dir: sources.len() > 1,
    };
    let policy = if args.accept_unknown_hosts {
        remote::HostKeyPolicy::Accept
    } else {
        remote::HostKeyPolicy::Strict
    };
    let sink = remote::start_sink(dst.session(), policy, &command).await?;
    let writer: remote::streams::BoxedWrite = Box::new(sink.writer);
    let reader: remote::streams::BoxedRead = Box::new(sink.reader);
    let stream = remote::streams::ScpStream::new(
        writer,
        reader,
        remote::streams::AckSettings {
            message_timeout: args.ack_message_timeout,
            ..Default::default()
        },
    );
    let mut session = source::Session::new(
        stream,
        source::Settings {
            preserve_times: args.preserve,
            dereference: args.dereference,
            chunk_size,
        },
    );
    let transferred = source::transfer(&mut session, &sources).await;
    // dropping the session closes the sink's stdin
    drop(session);
    let sink_exit = remote::wait_for_sink(sink.child).await;
    match transferred {
        Ok(summary) => {
            sink_exit?;
            Ok(summary)
        }
        Err(error) => {
            // the sink usually explains on stderr why it gave up
            if let Err(sink_error) = sink_exit {
                tracing::error!("{:#}", sink_error);
            }
            Err(error)
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
    };
    let res = common::run(output, runtime, func);
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
