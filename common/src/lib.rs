//! Shared runtime plumbing for the scp tools.
//!
//! Binaries build an [`OutputConfig`] and a [`RuntimeConfig`] from their command line and hand
//! their async entry point to [`run`], which installs the tracing subscriber, starts the tokio
//! runtime, reports errors and prints the final summary.

pub mod config;
pub mod summary;

pub use config::{OutputConfig, RuntimeConfig};
pub use summary::Summary;

fn init_tracing(
    output: &OutputConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(output.log_level()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
}

/// Runs `func` to completion on a freshly configured tokio runtime.
///
/// Returns `None` if the runtime could not be started or `func` failed; the error has already
/// been reported (unless `quiet` was requested) so callers only need to pick an exit code.
pub fn run<Fut, S>(
    output: OutputConfig,
    runtime: RuntimeConfig,
    func: impl FnOnce() -> Fut,
) -> Option<S>
where
    S: std::fmt::Display,
    Fut: std::future::Future<Output = anyhow::Result<S>>,
{
    if let Err(error) = init_tracing(&output) {
        // only happens when the process already installed one, e.g. under a test harness
        tracing::debug!("keeping the already installed tracing subscriber: {error}");
    }
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    let runtime = match builder.build() {
        Ok(runtime) => runtime,
        Err(error) => {
            if !output.quiet {
                eprintln!("failed to start tokio runtime: {error}");
            }
            return None;
        }
    };
    match runtime.block_on(func()) {
        Ok(summary) => {
            if output.print_summary || output.verbose > 0 {
                println!("{summary}");
            }
            Some(summary)
        }
        Err(error) => {
            if !output.quiet {
                tracing::error!("{:#}", &error);
            }
            None
        }
    }
}
