//! Configuration types for runtime and execution settings

/// Runtime configuration for the tokio runtime
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress error output
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
    /// Print summary statistics at the end
    pub print_summary: bool,
}

impl OutputConfig {
    /// Default log filter directive for the configured verbosity.
    ///
    /// `RUST_LOG` takes precedence when set.
    pub fn log_level(&self) -> &'static str {
        if self.quiet {
            return "off";
        }
        match self.verbose {
            0 => "error",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_maps_to_levels() {
        let mut output = OutputConfig::default();
        assert_eq!(output.log_level(), "error");
        output.verbose = 1;
        assert_eq!(output.log_level(), "info");
        output.verbose = 2;
        assert_eq!(output.log_level(), "debug");
        output.verbose = 7;
        assert_eq!(output.log_level(), "trace");
    }

    #[test]
    fn quiet_silences_everything() {
        let output = OutputConfig {
            quiet: true,
            verbose: 3,
            print_summary: false,
        };
        assert_eq!(output.log_level(), "off");
    }
}
