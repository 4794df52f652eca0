#![doc = include_str!("../README.md")]

use clap::{value_parser, ArgAction, Args};

/// Common way to set logging levels
#[derive(Debug, Clone, Copy, Default, Args)]
pub struct LoggingArgs {
    /// Log more, can be repeated up to three times
    #[clap(short = 'v', long = "verbose", value_parser = value_parser!(u8).range(0..=3), action = ArgAction::Count, conflicts_with = "quiet", global = true)]
    verbose: u8,
    /// Log less, can be repeated up to two times
    #[clap(short = 'q', long = "quiet", value_parser = value_parser!(u8).range(0..=2), action = ArgAction::Count, conflicts_with = "verbose", global = true)]
    quiet: u8,
}

impl LoggingArgs {
    /// How far the verbosity is moved from the default, negative when quieter
    pub fn verbosity(&self) -> i8 {
        self.verbose as i8 - self.quiet as i8
    }

    /// Gets the logging level based on whether `-v[vv]` or `-q[q]` has been used.
    ///
    /// Only warnings are shown by default, so program output is not drowned in logs.
    #[cfg(feature = "tracing")]
    pub fn log_level_filter(&self) -> tracing::level_filters::LevelFilter {
        use tracing::level_filters::LevelFilter;
        match self.verbosity() {
            i8::MIN..=-2 => LevelFilter::OFF,
            -1 => LevelFilter::ERROR,
            0 => LevelFilter::WARN,
            1 => LevelFilter::INFO,
            2 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Debug, Parser)]
    struct TestApp {
        #[command(flatten)]
        logging: LoggingArgs,
    }

    fn verbosity(args: &str) -> i8 {
        TestApp::try_parse_from(args.split_whitespace())
            .expect("could not parse test string")
            .logging
            .verbosity()
    }

    #[test]
    fn test_counts() {
        assert_eq!(verbosity("app"), 0);
        assert_eq!(verbosity("app -vv"), 2);
        assert_eq!(verbosity("app -v -v -v"), 3);
        assert_eq!(verbosity("app -qq"), -2);
    }

    #[test]
    fn test_verbose_conflicts_with_quiet() {
        assert!(TestApp::try_parse_from(["app", "-v", "-q"]).is_err());
    }

    #[cfg(feature = "tracing")]
    #[test]
    fn test_level_filter() {
        use tracing::level_filters::LevelFilter;
        let parse = |args: &str| {
            TestApp::try_parse_from(args.split_whitespace())
                .unwrap()
                .logging
                .log_level_filter()
        };
        assert_eq!(parse("app"), LevelFilter::WARN);
        assert_eq!(parse("app -vvv"), LevelFilter::TRACE);
        assert_eq!(parse("app -qq"), LevelFilter::OFF);
    }
}
