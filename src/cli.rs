use clap::Parser;
use log::LevelFilter;
use std::path::PathBuf;

/// Embedded controller fan control daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// YAML config file path (default: searched, then /etc/nbfcd/config.yml)
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Detach from the terminal and log to syslog
    #[arg(short = 'd', long = "daemonize", default_value = "false")]
    pub daemonize: bool,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(short = 'l', long = "log-level", default_value = "info")]
    pub log_level: LevelFilter,

    /// Serve on the session bus instead of the configured one
    #[arg(long = "session-bus", default_value = "false")]
    pub session_bus: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults() {
        let cli = Cli::try_parse_from(["nbfcd"]).unwrap();
        assert_eq!(cli.config, None);
        assert!(!cli.daemonize);
        assert_eq!(cli.log_level, LevelFilter::Info);
        assert!(!cli.session_bus);
    }

    #[test]
    fn all_flags() {
        let cli = Cli::try_parse_from([
            "nbfcd",
            "-c",
            "/tmp/nbfcd.yml",
            "--daemonize",
            "--log-level",
            "debug",
            "--session-bus",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/nbfcd.yml")));
        assert!(cli.daemonize);
        assert_eq!(cli.log_level, LevelFilter::Debug);
        assert!(cli.session_bus);
    }

    #[test]
    fn rejects_unknown_level() {
        assert!(Cli::try_parse_from(["nbfcd", "--log-level", "loud"]).is_err());
    }
}
