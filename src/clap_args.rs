use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Verbose mode (-v, --verbose)
    #[arg(short, long, global = true, action = clap::ArgAction::SetTrue)]
    pub verbose: bool,

    /// Config file, defaults to ./fiobench.toml when present
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Commands {
    /// Run the write and read workloads concurrently and print the report
    Run {
        /// Run the iperf3 network baseline first
        #[arg(long, conflicts_with = "no_network")]
        network: bool,

        /// Skip the network baseline even if IPERF3_ENABLED is set
        #[arg(long)]
        no_network: bool,
    },

    /// Write both fio job files to the output directory without running them
    Generate,
}

impl Commands {
    /// Whether the network baseline should run, given the configured default.
    pub fn network_enabled(&self, configured: bool) -> bool {
        match self {
            Commands::Run { network: true, .. } => true,
            Commands::Run {
                no_network: true, ..
            } => false,
            _ => configured,
        }
    }
}

pub fn parse() -> Args {
    Args::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_flags() -> anyhow::Result<()> {
        let args = Args::try_parse_from(["fiobench", "run", "--network", "-v"])?;
        assert!(args.verbose);
        assert!(args.command.network_enabled(false));

        let args = Args::try_parse_from(["fiobench", "--config", "bench.toml", "run", "--no-network"])?;
        assert_eq!(args.config, Some(PathBuf::from("bench.toml")));
        assert!(!args.command.network_enabled(true));

        let args = Args::try_parse_from(["fiobench", "run"])?;
        assert!(!args.verbose);
        assert!(args.command.network_enabled(true));
        assert!(!args.command.network_enabled(false));
        Ok(())
    }

    #[test]
    fn network_flags_conflict() {
        let res = Args::try_parse_from(["fiobench", "run", "--network", "--no-network"]);
        assert!(res.is_err());
    }

    #[test]
    fn parses_generate() -> anyhow::Result<()> {
        let args = Args::try_parse_from(["fiobench", "generate"])?;
        assert_eq!(args.command, Commands::Generate);
        Ok(())
    }
}
