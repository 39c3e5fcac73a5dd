/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Verbose mode (-v, --verbose)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write an example configuration file
    Init {
        #[arg(short, long, default_value = "xferbench.toml")]
        path: PathBuf,
    },

    /// Generate the files transferred during a benchmark
    Seed {
        #[arg(short, long, default_value = "data")]
        data_dir: PathBuf,

        /// Number of json files to generate
        #[arg(short, long, default_value_t = 1000)]
        files: usize,

        /// Size of the large text file in MiB, 0 to skip it
        #[arg(short, long, default_value_t = 100)]
        large_file_mb: u64,
    },

    /// Run the benchmark
    Run {
        #[arg(short, long, default_value = "xferbench.toml")]
        config: PathBuf,

        /// Override the number of rounds from the config
        #[arg(short, long)]
        rounds: Option<u32>,

        /// Don't start any target, they are already running
        #[arg(short, long)]
        external: bool,
    },

    /// Serve the reference transfer target
    Serve {
        #[arg(short, long, default_value_t = 9100)]
        port: u16,

        #[arg(short, long, default_value = "uploads")]
        storage_dir: PathBuf,
    },
}

pub fn parse() -> Args {
    Args::parse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Args::command().debug_assert();
    }

    #[test]
    fn run_defaults() {
        let args = Args::parse_from(["xferbench", "run"]);
        match args.command {
            Commands::Run {
                config,
                rounds,
                external,
            } => {
                assert_eq!(config, PathBuf::from("xferbench.toml"));
                assert_eq!(rounds, None);
                assert!(!external);
            }
            cmd => panic!("expected run, got {:?}", cmd),
        }
    }

    #[test]
    fn verbose_is_global() {
        let args = Args::parse_from(["xferbench", "serve", "--port", "9001", "-v"]);
        assert!(args.verbose);
        assert!(matches!(args.command, Commands::Serve { port: 9001, .. }));
    }
}
