/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use anyhow::Context;
use colored::Colorize;
use std::{path::PathBuf, sync::Arc};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, subscriber::set_global_default, warn, Subscriber};
use tracing_subscriber::EnvFilter;
use xferbench::{
    clap_args::{self, Commands},
    config::Config,
    process_control::{NoopLifecycle, ProcessLifecycle, TargetLifecycle},
    results, seed, target_server,
    transfer::{HttpTransfer, Transfer},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // dotenv
    dotenvy::dotenv().ok();

    let args = clap_args::parse();
    let subscriber = get_subscriber(if args.verbose { "debug" } else { "info" }.into());
    init_subscriber(subscriber);

    match args.command {
        Commands::Init { path } => match Config::write_example_to_file(&path) {
            Ok(_) => println!("{}", format!("{} created!", path.to_string_lossy()).green()),
            Err(err) => println!("{}\n{}", "Error creating config.".red(), err),
        },

        Commands::Seed {
            data_dir,
            files,
            large_file_mb,
        } => {
            println!("{}", "Initializing test files...".green());
            let report = tokio::task::spawn_blocking(move || {
                seed::seed_data(&data_dir, files, large_file_mb, &mut rand::thread_rng())
            })
            .await??;
            println!(
                "{} json files{} created",
                report.json_files,
                report
                    .large_file
                    .map(|path| format!(" and {}", path.to_string_lossy()))
                    .unwrap_or_default()
            );
        }

        Commands::Run {
            config,
            rounds,
            external,
        } => run(config, rounds, external).await?,

        Commands::Serve { port, storage_dir } => {
            let listener = TcpListener::bind(("0.0.0.0", port))
                .await
                .context(format!("Unable to bind port {}", port))?;

            let token = CancellationToken::new();
            let shutdown = token.clone();
            ctrlc::set_handler(move || shutdown.cancel())
                .context("Error setting Ctrl-C handler")?;

            target_server::serve(listener, storage_dir, token).await?;
        }
    }

    Ok(())
}

async fn run(config_path: PathBuf, rounds: Option<u32>, external: bool) -> anyhow::Result<()> {
    let mut config = Config::try_from_path(&config_path)?;
    if let Some(rounds) = rounds {
        config.bench.rounds = rounds;
        config.validate()?;
    }

    let file_set = config.file_set()?;
    let missing = file_set.missing_files().len();
    if missing > 0 {
        warn!(
            "{} benchmark files are missing from {}, run `xferbench seed` first",
            missing,
            file_set.data_dir().to_string_lossy()
        );
    }

    let transfer: Arc<dyn Transfer> = Arc::new(HttpTransfer::new(
        &config.bench.data_dir,
        config.bench.request_timeout(),
        config.bench.probe_timeout(),
    )?);

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    ctrlc::set_handler(move || {
        println!("\n{}", "Interrupted, stopping targets...".yellow());
        interrupt.cancel();
    })
    .context("Error setting Ctrl-C handler")?;

    let mut lifecycle: Box<dyn TargetLifecycle> = if external {
        Box::new(NoopLifecycle::new(transfer.clone(), config.readiness.clone()))
    } else {
        println!("{}", "Starting servers...".green());
        Box::new(ProcessLifecycle::new(
            transfer.clone(),
            config.readiness.clone(),
        ))
    };

    let results = xferbench::run(&config, lifecycle.as_mut(), transfer, cancel).await?;

    results::print_summary(&results);
    info!("Test rounds completed successfully. Results saved to CSV files.");
    Ok(())
}

fn get_subscriber(env_filter: String) -> impl Subscriber + Sync + Send {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(env_filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .finish()
}

fn init_subscriber(subscriber: impl Subscriber + Sync + Send) {
    set_global_default(subscriber).expect("Failed to set subscriber");
}
