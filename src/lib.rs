/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

pub mod batch_runner;
pub mod clap_args;
pub mod config;
pub mod file_set;
pub mod process_control;
pub mod results;
pub mod round_scheduler;
pub mod seed;
pub mod target_server;
pub mod transfer;

use anyhow::anyhow;
use config::Config;
use process_control::TargetLifecycle;
use results::{ResultFiles, RoundResults};
use round_scheduler::RoundScheduler;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use transfer::Transfer;

/// Runs a complete benchmark: starts the targets, drives every round, persists the result
/// tables and finally stops the targets again.
///
/// The targets are always stopped, whether or not the rounds completed successfully. Result
/// files are only written when every round completed.
///
/// # Arguments
///
/// * config - The harness configuration, including the target registry.
/// * lifecycle - Starts and stops the target processes.
/// * transfer - Performs probes, uploads and downloads.
/// * cancel - Cancelling this token aborts the target startup or the run between transfers.
///
/// # Returns
///
/// The four sample tables collected during the run.
pub async fn run(
    config: &Config,
    lifecycle: &mut dyn TargetLifecycle,
    transfer: Arc<dyn Transfer>,
    cancel: CancellationToken,
) -> anyhow::Result<RoundResults> {
    let file_set = config.file_set()?;
    info!(
        "benchmarking {} targets over {} rounds with {} files",
        config.targets.len(),
        config.bench.rounds,
        file_set.len()
    );

    // a cancelled start still stops whatever was launched so far
    let started = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(anyhow!("Benchmark interrupted")),
        res = lifecycle.start_all(&config.targets) => res,
    };

    let outcome = match started {
        Ok(ready) => {
            if ready.len() < config.targets.len() {
                warn!(
                    "only {}/{} targets are ready, the others will be skipped while unavailable",
                    ready.len(),
                    config.targets.len()
                );
            }
            benchmark(config, &file_set, transfer, cancel).await
        }
        Err(err) => Err(err),
    };

    lifecycle.stop_all();
    outcome
}

async fn benchmark(
    config: &Config,
    file_set: &file_set::FileSet,
    transfer: Arc<dyn Transfer>,
    cancel: CancellationToken,
) -> anyhow::Result<RoundResults> {
    // create the output files up front so a bad results dir fails before any transfer
    let result_files = ResultFiles::create(&config.bench.results_dir)?;

    let scheduler = RoundScheduler::new(transfer, config.scheduler_settings(), cancel);
    let results = scheduler.run(&config.targets, file_set).await?;

    result_files.write(&results)?;
    info!(
        "results written to {}",
        config.bench.results_dir.to_string_lossy()
    );

    Ok(results)
}
