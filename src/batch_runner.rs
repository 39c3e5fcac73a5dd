/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    config::Target,
    transfer::{Direction, Transfer},
};
use anyhow::Context;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{debug, error, warn};

/// Outcome of a parallel batch. Failed units are counted, never propagated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParallelReport {
    pub elapsed: Duration,
    pub attempted: usize,
    pub failed: usize,
}
impl ParallelReport {
    pub fn succeeded(&self) -> usize {
        self.attempted - self.failed
    }
}

/// Transfers the files one after the other, in order.
///
/// The first failure aborts the batch and is returned; files after it are never attempted.
///
/// # Returns
///
/// The wall-clock time from the start of the first transfer to the end of the last one.
pub async fn run_sequential(
    transfer: &dyn Transfer,
    target: &Target,
    direction: Direction,
    files: &[String],
) -> anyhow::Result<Duration> {
    let start = Instant::now();

    for file_id in files {
        transfer
            .transfer_one(target, direction, file_id)
            .await
            .context(format!(
                "Sequential {} of {} against {} failed",
                direction, file_id, target.name
            ))?;
    }

    let elapsed = start.elapsed();
    debug!(
        "sequential {} of {} files against {} took {:?}",
        direction,
        files.len(),
        target.name,
        elapsed
    );
    Ok(elapsed)
}

/// Transfers every file concurrently, one task per file, and waits for all of them.
///
/// Failing units are logged and counted but never abort the batch. `max_concurrency` caps the
/// number of transfers in flight; `None` starts them all at once.
///
/// # Returns
///
/// A report whose elapsed time spans the whole fan-out, i.e. it is driven by the slowest unit.
pub async fn run_parallel(
    transfer: Arc<dyn Transfer>,
    target: &Target,
    direction: Direction,
    files: &[String],
    max_concurrency: Option<usize>,
) -> ParallelReport {
    let target = Arc::new(target.clone());
    let permits = max_concurrency.map(|n| Arc::new(Semaphore::new(n.max(1))));

    let start = Instant::now();
    let mut join_set = JoinSet::new();
    for file_id in files.iter().cloned() {
        let transfer = transfer.clone();
        let target = target.clone();
        let permits = permits.clone();

        join_set.spawn(async move {
            let _permit = match permits {
                Some(sem) => Some(sem.acquire_owned().await),
                None => None,
            };
            let res = transfer.transfer_one(&target, direction, &file_id).await;
            (file_id, res)
        });
    }

    let mut failed = 0;
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok((_, Ok(_))) => {}
            Ok((file_id, Err(err))) => {
                failed += 1;
                error!(
                    "Error during parallel {} of {} against {}: {:#}",
                    direction, file_id, target.name, err
                );
            }
            Err(err) => {
                failed += 1;
                error!(
                    "Parallel {} task against {} did not complete: {}",
                    direction, target.name, err
                );
            }
        }
    }
    let elapsed = start.elapsed();

    if failed > 0 {
        warn!(
            "{}/{} parallel {}s against {} failed",
            failed,
            files.len(),
            direction,
            target.name
        );
    }

    ParallelReport {
        elapsed,
        attempted: files.len(),
        failed,
    }
}
