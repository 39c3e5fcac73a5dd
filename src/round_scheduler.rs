/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    batch_runner::{run_parallel, run_sequential, ParallelReport},
    config::Target,
    file_set::FileSet,
    results::{RoundResults, TargetRound},
    transfer::{Direction, Transfer},
};
use anyhow::{anyhow, Context};
use colored::Colorize;
use std::{fmt, path::Path, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub rounds: u32,
    pub batch_factor: usize,
    pub max_concurrency: Option<usize>,
}

/// The steps every target goes through in a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    ResetState,
    ProbeTargets,
    RunUploadSeq,
    RunDownloadSeq,
    RunUploadPar,
    RunDownloadPar,
}
impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self {
            Phase::ResetState => "reset state",
            Phase::ProbeTargets => "probe",
            Phase::RunUploadSeq => "sequential upload",
            Phase::RunDownloadSeq => "sequential download",
            Phase::RunUploadPar => "parallel upload",
            Phase::RunDownloadPar => "parallel download",
        };
        write!(f, "{}", phase)
    }
}

/// Removes everything a target stored in earlier rounds and recreates its storage dir.
pub async fn reset_storage(storage_dir: &Path) -> anyhow::Result<()> {
    match tokio::fs::remove_dir_all(storage_dir).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err).context(format!(
                "Error clearing uploads directory {}",
                storage_dir.to_string_lossy()
            ))
        }
    }

    tokio::fs::create_dir_all(storage_dir)
        .await
        .context(format!(
            "Error recreating uploads directory {}",
            storage_dir.to_string_lossy()
        ))
}

fn progress(round: u32, rounds: u32) -> String {
    let pct = (round as f64 / rounds as f64 * 10000.0).round() / 100.0;
    format!("{:.2}%", pct)
}

pub struct RoundScheduler {
    transfer: Arc<dyn Transfer>,
    settings: SchedulerSettings,
    cancel: CancellationToken,
}
impl RoundScheduler {
    pub fn new(
        transfer: Arc<dyn Transfer>,
        settings: SchedulerSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transfer,
            settings,
            cancel,
        }
    }

    /// Runs every round against every target.
    ///
    /// # Returns
    ///
    /// The collected samples once all rounds completed, or the first sequential-mode error. An
    /// error (or cancellation) discards all samples collected so far.
    pub async fn run(&self, targets: &[Target], file_set: &FileSet) -> anyhow::Result<RoundResults> {
        let cancel = self.cancel.clone();
        tokio::select! {
            _ = cancel.cancelled() => Err(anyhow!("Benchmark interrupted")),
            res = self.run_rounds(targets, file_set) => res,
        }
    }

    async fn run_rounds(
        &self,
        targets: &[Target],
        file_set: &FileSet,
    ) -> anyhow::Result<RoundResults> {
        let mut results = RoundResults::default();
        let rounds = self.settings.rounds;

        println!("{}", "00%".green());
        for round in 1..=rounds {
            self.run_round(round, targets, file_set, &mut results)
                .await
                .context(format!("Error during test round {}", round))?;

            println!("{}", progress(round, rounds).green());
        }

        Ok(results)
    }

    /// Runs one round: every available target gets the round's workload in all four modes.
    pub async fn run_round(
        &self,
        round: u32,
        targets: &[Target],
        file_set: &FileSet,
        results: &mut RoundResults,
    ) -> anyhow::Result<()> {
        let files = file_set.workload(round, self.settings.batch_factor);
        info!("round {}: {} files per batch", round, files.len());

        for target in targets {
            if let Some(sample) = self.run_target(round, target, files).await? {
                results.record(&target.name, sample);
            }
        }

        info!("Test round {} completed successfully", round);
        Ok(())
    }

    /// `Ok(None)` when the target was unavailable and skipped for this round.
    async fn run_target(
        &self,
        round: u32,
        target: &Target,
        files: &[String],
    ) -> anyhow::Result<Option<TargetRound>> {
        if let Some(storage_dir) = &target.storage_dir {
            self.enter(round, target, Phase::ResetState);
            reset_storage(storage_dir).await?;
        }

        self.enter(round, target, Phase::ProbeTargets);
        if !self.transfer.probe(target).await {
            warn!(
                "Skipping target {} in round {} as it is not available",
                target.name, round
            );
            return Ok(None);
        }

        let transfer = self.transfer.as_ref();

        self.enter(round, target, Phase::RunUploadSeq);
        let upload_seq = run_sequential(transfer, target, Direction::Upload, files)
            .await
            .context(format!("Error during upload to target {}", target.name))?;

        self.enter(round, target, Phase::RunDownloadSeq);
        let download_seq = run_sequential(transfer, target, Direction::Download, files)
            .await
            .context(format!("Error during download from target {}", target.name))?;

        self.enter(round, target, Phase::RunUploadPar);
        let upload_par = run_parallel(
            self.transfer.clone(),
            target,
            Direction::Upload,
            files,
            self.settings.max_concurrency,
        )
        .await;
        self.report(target, Direction::Upload, &upload_par);

        self.enter(round, target, Phase::RunDownloadPar);
        let download_par = run_parallel(
            self.transfer.clone(),
            target,
            Direction::Download,
            files,
            self.settings.max_concurrency,
        )
        .await;
        self.report(target, Direction::Download, &download_par);

        Ok(Some(TargetRound {
            upload_seq,
            download_seq,
            upload_par: upload_par.elapsed,
            download_par: download_par.elapsed,
        }))
    }

    fn enter(&self, round: u32, target: &Target, phase: Phase) {
        debug!("round {} / {}: {}", round, target.name, phase);
    }

    fn report(&self, target: &Target, direction: Direction, report: &ParallelReport) {
        debug!(
            "parallel {} against {}: {}/{} succeeded in {:?}",
            direction,
            target.name,
            report.succeeded(),
            report.attempted,
            report.elapsed
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{results::write_table_pair, transfer::fake::FakeTransfer};
    use std::{path::PathBuf, time::Duration};

    fn target(name: &str, storage_dir: Option<PathBuf>) -> Target {
        Target {
            name: name.to_string(),
            url: format!("http://{}.invalid", name),
            up: None,
            storage_dir,
            redirect: None,
        }
    }

    fn settings(rounds: u32, batch_factor: usize) -> SchedulerSettings {
        SchedulerSettings {
            rounds,
            batch_factor,
            max_concurrency: None,
        }
    }

    fn file_set(count: usize) -> FileSet {
        FileSet::generated(Path::new("data"), count, &[]).expect("valid ids")
    }

    #[test]
    fn progress_has_two_decimals() {
        assert_eq!(progress(1, 3), "33.33%");
        assert_eq!(progress(2, 3), "66.67%");
        assert_eq!(progress(100, 100), "100.00%");
    }

    #[tokio::test]
    async fn every_round_samples_every_available_target() -> anyhow::Result<()> {
        let transfer = Arc::new(FakeTransfer::new());
        let scheduler =
            RoundScheduler::new(transfer.clone(), settings(3, 2), CancellationToken::new());
        let targets = [target("flask", None), target("gin", None)];

        let results = scheduler.run(&targets, &file_set(5)).await?;

        for table in [
            &results.upload_seq,
            &results.download_seq,
            &results.upload_par,
            &results.download_par,
        ] {
            assert_eq!(table.samples("flask").map(|s| s.len()), Some(3));
            assert_eq!(table.samples("gin").map(|s| s.len()), Some(3));
        }

        // workloads of 2, 4 and 5 files, each uploaded twice (seq + par) per target
        let uploads = transfer.attempted_files(Direction::Upload);
        assert_eq!(uploads.len(), 2 * 2 * (2 + 4 + 5));
        Ok(())
    }

    #[tokio::test]
    async fn unavailable_target_gets_no_samples() -> anyhow::Result<()> {
        let transfer = Arc::new(FakeTransfer::new().with_unavailable("fastapi"));
        let scheduler =
            RoundScheduler::new(transfer.clone(), settings(2, 1), CancellationToken::new());
        let targets = [target("fastapi", None), target("gin", None)];

        let results = scheduler.run(&targets, &file_set(2)).await?;

        assert_eq!(results.upload_seq.samples("fastapi"), None);
        assert_eq!(results.download_par.samples("fastapi"), None);
        assert_eq!(results.upload_seq.samples("gin").map(|s| s.len()), Some(2));
        assert!(transfer
            .attempts()
            .iter()
            .all(|(target_name, _, _)| target_name == "gin"));
        Ok(())
    }

    #[tokio::test]
    async fn target_down_for_one_round_gets_a_shorter_row() -> anyhow::Result<()> {
        let transfer = Arc::new(FakeTransfer::new().with_failing_probe("b", 2));
        let scheduler =
            RoundScheduler::new(transfer.clone(), settings(3, 1), CancellationToken::new());
        let targets = [target("a", None), target("b", None)];

        let results = scheduler.run(&targets, &file_set(3)).await?;

        for table in [
            &results.upload_seq,
            &results.download_seq,
            &results.upload_par,
            &results.download_par,
        ] {
            assert_eq!(table.samples("a").map(|s| s.len()), Some(3));
            assert_eq!(table.samples("b").map(|s| s.len()), Some(2));
        }

        // b was not transferred to in round 2, where the workload is file_1 and file_2
        let b_uploads = transfer
            .attempts()
            .into_iter()
            .filter(|(name, dir, _)| name == "b" && *dir == Direction::Upload)
            .count();
        assert_eq!(b_uploads, 2 * (1 + 3));

        let mut csv = vec![];
        write_table_pair(
            &mut csv,
            ("Server up", &results.upload_seq),
            ("Server dw", &results.download_seq),
        )?;
        let csv = String::from_utf8(csv)?;
        let lines = csv.lines().collect::<Vec<_>>();
        assert_eq!(lines[0], "Server up,1,2,3");
        assert_eq!(lines[1].split(',').count(), 4);
        assert!(lines[2].starts_with("b,"));
        assert_eq!(lines[2].split(',').count(), 3);
        assert_eq!(lines[3], "");
        assert_eq!(lines[4], "Server dw,1,2,3");
        Ok(())
    }

    #[tokio::test]
    async fn sequential_failure_aborts_the_run() {
        let transfer = Arc::new(FakeTransfer::new().with_failing_file("file_2.json"));
        let scheduler =
            RoundScheduler::new(transfer.clone(), settings(3, 1), CancellationToken::new());
        let targets = [target("flask", None), target("gin", None)];

        // round 1 only transfers file_1, round 2 hits the failing file on the first target
        let err = scheduler
            .run(&targets, &file_set(3))
            .await
            .expect_err("sequential failure is fatal");

        let msg = format!("{:#}", err);
        assert!(msg.contains("round 2"));
        assert!(msg.contains("flask"));
        assert!(msg.contains("file_2.json"));
        assert!(transfer
            .attempts()
            .iter()
            .all(|(_, _, file_id)| file_id != "file_3.json"));
    }

    #[tokio::test]
    async fn storage_is_reset_before_each_target() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = dir.path().join("uploads");
        std::fs::create_dir_all(&storage)?;
        std::fs::write(storage.join("stale.json"), b"{}")?;

        let transfer = Arc::new(FakeTransfer::new());
        let scheduler = RoundScheduler::new(transfer, settings(1, 1), CancellationToken::new());
        scheduler
            .run(&[target("flask", Some(storage.clone()))], &file_set(1))
            .await?;

        assert!(storage.is_dir());
        assert!(!storage.join("stale.json").exists());
        Ok(())
    }

    #[tokio::test]
    async fn cancellation_stops_the_run() {
        let transfer = Arc::new(FakeTransfer::new().with_delay(Duration::from_millis(50)));
        let cancel = CancellationToken::new();
        let scheduler = RoundScheduler::new(transfer, settings(100, 10), cancel.clone());

        cancel.cancel();
        let res = scheduler.run(&[target("flask", None)], &file_set(100)).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn reset_creates_missing_dir() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = dir.path().join("nested").join("uploads");

        reset_storage(&storage).await?;
        assert!(storage.is_dir());
        Ok(())
    }
}
