/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::config::Target;
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::{
    fmt,
    path::PathBuf,
    time::{Duration, Instant},
};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Upload,
    Download,
}
impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upload => write!(f, "upload"),
            Direction::Download => write!(f, "download"),
        }
    }
}

pub fn health_url(target: &Target) -> String {
    format!("{}/health", target.base_url())
}

pub fn upload_url(target: &Target, file_id: &str) -> String {
    format!("{}/upload/{}", target.base_url(), file_id)
}

pub fn download_url(target: &Target, file_id: &str) -> String {
    format!("{}/download/{}", target.base_url(), file_id)
}

/// Everything the harness does over the wire. Implemented over HTTP for real runs and by
/// fakes in the tests.
#[async_trait]
pub trait Transfer: Send + Sync {
    /// Liveness check. Never fails, an unavailable target is simply `false`.
    async fn probe(&self, target: &Target) -> bool;

    /// Uploads one file and returns how long the request took.
    async fn upload_one(&self, target: &Target, file_id: &str) -> anyhow::Result<Duration>;

    /// Downloads one file, discarding its content, and returns how long the request took.
    async fn download_one(&self, target: &Target, file_id: &str) -> anyhow::Result<Duration>;

    async fn transfer_one(
        &self,
        target: &Target,
        direction: Direction,
        file_id: &str,
    ) -> anyhow::Result<Duration> {
        match direction {
            Direction::Upload => self.upload_one(target, file_id).await,
            Direction::Download => self.download_one(target, file_id).await,
        }
    }
}

pub struct HttpTransfer {
    client: reqwest::Client,
    data_dir: PathBuf,
    probe_timeout: Duration,
}
impl HttpTransfer {
    /// # Arguments
    ///
    /// * data_dir - Directory holding the local artifacts to upload.
    /// * request_timeout - Upper bound for a single upload or download request.
    /// * probe_timeout - Upper bound for a health check.
    pub fn new(
        data_dir: impl Into<PathBuf>,
        request_timeout: Duration,
        probe_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("Unable to build http client")?;

        Ok(Self {
            client,
            data_dir: data_dir.into(),
            probe_timeout,
        })
    }
}

#[async_trait]
impl Transfer for HttpTransfer {
    async fn probe(&self, target: &Target) -> bool {
        let url = health_url(target);
        match self
            .client
            .get(&url)
            .timeout(self.probe_timeout)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                debug!("target {} is available", target.name);
                true
            }
            Ok(resp) => {
                warn!(
                    "target {} is not available, {} returned {}",
                    target.name,
                    url,
                    resp.status()
                );
                false
            }
            Err(err) => {
                warn!("target {} is not responding: {}", target.name, err);
                false
            }
        }
    }

    async fn upload_one(&self, target: &Target, file_id: &str) -> anyhow::Result<Duration> {
        let start = Instant::now();

        let path = self.data_dir.join(file_id);
        let bytes = tokio::fs::read(&path)
            .await
            .context(format!("Error reading file {}", path.to_string_lossy()))?;

        let resp = self
            .client
            .post(upload_url(target, file_id))
            .header(http::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes)
            .send()
            .await
            .context(format!(
                "Error uploading file {} to {}",
                file_id, target.name
            ))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!(
                "Error uploading file {} to {}: server returned {}",
                file_id,
                target.name,
                status
            ));
        }

        // let the connection return to the pool
        if let Err(err) = resp.bytes().await {
            debug!(
                "Error reading upload response of {} from {}: {}",
                file_id, target.name, err
            );
        }

        Ok(start.elapsed())
    }

    async fn download_one(&self, target: &Target, file_id: &str) -> anyhow::Result<Duration> {
        let start = Instant::now();

        let resp = self
            .client
            .get(download_url(target, file_id))
            .send()
            .await
            .context(format!(
                "Error downloading file {} from {}",
                file_id, target.name
            ))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!(
                "Error downloading file {} from {}: server returned {}",
                file_id,
                target.name,
                status
            ));
        }

        // only a complete transfer counts, the content itself is irrelevant
        let mut body = resp.bytes_stream();
        while let Some(chunk) = body.next().await {
            chunk.context(format!(
                "Error reading body of {} from {}",
                file_id, target.name
            ))?;
        }

        Ok(start.elapsed())
    }
}


#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::{collections::HashSet, sync::Mutex};

    /// An in-memory `Transfer` that records every call and fails on demand.
    #[derive(Default)]
    pub struct FakeTransfer {
        unavailable: HashSet<String>,
        failing_probes: HashSet<(String, usize)>,
        failing_files: HashSet<String>,
        delay: Duration,
        probes: Mutex<Vec<String>>,
        attempts: Mutex<Vec<(String, Direction, String)>>,
    }
    impl FakeTransfer {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_unavailable(mut self, target_name: &str) -> Self {
            self.unavailable.insert(target_name.to_string());
            self
        }

        /// Makes only the `nth` probe (1-based) of the target fail.
        pub fn with_failing_probe(mut self, target_name: &str, nth: usize) -> Self {
            self.failing_probes.insert((target_name.to_string(), nth));
            self
        }

        pub fn with_failing_file(mut self, file_id: &str) -> Self {
            self.failing_files.insert(file_id.to_string());
            self
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub fn probes(&self) -> Vec<String> {
            self.probes.lock().expect("probes lock").clone()
        }

        pub fn attempts(&self) -> Vec<(String, Direction, String)> {
            self.attempts.lock().expect("attempts lock").clone()
        }

        pub fn attempted_files(&self, direction: Direction) -> Vec<String> {
            self.attempts()
                .into_iter()
                .filter(|(_, dir, _)| *dir == direction)
                .map(|(_, _, file_id)| file_id)
                .collect()
        }

        async fn record(
            &self,
            target: &Target,
            direction: Direction,
            file_id: &str,
        ) -> anyhow::Result<Duration> {
            self.attempts.lock().expect("attempts lock").push((
                target.name.clone(),
                direction,
                file_id.to_string(),
            ));

            tokio::time::sleep(self.delay).await;
            if self.failing_files.contains(file_id) {
                return Err(anyhow!("injected {} failure for {}", direction, file_id));
            }
            Ok(self.delay)
        }
    }

    #[async_trait]
    impl Transfer for FakeTransfer {
        async fn probe(&self, target: &Target) -> bool {
            let nth = {
                let mut probes = self.probes.lock().expect("probes lock");
                probes.push(target.name.clone());
                probes.iter().filter(|name| **name == target.name).count()
            };
            !self.unavailable.contains(&target.name)
                && !self.failing_probes.contains(&(target.name.clone(), nth))
        }

        async fn upload_one(&self, target: &Target, file_id: &str) -> anyhow::Result<Duration> {
            self.record(target, Direction::Upload, file_id).await
        }

        async fn download_one(&self, target: &Target, file_id: &str) -> anyhow::Result<Duration> {
            self.record(target, Direction::Download, file_id).await
        }
    }
}
