/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{file_set::FileSet, round_scheduler::SchedulerSettings};
use anyhow::{anyhow, Context};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::Duration,
};

static EXAMPLE_CONFIG: &str = include_str!("templates/xferbench.toml");

// ******** ******** ********
// **    CONFIGURATION     **
// ******** ******** ********
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub bench: Bench,
    #[serde(default)]
    pub files: Files,
    #[serde(default)]
    pub readiness: Readiness,
    #[serde(rename(serialize = "target", deserialize = "target"), default)]
    pub targets: Vec<Target>,
}
impl Config {
    pub fn write_example_to_file(path: &Path) -> anyhow::Result<File> {
        let mut file = File::create_new(path)?;
        File::write_all(&mut file, EXAMPLE_CONFIG.as_bytes())?;
        Ok(file)
    }

    pub fn try_from_path(path: &Path) -> anyhow::Result<Config> {
        let mut config_str = String::new();
        fs::File::open(path)
            .context(format!("Unable to open config {}", path.to_string_lossy()))?
            .read_to_string(&mut config_str)?;
        Config::try_from_str(&config_str)
    }

    pub fn try_from_str(conf_str: &str) -> anyhow::Result<Config> {
        let config = toml::from_str::<Config>(conf_str)
            .map_err(|e| anyhow::anyhow!("TOML parsing error: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the invariants serde can't express: a non-empty registry of uniquely named
    /// targets with usable base urls and a workload that actually grows.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.targets.is_empty() {
            return Err(anyhow!("Config must declare at least one [[target]]"));
        }

        let duplicates = self
            .targets
            .iter()
            .map(|target| target.name.as_str())
            .duplicates()
            .collect_vec();
        if !duplicates.is_empty() {
            return Err(anyhow!(
                "Target names must be unique, found duplicates: {}",
                duplicates.join(", ")
            ));
        }

        for target in &self.targets {
            let url = reqwest::Url::parse(&target.url)
                .context(format!("Target {} has an invalid url {}", target.name, target.url))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(anyhow!(
                    "Target {} must use an http(s) url, got {}",
                    target.name,
                    target.url
                ));
            }
        }

        if self.bench.rounds == 0 {
            return Err(anyhow!("bench.rounds must be at least 1"));
        }
        if self.bench.batch_factor == 0 {
            return Err(anyhow!("bench.batch_factor must be at least 1"));
        }
        if self.bench.max_concurrency == Some(0) {
            return Err(anyhow!("bench.max_concurrency must be at least 1 when set"));
        }

        Ok(())
    }

    /// Builds the file set described by the `[files]` section, resolved against the data dir.
    pub fn file_set(&self) -> anyhow::Result<FileSet> {
        FileSet::generated(&self.bench.data_dir, self.files.count, &self.files.extra)
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            rounds: self.bench.rounds,
            batch_factor: self.bench.batch_factor,
            max_concurrency: self.bench.max_concurrency,
        }
    }
}

#[derive(Debug, Deserialize, PartialEq, Serialize, Clone)]
#[serde(default)]
pub struct Bench {
    pub rounds: u32,
    pub batch_factor: usize,
    pub data_dir: PathBuf,
    pub results_dir: PathBuf,
    pub request_timeout_ms: u64,
    pub probe_timeout_ms: u64,
    pub max_concurrency: Option<usize>,
}
impl Default for Bench {
    fn default() -> Self {
        Self {
            rounds: 100,
            batch_factor: 1000,
            data_dir: PathBuf::from("data"),
            results_dir: PathBuf::from("results"),
            request_timeout_ms: 60_000,
            probe_timeout_ms: 2_000,
            max_concurrency: None,
        }
    }
}
impl Bench {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[derive(Debug, Deserialize, PartialEq, Serialize, Clone)]
#[serde(default)]
pub struct Files {
    pub count: usize,
    pub extra: Vec<String>,
}
impl Default for Files {
    fn default() -> Self {
        Self {
            count: 1000,
            extra: vec!["large_text_file.txt".to_string()],
        }
    }
}

#[derive(Debug, Deserialize, PartialEq, Serialize, Clone)]
#[serde(default)]
pub struct Readiness {
    pub timeout_ms: u64,
    pub poll_interval_ms: u64,
}
impl Default for Readiness {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            poll_interval_ms: 250,
        }
    }
}
impl Readiness {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[derive(Debug, Deserialize, PartialEq, Clone, Copy, Serialize)]
#[serde(tag = "to", rename_all = "lowercase")]
pub enum Redirect {
    Null,
    Parent,
    File,
}

/// One file-transfer server under benchmark.
#[derive(Debug, Deserialize, PartialEq, Serialize, Clone)]
pub struct Target {
    pub name: String,
    pub url: String,
    /// Command that launches the server. Targets without one are expected to be running
    /// already.
    pub up: Option<String>,
    /// Directory the server persists uploads into, wiped before every round.
    pub storage_dir: Option<PathBuf>,
    pub redirect: Option<Redirect>,
}
impl Target {
    /// The base url without a trailing slash so paths can be appended directly.
    pub fn base_url(&self) -> &str {
        self.url.trim_end_matches('/')
    }
}
