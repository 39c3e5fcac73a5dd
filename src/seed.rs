/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::file_set::numbered_file_id;
use anyhow::Context;
use rand::{distributions::Alphanumeric, Rng};
use serde::Serialize;
use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};
use tracing::info;

pub const LARGE_FILE_NAME: &str = "large_text_file.txt";
const LINE_LEN: usize = 10_024;
const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
const TEXT: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789 ";

#[derive(Debug, Serialize)]
pub struct Record {
    pub id: u32,
    pub name: String,
    pub value: f64,
    pub description: String,
}

fn pick<R: Rng>(rng: &mut R, charset: &[u8]) -> u8 {
    charset[rng.gen_range(0..charset.len())]
}

pub fn random_record<R: Rng>(rng: &mut R) -> Record {
    Record {
        id: rng.gen_range(1..=1000),
        name: (0..10).map(|_| pick(rng, LETTERS) as char).collect(),
        value: rng.gen(),
        description: (0..20)
            .map(|_| char::from(rng.sample(Alphanumeric)))
            .collect(),
    }
}

/// Writes lines of random text until the file holds at least `min_bytes`.
pub fn write_large_text_file<R: Rng>(
    path: &Path,
    min_bytes: u64,
    rng: &mut R,
) -> anyhow::Result<u64> {
    let file = File::create(path).context(format!("Error creating {}", path.to_string_lossy()))?;
    let mut writer = BufWriter::new(file);

    let mut line = Vec::with_capacity(LINE_LEN + 1);
    let mut written = 0u64;
    while written < min_bytes {
        line.clear();
        line.extend((0..LINE_LEN).map(|_| pick(rng, TEXT)));
        line.push(b'\n');

        writer.write_all(&line)?;
        written += line.len() as u64;
    }
    writer.flush()?;

    Ok(written)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedReport {
    pub json_files: usize,
    pub large_file: Option<PathBuf>,
    pub large_file_bytes: u64,
}

/// Populates `data_dir` with `file_1.json ..= file_<count>.json` and, unless `large_file_mb`
/// is zero, a large text file.
pub fn seed_data<R: Rng>(
    data_dir: &Path,
    count: usize,
    large_file_mb: u64,
    rng: &mut R,
) -> anyhow::Result<SeedReport> {
    fs::create_dir_all(data_dir).context(format!(
        "Error creating data dir {}",
        data_dir.to_string_lossy()
    ))?;

    for n in 1..=count {
        let path = data_dir.join(numbered_file_id(n));
        let file =
            File::create(&path).context(format!("Error creating {}", path.to_string_lossy()))?;
        serde_json::to_writer(file, &random_record(rng))?;
    }
    info!("wrote {} json files to {}", count, data_dir.to_string_lossy());

    let (large_file, large_file_bytes) = if large_file_mb > 0 {
        let path = data_dir.join(LARGE_FILE_NAME);
        let bytes = write_large_text_file(&path, large_file_mb * 1024 * 1024, rng)?;
        info!("wrote {} bytes to {}", bytes, path.to_string_lossy());
        (Some(path), bytes)
    } else {
        (None, 0)
    };

    Ok(SeedReport {
        json_files: count,
        large_file,
        large_file_bytes,
    })
}
