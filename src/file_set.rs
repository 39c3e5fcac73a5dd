/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use anyhow::anyhow;
use std::path::{Path, PathBuf};

/// Returns the identifier of the `n`th generated benchmark file (1 based).
pub fn numbered_file_id(n: usize) -> String {
    format!("file_{}.json", n)
}

/// File identifiers are embedded in request paths and used as file names on the server, so
/// they must be a single, plain path segment.
pub fn validate_file_id(file_id: &str) -> anyhow::Result<()> {
    if file_id.is_empty() || file_id == "." || file_id == ".." {
        return Err(anyhow!("Invalid file identifier {:?}", file_id));
    }

    match file_id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        Some(c) => Err(anyhow!(
            "Invalid file identifier {:?}, unexpected character {:?}",
            file_id,
            c
        )),
        None => Ok(()),
    }
}

/// The ordered set of files transferred during a run. Fixed at construction; rounds take
/// growing prefixes of it.
#[derive(Debug, Clone)]
pub struct FileSet {
    data_dir: PathBuf,
    ids: Vec<String>,
}
impl FileSet {
    pub fn new(data_dir: impl Into<PathBuf>, ids: Vec<String>) -> anyhow::Result<Self> {
        for id in &ids {
            validate_file_id(id)?;
        }

        Ok(Self {
            data_dir: data_dir.into(),
            ids,
        })
    }

    /// `file_1.json ..= file_<count>.json` followed by any extra files, in that order.
    pub fn generated(data_dir: &Path, count: usize, extra: &[String]) -> anyhow::Result<Self> {
        let ids = (1..=count)
            .map(numbered_file_id)
            .chain(extra.iter().cloned())
            .collect();

        FileSet::new(data_dir, ids)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn local_path(&self, file_id: &str) -> PathBuf {
        self.data_dir.join(file_id)
    }

    /// Number of files transferred in the given round: `min(batch_factor * round, len)`.
    pub fn workload_size(&self, round: u32, batch_factor: usize) -> usize {
        batch_factor
            .saturating_mul(round as usize)
            .min(self.ids.len())
    }

    /// The files transferred in the given round, always a prefix of the whole set.
    pub fn workload(&self, round: u32, batch_factor: usize) -> &[String] {
        &self.ids[..self.workload_size(round, batch_factor)]
    }

    /// Identifiers whose local artifact is missing from the data dir.
    pub fn missing_files(&self) -> Vec<&str> {
        self.ids
            .iter()
            .filter(|id| !self.local_path(id).is_file())
            .map(|id| id.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_set(count: usize) -> FileSet {
        FileSet::generated(Path::new("data"), count, &["large_text_file.txt".to_string()])
            .expect("generated ids are valid")
    }

    #[test]
    fn generated_set_keeps_order() {
        let files = file_set(3);
        assert_eq!(
            files.ids(),
            ["file_1.json", "file_2.json", "file_3.json", "large_text_file.txt"]
        );
        assert_eq!(files.local_path("file_2.json"), Path::new("data/file_2.json"));
    }

    #[test]
    fn workload_is_capped_by_file_count() {
        let files = file_set(1000);
        assert_eq!(files.workload_size(1, 1000), 1000);
        assert_eq!(files.workload_size(2, 1000), 1001);
        assert_eq!(files.workload_size(100, 1000), 1001);
        assert_eq!(files.workload_size(u32::MAX, usize::MAX), 1001);
    }

    #[test]
    fn workload_grows_monotonically_as_prefixes() {
        let files = file_set(20);
        let batch_factor = 3;

        for r1 in 1..10u32 {
            for r2 in r1 + 1..=10 {
                let w1 = files.workload(r1, batch_factor);
                let w2 = files.workload(r2, batch_factor);
                assert!(w2.len() >= w1.len());
                assert_eq!(&w2[..w1.len()], w1);
                assert_eq!(&files.ids()[..w2.len()], w2);
            }
        }
    }

    #[test]
    fn identifiers_must_be_plain_segments() {
        assert!(validate_file_id("file_1.json").is_ok());
        assert!(validate_file_id("large-text.txt").is_ok());

        assert!(validate_file_id("").is_err());
        assert!(validate_file_id("..").is_err());
        assert!(validate_file_id("data/file_1.json").is_err());
        assert!(validate_file_id("file?x=1").is_err());
        assert!(validate_file_id("file 1.json").is_err());
        assert!(validate_file_id("file#1").is_err());
    }

    #[test]
    fn invalid_identifier_rejects_the_whole_set() {
        let res = FileSet::new("data", vec!["ok.json".to_string(), "../etc".to_string()]);
        assert!(res.is_err());
    }

    #[test]
    fn missing_files_are_reported() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("a.json"), b"{}")?;

        let files = FileSet::new(dir.path(), vec!["a.json".to_string(), "b.json".to_string()])?;
        assert_eq!(files.missing_files(), vec!["b.json"]);
        Ok(())
    }
}
