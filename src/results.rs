/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use anyhow::Context;
use colored::Colorize;
use itertools::Itertools;
use std::{
    fs::{self, File},
    io::Write,
    path::Path,
    time::Duration,
};
use term_table::{row::Row, table_cell::TableCell, Table, TableStyle};
use tracing::warn;

pub const SEQUENTIAL_FILE: &str = "results.csv";
pub const PARALLEL_FILE: &str = "results_mn.csv";

/// Per-target timing samples in whole milliseconds, one per round the target took part in.
///
/// Rows keep the order in which targets were first recorded. A target that skipped a round has
/// a shorter row; rows are never padded.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SampleTable {
    rows: Vec<(String, Vec<u64>)>,
}
impl SampleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, target_name: &str, elapsed: Duration) {
        self.record_millis(target_name, elapsed.as_millis() as u64);
    }

    pub fn record_millis(&mut self, target_name: &str, millis: u64) {
        match self.rows.iter_mut().find(|(name, _)| name == target_name) {
            Some((_, samples)) => samples.push(millis),
            None => self.rows.push((target_name.to_string(), vec![millis])),
        }
    }

    pub fn samples(&self, target_name: &str) -> Option<&[u64]> {
        self.rows
            .iter()
            .find(|(name, _)| name == target_name)
            .map(|(_, samples)| samples.as_slice())
    }

    pub fn rows(&self) -> impl Iterator<Item = (&str, &[u64])> {
        self.rows
            .iter()
            .map(|(name, samples)| (name.as_str(), samples.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Length of the longest row, which is the number of round columns in the header.
    pub fn width(&self) -> usize {
        self.rows
            .iter()
            .map(|(_, samples)| samples.len())
            .max()
            .unwrap_or(0)
    }

    /// Targets whose row is shorter than the widest one.
    pub fn short_rows(&self) -> Vec<&str> {
        let width = self.width();
        self.rows
            .iter()
            .filter(|(_, samples)| samples.len() < width)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// Timings of one target in one round, across the four modes.
#[derive(Debug, Clone, Copy)]
pub struct TargetRound {
    pub upload_seq: Duration,
    pub download_seq: Duration,
    pub upload_par: Duration,
    pub download_par: Duration,
}

/// The four sample tables collected during a run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RoundResults {
    pub upload_seq: SampleTable,
    pub download_seq: SampleTable,
    pub upload_par: SampleTable,
    pub download_par: SampleTable,
}
impl RoundResults {
    pub fn record(&mut self, target_name: &str, round: TargetRound) {
        self.upload_seq.record(target_name, round.upload_seq);
        self.download_seq.record(target_name, round.download_seq);
        self.upload_par.record(target_name, round.upload_par);
        self.download_par.record(target_name, round.download_par);
    }

    fn labelled(&self) -> [(&'static str, &SampleTable); 4] {
        [
            ("Server up", &self.upload_seq),
            ("Server dw", &self.download_seq),
            ("Server up (parallel)", &self.upload_par),
            ("Server dw (parallel)", &self.download_par),
        ]
    }
}

/// Writes a header `<row_label>,1,..,<width>` followed by one row per target.
pub fn write_table<W: Write>(
    writer: &mut csv::Writer<W>,
    row_label: &str,
    table: &SampleTable,
) -> anyhow::Result<()> {
    let header = std::iter::once(row_label.to_string())
        .chain((1..=table.width()).map(|round| round.to_string()))
        .collect_vec();
    writer.write_record(&header)?;

    for (name, samples) in table.rows() {
        let row = std::iter::once(name.to_string())
            .chain(samples.iter().map(|ms| ms.to_string()))
            .collect_vec();
        writer.write_record(&row)?;
    }

    let short_rows = table.short_rows();
    if !short_rows.is_empty() {
        warn!(
            "{}: {} skipped rounds, their rows are shorter than the header",
            row_label,
            short_rows.join(", ")
        );
    }

    Ok(())
}

/// Writes two tables separated by an empty line.
pub fn write_table_pair<W: Write>(
    out: &mut W,
    first: (&str, &SampleTable),
    second: (&str, &SampleTable),
) -> anyhow::Result<()> {
    write_csv(out, first)?;
    out.write_all(b"\n")?;
    write_csv(out, second)?;
    out.flush()?;
    Ok(())
}

fn write_csv<W: Write>(
    out: &mut W,
    (row_label, table): (&str, &SampleTable),
) -> anyhow::Result<()> {
    let mut writer = csv::WriterBuilder::new().flexible(true).from_writer(out);
    write_table(&mut writer, row_label, table)?;
    writer.flush()?;
    Ok(())
}

/// The two result files of a run, created before any round runs so that an unwritable results
/// dir aborts the run early.
pub struct ResultFiles {
    sequential: File,
    parallel: File,
}
impl ResultFiles {
    pub fn create(results_dir: &Path) -> anyhow::Result<Self> {
        fs::create_dir_all(results_dir).context(format!(
            "Error creating results dir {}",
            results_dir.to_string_lossy()
        ))?;

        let open = |name: &str| {
            let path = results_dir.join(name);
            File::create(&path)
                .context(format!("Error creating CSV file {}", path.to_string_lossy()))
        };

        Ok(Self {
            sequential: open(SEQUENTIAL_FILE)?,
            parallel: open(PARALLEL_FILE)?,
        })
    }

    pub fn write(mut self, results: &RoundResults) -> anyhow::Result<()> {
        let [upload_seq, download_seq, upload_par, download_par] = results.labelled();
        write_table_pair(&mut self.sequential, upload_seq, download_seq)
            .context(format!("Error writing {}", SEQUENTIAL_FILE))?;
        write_table_pair(&mut self.parallel, upload_par, download_par)
            .context(format!("Error writing {}", PARALLEL_FILE))?;
        Ok(())
    }
}

/// Prints the number of rounds and the last sample of every target, per table.
pub fn print_summary(results: &RoundResults) {
    println!("\n{}", " Summary ".reversed().green());

    for (label, table) in results.labelled() {
        if let Some(rendered) = render_summary_table(label, table) {
            println!("{}", rendered);
        }
    }
}

fn render_summary_table(label: &str, table: &SampleTable) -> Option<String> {
    if table.is_empty() {
        return None;
    }

    let mut rows = vec![Row::new(vec![
        TableCell::new(label.bold()),
        TableCell::new("Rounds".bold()),
        TableCell::new("Last (ms)".bold()),
    ])];
    for (name, samples) in table.rows() {
        let last = samples.last().map(|ms| ms.to_string());

        rows.push(Row::new(vec![
            TableCell::new(name.green()),
            TableCell::new(samples.len()),
            TableCell::new(last.unwrap_or("--".to_string())),
        ]));
    }

    let table = Table::builder()
        .rows(rows)
        .style(TableStyle::rounded())
        .build();
    Some(table.render())
}
