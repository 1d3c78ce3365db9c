//! Statistics over the report files written by earlier runs, so the three
//! modes can be compared side by side.

use std::{fmt, io, path::Path};

use tracing::{debug, warn};

use crate::{config::Mode, error::Error, telemetry::REPORT_PREFIX};

/// Summary of one report file's per-interval rates.
#[derive(Debug, Clone, PartialEq)]
pub struct RateSummary {
    pub samples: usize,
    pub mean: f64,
    pub median: f64,
    pub min: u64,
    pub max: u64,
    /// Population standard deviation.
    pub std_dev: f64,
}

impl fmt::Display for RateSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Average: {:.2}, Median: {}, Min: {}, Max: {}, Std Dev: {:.2}",
            self.mean, self.median, self.min, self.max, self.std_dev
        )
    }
}

/// Returns `None` for an empty series.
pub fn summarize(counts: &[u64]) -> Option<RateSummary> {
    let min = *counts.iter().min()?;
    let max = *counts.iter().max()?;
    let n = counts.len() as f64;
    let mean = counts.iter().map(|&c| c as f64).sum::<f64>() / n;
    let variance = counts
        .iter()
        .map(|&c| (c as f64 - mean).powi(2))
        .sum::<f64>()
        / n;

    let mut sorted = counts.to_vec();
    sorted.sort_unstable();
    let mid = sorted.len() / 2;
    let median = if sorted.len() % 2 == 0 {
        (sorted[mid - 1] as f64 + sorted[mid] as f64) / 2.0
    } else {
        sorted[mid] as f64
    };

    Some(RateSummary {
        samples: counts.len(),
        mean,
        median,
        min,
        max,
        std_dev: variance.sqrt(),
    })
}

/// Reads the rates out of a report file's contents. Lines that aren't
/// report lines are skipped.
pub fn parse_report(contents: &str) -> Vec<u64> {
    contents
        .lines()
        .enumerate()
        .filter_map(|(n, line)| {
            let count = line
                .strip_prefix(REPORT_PREFIX)
                .and_then(|count| count.trim().parse().ok());
            if count.is_none() && !line.trim().is_empty() {
                warn!(line = n + 1, "skipping malformed report line");
            }
            count
        })
        .collect()
}

/// Summarizes each mode's report file in `dir`. Modes that haven't been run
/// there yet are left out.
pub async fn summarize_reports(
    dir: &Path,
) -> Result<Vec<(Mode, Option<RateSummary>)>, Error> {
    let mut summaries = Vec::new();
    for mode in [Mode::Sequential, Mode::Parallel, Mode::Distributed] {
        let path = dir.join(mode.report_file());
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no report for this mode");
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        summaries.push((mode, summarize(&parse_report(&contents))));
    }
    Ok(summaries)
}
