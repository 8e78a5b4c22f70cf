//! Trailing rolling means over a dated series.

use super::Precision;
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::BTreeMap;

/// One dated point with its trailing means, keyed by window length.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RollingPoint {
    pub date: NaiveDate,
    pub value: f64,
    /// `None` until the series has at least `window` points.
    pub means: BTreeMap<usize, Option<f64>>,
}

/// Trailing means of `series` for each window length.
///
/// The series is sorted by date first; windows count points, not days.
pub fn rolling_means(
    series: &[(NaiveDate, f64)],
    windows: &[usize],
    precision: Precision,
) -> Vec<RollingPoint> {
    let mut sorted = series.to_vec();
    sorted.sort_by_key(|(date, _)| *date);

    let mut prefix = Vec::with_capacity(sorted.len() + 1);
    prefix.push(0.0);
    for (_, value) in &sorted {
        let last = prefix.last().copied().unwrap_or(0.0);
        prefix.push(last + value);
    }

    sorted
        .iter()
        .enumerate()
        .map(|(idx, (date, value))| {
            let means = windows
                .iter()
                .map(|&window| {
                    let mean = (window > 0 && idx + 1 >= window).then(|| {
                        let sum = prefix[idx + 1] - prefix[idx + 1 - window];
                        precision.round(sum / window as f64)
                    });
                    (window, mean)
                })
                .collect();
            RollingPoint {
                date: *date,
                value: precision.round(*value),
                means,
            }
        })
        .collect()
}
