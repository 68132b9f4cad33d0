//! CSV export of stored samples
//!
//! The export window defaults to the last `max_points` intervals ending now.
//! When the window holds more samples than `max_points`, evenly spaced samples
//! are kept (first and last always included).

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use tracing::info;

use crate::models::RateSample;
use crate::services::rate_repository::{RateSampleStore, RepositoryError};

const CSV_HEADER: [&str; 8] = [
    "bucket_ts",
    "official_susde_per_usde",
    "market_susde_per_usde",
    "deviation_pct",
    "notional_usde",
    "quote_quality",
    "status",
    "error",
];

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("from ({from}) must be before to ({to})")]
    InvalidWindow {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },

    #[error("export window out of range")]
    WindowOutOfRange,

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("failed to write {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl ExportWindow {
    /// Fill in missing bounds: `to` defaults to `now`, `from` to
    /// `to - max_points * interval`
    pub fn resolve(
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        interval: TimeDelta,
        max_points: usize,
    ) -> Result<Self, ExportError> {
        let to = to.unwrap_or(now);
        let from = match from {
            Some(from) => from,
            None => {
                let points = i32::try_from(max_points).map_err(|_| ExportError::WindowOutOfRange)?;
                let span = interval
                    .checked_mul(points)
                    .ok_or(ExportError::WindowOutOfRange)?;
                to.checked_sub_signed(span)
                    .ok_or(ExportError::WindowOutOfRange)?
            }
        };

        if from >= to {
            return Err(ExportError::InvalidWindow { from, to });
        }
        Ok(Self { from, to })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportSummary {
    pub total: usize,
    pub exported: usize,
}

/// Keep at most `max` evenly spaced samples
pub fn downsample(samples: Vec<RateSample>, max: usize) -> Vec<RateSample> {
    let len = samples.len();
    if max == 0 || len <= max {
        return samples;
    }
    if max == 1 {
        return samples.into_iter().take(1).collect();
    }

    let step = (len - 1) as f64 / (max - 1) as f64;
    (0..max)
        .map(|i| {
            let idx = ((step * i as f64).round() as usize).min(len - 1);
            samples[idx].clone()
        })
        .collect()
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn write_record<W: Write>(writer: &mut W, fields: &[String]) -> io::Result<()> {
    let line = fields
        .iter()
        .map(|f| csv_field(f))
        .collect::<Vec<_>>()
        .join(",");
    writeln!(writer, "{}", line)
}

pub fn write_samples_csv<W: Write>(writer: &mut W, samples: &[RateSample]) -> io::Result<()> {
    let header: Vec<String> = CSV_HEADER.iter().map(|h| h.to_string()).collect();
    write_record(writer, &header)?;

    for sample in samples {
        write_record(
            writer,
            &[
                sample.bucket.to_rfc3339_opts(SecondsFormat::Secs, true),
                sample.official_rate.normalize().to_string(),
                sample.market_rate.normalize().to_string(),
                sample.deviation_pct.normalize().to_string(),
                sample.notional.normalize().to_string(),
                sample.quote_quality.clone(),
                sample.status.to_string(),
                sample.error.clone().unwrap_or_default(),
            ],
        )?;
    }
    writer.flush()
}

/// Write the samples in `window` to `path` as CSV
///
/// # Arguments
///
/// * `store` - Sample source
/// * `path` - Output file; parent directories are created
/// * `window` - Half-open time range
/// * `max_points` - Upper bound on exported rows
pub async fn export_samples(
    store: &dyn RateSampleStore,
    path: &Path,
    window: ExportWindow,
    max_points: usize,
) -> Result<ExportSummary, ExportError> {
    let samples = store.list_samples_between(window.from, window.to).await?;
    if samples.is_empty() {
        info!(from = %window.from, to = %window.to, "No samples found for export window");
        return Ok(ExportSummary {
            total: 0,
            exported: 0,
        });
    }

    let total = samples.len();
    let selected = downsample(samples, max_points);
    info!(total, exported = selected.len(), path = %path.display(), "Exporting samples");

    let io_err = |source: io::Error| ExportError::Io {
        path: path.display().to_string(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let file = File::create(path).map_err(io_err)?;
    let mut writer = BufWriter::new(file);
    write_samples_csv(&mut writer, &selected).map_err(io_err)?;

    Ok(ExportSummary {
        total,
        exported: selected.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SampleStatus;
    use crate::services::memory_store::MemoryRateRepository;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn sample(minute: u32) -> RateSample {
        let bucket = Utc.with_ymd_and_hms(2026, 3, 14, 12, minute, 0).unwrap();
        RateSample {
            bucket,
            official_rate: dec!(0.850000000000000000),
            market_rate: dec!(0.867),
            deviation_pct: dec!(2.00000000),
            notional: dec!(10000),
            quote_quality: "optimal".to_string(),
            raw_quote: serde_json::json!({}),
            block_number: None,
            status: SampleStatus::Complete,
            error: None,
            created_at: bucket,
        }
    }

    #[test]
    fn test_downsample_keeps_endpoints() {
        let samples: Vec<_> = (0..10).map(sample).collect();
        let picked = downsample(samples.clone(), 4);
        let minutes: Vec<_> = picked.iter().map(|s| s.bucket).collect();
        assert_eq!(
            minutes,
            vec![samples[0].bucket, samples[3].bucket, samples[6].bucket, samples[9].bucket]
        );
    }

    #[test]
    fn test_downsample_noop_when_small() {
        let samples: Vec<_> = (0..3).map(sample).collect();
        assert_eq!(downsample(samples.clone(), 5).len(), 3);
        assert_eq!(downsample(samples.clone(), 0).len(), 3);
        assert_eq!(downsample(samples, 1).len(), 1);
    }

    #[test]
    fn test_csv_output() {
        let mut errored = sample(5);
        errored.status = SampleStatus::Errored;
        errored.error = Some("quote failed, \"no route\"".to_string());

        let mut out = Vec::new();
        write_samples_csv(&mut out, &[sample(0), errored]).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(
            lines[0],
            "bucket_ts,official_susde_per_usde,market_susde_per_usde,deviation_pct,notional_usde,quote_quality,status,error"
        );
        assert_eq!(lines[1], "2026-03-14T12:00:00Z,0.85,0.867,2,10000,optimal,complete,");
        assert_eq!(
            lines[2],
            "2026-03-14T12:05:00Z,0.85,0.867,2,10000,optimal,errored,\"quote failed, \"\"no route\"\"\""
        );
    }

    #[test]
    fn test_window_defaults() {
        let now = Utc.with_ymd_and_hms(2026, 3, 14, 12, 0, 0).unwrap();
        let window = ExportWindow::resolve(None, None, now, TimeDelta::minutes(5), 12).unwrap();
        assert_eq!(window.to, now);
        assert_eq!(window.from, Utc.with_ymd_and_hms(2026, 3, 14, 11, 0, 0).unwrap());
    }

    #[test]
    fn test_window_rejects_inverted_range() {
        let now = Utc::now();
        assert!(matches!(
            ExportWindow::resolve(Some(now), Some(now), now, TimeDelta::minutes(5), 10),
            Err(ExportError::InvalidWindow { .. })
        ));
    }

    #[tokio::test]
    async fn test_export_writes_file() {
        let store = MemoryRateRepository::new();
        for minute in [0, 5, 10] {
            store.upsert_sample(&sample(minute)).await.unwrap();
        }
        let dir = std::env::temp_dir().join(format!("depeg-watch-export-{}", std::process::id()));
        let path = dir.join("nested").join("samples.csv");

        let window = ExportWindow {
            from: Utc.with_ymd_and_hms(2026, 3, 14, 12, 0, 0).unwrap(),
            to: Utc.with_ymd_and_hms(2026, 3, 14, 12, 10, 0).unwrap(),
        };
        let summary = export_samples(&store, &path, window, 100).await.unwrap();

        assert_eq!(summary, ExportSummary { total: 2, exported: 2 });
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 3);
        fs::remove_dir_all(dir).unwrap();
    }
}
