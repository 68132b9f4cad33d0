//! Tabular views of stored samples and alerts for the `show` command

use chrono::SecondsFormat;
use rust_decimal::{Decimal, RoundingStrategy};

use crate::models::{AlertRecord, RateSample};

const COLUMN_GAP: usize = 2;

fn fixed(value: Decimal, places: u32) -> String {
    format!(
        "{:.*}",
        places as usize,
        value.round_dp_with_strategy(places, RoundingStrategy::MidpointAwayFromZero)
    )
}

/// Collapse whitespace so multi-line errors stay on one row
fn inline(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Left-aligned columns padded to the widest cell
fn render_table(header: &[&str], rows: Vec<Vec<String>>) -> String {
    let mut widths: Vec<usize> = header.iter().map(|h| h.chars().count()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.chars().count());
        }
    }

    let header_row: Vec<String> = header.iter().map(|h| h.to_string()).collect();
    let mut out = String::new();
    for row in std::iter::once(&header_row).chain(rows.iter()) {
        let last = row.len().saturating_sub(1);
        let mut line = String::new();
        for (i, cell) in row.iter().enumerate() {
            line.push_str(cell);
            if i < last {
                let pad = widths[i] - cell.chars().count() + COLUMN_GAP;
                line.extend(std::iter::repeat(' ').take(pad));
            }
        }
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}

pub fn render_samples_table(samples: &[RateSample]) -> String {
    if samples.is_empty() {
        return "no samples found\n".to_string();
    }

    let rows = samples
        .iter()
        .map(|s| {
            vec![
                s.bucket.to_rfc3339_opts(SecondsFormat::Secs, true),
                fixed(s.official_rate, 3),
                fixed(s.market_rate, 3),
                fixed(s.deviation_pct, 3),
                s.quote_quality.clone(),
                s.status.to_string(),
                s.error.as_deref().map(inline).unwrap_or_default(),
            ]
        })
        .collect();

    render_table(
        &["Time (UTC)", "Official", "Market", "Deviation%", "Quality", "Status", "Error"],
        rows,
    )
}

pub fn render_alerts_table(alerts: &[AlertRecord]) -> String {
    if alerts.is_empty() {
        return "no alerts found\n".to_string();
    }

    let rows = alerts
        .iter()
        .map(|a| {
            vec![
                a.sample_bucket.to_rfc3339_opts(SecondsFormat::Secs, true),
                fixed(a.deviation_pct, 3),
                fixed(a.threshold_pct, 3),
                a.direction.to_string(),
                a.channels.join(","),
                a.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            ]
        })
        .collect();

    render_table(
        &["Bucket (UTC)", "Deviation%", "Threshold%", "Direction", "Channels", "Created"],
        rows,
    )
}
