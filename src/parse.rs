// src/parse.rs
//! Pipe-delimited snapshot parsing.
//!
//! Snapshot files look like:
//!
//! ```text
//! #BOF|2025.04.14|19:06:47
//! #SYM|CUR|NAME|CON|ISIN|REBATERATE|FEERATE|AVAILABLE
//! AAPL|USD|APPLE INC|265598|US0378331005|-0.25|0.25|9000000
//! #EOF
//! ```
//!
//! Malformed lines are skipped and counted, never abort the file. A file
//! with zero parseable rows is a data-quality failure, not an empty result.

use chrono::{DateTime, NaiveDateTime, Utc};
use once_cell::sync::OnceCell;
use regex::Regex;
use std::collections::BTreeMap;

use crate::error::{PipelineError, Result};
use crate::types::{IdentityKey, ObservedFields, Record};

#[derive(Debug)]
pub struct ParsedSnapshot {
    pub records: Vec<Record>,
    /// Capture time from the `#BOF` header, or the caller's fallback.
    pub captured_at: DateTime<Utc>,
    pub skipped_lines: usize,
}

/// Country tag from the remote file stem (`loan/usa.txt` → `USA`).
pub fn country_from_path(remote_path: &str) -> String {
    let file = remote_path.rsplit('/').next().unwrap_or(remote_path);
    let stem = file.rsplit_once('.').map(|(s, _)| s).unwrap_or(file);
    stem.to_ascii_uppercase()
}

fn parse_bof_timestamp(line: &str) -> Option<DateTime<Utc>> {
    static RE: OnceCell<Regex> = OnceCell::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"^#BOF\|(\d{4}\.\d{2}\.\d{2})\|(\d{2}:\d{2}:\d{2})").unwrap()
    });
    let caps = re.captures(line.trim())?;
    let stamp = format!("{} {}", &caps[1], &caps[2]);
    NaiveDateTime::parse_from_str(&stamp, "%Y.%m.%d %H:%M:%S")
        .ok()
        .map(|n| n.and_utc())
}

/// `NA`, empty, or unparseable numerics are missing, not zero. Values like
/// `>10000000` fall through to `None` the same way.
fn parse_numeric(raw: &str) -> Option<f64> {
    let t = raw.trim();
    if t.is_empty() || t.eq_ignore_ascii_case("na") {
        return None;
    }
    t.parse::<f64>().ok()
}

fn non_empty(raw: &str) -> Option<String> {
    let t = raw.trim();
    if t.is_empty() || t.eq_ignore_ascii_case("na") {
        None
    } else {
        Some(t.to_string())
    }
}

pub fn parse_snapshot(
    text: &str,
    country: &str,
    fallback_ts: DateTime<Utc>,
) -> Result<ParsedSnapshot> {
    let mut header: Option<BTreeMap<String, usize>> = None;
    let mut captured_at: Option<DateTime<Utc>> = None;
    let mut saw_eof = false;
    let mut skipped = 0usize;
    let mut records = Vec::new();

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with("#BOF") {
            captured_at = parse_bof_timestamp(line);
            if captured_at.is_none() {
                tracing::warn!(line, "unparseable #BOF timestamp, using fallback");
            }
            continue;
        }
        if line.starts_with("#EOF") {
            saw_eof = true;
            continue;
        }
        if line.to_ascii_uppercase().starts_with("#SYM|") {
            let cols = line[1..]
                .split('|')
                .map(|c| c.trim().to_ascii_uppercase())
                .filter(|c| !c.is_empty())
                .enumerate()
                .map(|(i, c)| (c, i))
                .collect();
            header = Some(cols);
            continue;
        }
        if line.starts_with('#') {
            continue;
        }

        let Some(cols) = header.as_ref() else {
            // Data before any header is unusable.
            skipped += 1;
            continue;
        };

        let fields: Vec<&str> = line.split('|').map(str::trim).collect();
        let field = |name: &str| -> &str {
            cols.get(name)
                .and_then(|&i| fields.get(i).copied())
                .unwrap_or("")
        };

        let symbol = field("SYM").trim().to_ascii_uppercase();
        if symbol.is_empty() {
            skipped += 1;
            continue;
        }
        let currency = {
            let c = field("CUR");
            let c = if c.is_empty() { field("CURRENCY") } else { c };
            c.trim().to_ascii_uppercase()
        };

        let ts = captured_at.unwrap_or(fallback_ts);
        records.push(Record {
            key: IdentityKey::new(symbol, currency),
            observed: ObservedFields {
                fee_rate: parse_numeric(field("FEERATE")),
                rebate_rate: parse_numeric(field("REBATERATE")),
                available: parse_numeric(field("AVAILABLE")),
                name: non_empty(field("NAME")),
                country: Some(country.to_string()),
            },
            observed_at: ts,
        });
    }

    if header.is_none() {
        return Err(PipelineError::data_quality("no #SYM header found"));
    }
    if records.is_empty() {
        return Err(PipelineError::data_quality("no parseable data rows"));
    }
    if !saw_eof {
        tracing::warn!("missing #EOF sentinel, file may be truncated");
    }

    Ok(ParsedSnapshot {
        records,
        captured_at: captured_at.unwrap_or(fallback_ts),
        skipped_lines: skipped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const SAMPLE: &str = "\
#BOF|2025.04.14|19:06:47
#SYM|CUR|NAME|CON|ISIN|REBATERATE|FEERATE|AVAILABLE
AAPL|USD|APPLE INC|265598|US0378331005|-0.25|0.25|9000000
TSLA|USD|TESLA INC|76792991|US88160R1014|NA|1.5|>100000
|USD|NO SYMBOL|1|X|0|0|0
#EOF
";

    fn fallback() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn parses_bof_timestamp_and_rows() {
        let out = parse_snapshot(SAMPLE, "USA", fallback()).unwrap();
        assert_eq!(
            out.captured_at,
            Utc.with_ymd_and_hms(2025, 4, 14, 19, 6, 47).unwrap()
        );
        assert_eq!(out.records.len(), 2);
        assert_eq!(out.skipped_lines, 1);

        let aapl = &out.records[0];
        assert_eq!(aapl.key, IdentityKey::new("AAPL", "USD"));
        assert_eq!(aapl.observed.fee_rate, Some(0.25));
        assert_eq!(aapl.observed.rebate_rate, Some(-0.25));
        assert_eq!(aapl.observed.country.as_deref(), Some("USA"));
    }

    #[test]
    fn unparseable_numerics_are_missing_not_zero() {
        let out = parse_snapshot(SAMPLE, "USA", fallback()).unwrap();
        let tsla = &out.records[1];
        assert_eq!(tsla.observed.rebate_rate, None); // NA
        assert_eq!(tsla.observed.available, None); // ">100000"
        assert_eq!(tsla.observed.fee_rate, Some(1.5));
    }

    #[test]
    fn missing_header_is_data_quality() {
        let err = parse_snapshot("AAPL|USD|0.25\n", "USA", fallback()).unwrap_err();
        assert!(matches!(err, PipelineError::DataQuality(_)));
    }

    #[test]
    fn zero_rows_is_data_quality_not_empty_result() {
        let text = "#BOF|2025.04.14|19:06:47\n#SYM|CUR|FEERATE\n#EOF\n";
        let err = parse_snapshot(text, "USA", fallback()).unwrap_err();
        assert!(matches!(err, PipelineError::DataQuality(_)));
    }

    #[test]
    fn missing_bof_uses_fallback_timestamp() {
        let text = "#SYM|CUR|FEERATE\nAAPL|USD|0.5\n#EOF\n";
        let out = parse_snapshot(text, "USA", fallback()).unwrap();
        assert_eq!(out.captured_at, fallback());
        assert_eq!(out.records[0].observed_at, fallback());
    }

    #[test]
    fn country_tag_comes_from_file_stem() {
        assert_eq!(country_from_path("loan/usa.txt"), "USA");
        assert_eq!(country_from_path("germany.txt"), "GERMANY");
    }
}
