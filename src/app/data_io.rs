use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{SecondsFormat, Utc};
use clap::ValueEnum;
use regex::Regex;

use super::error::{Result, ScrapeError};
use super::state::PropertyRecord;

const FEATURE_COLUMN_PREFIX: &str = "Feature: ";
const FEATURE_SEPARATOR: &str = "; ";

static LINE_BREAKS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\r\n]+").expect("line break pattern"));
static ROOM_COUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\d+\s*(bed|bath|car|garage|park)").expect("room count pattern")
});

#[derive(Debug, Copy, Clone, ValueEnum, PartialEq, Eq)]
pub enum DataFormat {
    Csv,
    Json,
}

impl DataFormat {
    fn extension(self) -> &'static str {
        match self {
            DataFormat::Csv => "csv",
            DataFormat::Json => "json",
        }
    }
}

pub fn detect_data_format(path: &str, fallback: DataFormat) -> DataFormat {
    let lower = path.to_ascii_lowercase();
    if lower.ends_with(".json") {
        DataFormat::Json
    } else if lower.ends_with(".csv") {
        DataFormat::Csv
    } else {
        fallback
    }
}

pub fn default_export_path(dir: &Path, format: DataFormat) -> PathBuf {
    let ts = Utc::now()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-");
    dir.join(format!("realestate_properties_{ts}.{}", format.extension()))
}

pub fn clean_feature_values(values: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    values
        .iter()
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .filter(|value| !value.chars().all(|c| c.is_ascii_digit()))
        .filter(|value| !ROOM_COUNT.is_match(value))
        .filter(|value| seen.insert(value.to_string()))
        .map(ToString::to_string)
        .collect()
}

fn escape_quotes(value: &str) -> String {
    value.replace('"', "\"\"")
}

fn quote_if_needed(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", escape_quotes(value))
    } else {
        value.to_string()
    }
}

fn render_scalar(name: &str, value: &str) -> String {
    if name == "description" {
        quote_if_needed(&LINE_BREAKS.replace_all(value, " "))
    } else {
        quote_if_needed(value)
    }
}

fn render_features(values: &[String]) -> String {
    let joined = clean_feature_values(values).join(FEATURE_SEPARATOR);
    format!("\"{}\"", escape_quotes(&joined))
}

struct CsvColumns {
    scalars: Vec<&'static str>,
    features: Vec<String>,
}

impl CsvColumns {
    fn collect(records: &[&PropertyRecord]) -> Self {
        let mut scalars = Vec::new();
        let mut features = Vec::<String>::new();
        for record in records {
            for (name, _) in record.scalar_fields() {
                if !scalars.contains(&name) {
                    scalars.push(name);
                }
            }
            for (category, _) in record.features.iter() {
                if !features.iter().any(|c| c == category) {
                    features.push(category.to_string());
                }
            }
        }
        Self { scalars, features }
    }

    fn header(&self) -> Vec<String> {
        self.scalars
            .iter()
            .map(|name| quote_if_needed(name))
            .chain(
                self.features
                    .iter()
                    .map(|c| quote_if_needed(&format!("{FEATURE_COLUMN_PREFIX}{c}"))),
            )
            .collect()
    }

    fn row(&self, record: &PropertyRecord) -> Vec<String> {
        let fields = record.scalar_fields();
        let scalars = self.scalars.iter().map(|name| {
            fields
                .iter()
                .find(|(field, _)| field == name)
                .map(|(_, value)| render_scalar(name, value))
                .unwrap_or_default()
        });
        let features = self.features.iter().map(|category| {
            record
                .features
                .get(category)
                .map(render_features)
                .unwrap_or_default()
        });
        scalars.chain(features).collect()
    }
}

/// Renders records as CSV text. Fields are escaped here; the writer only
/// joins them.
pub fn to_csv(records: &[&PropertyRecord]) -> Result<String> {
    if records.is_empty() {
        return Err(ScrapeError::NoData);
    }
    let columns = CsvColumns::collect(records);
    let mut writer = csv::WriterBuilder::new()
        .quote_style(csv::QuoteStyle::Never)
        .flexible(false)
        .from_writer(Vec::new());
    writer.write_record(columns.header())?;
    for record in records {
        writer.write_record(columns.row(record))?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| io::Error::other(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| ScrapeError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))
}

pub fn to_json(records: &[&PropertyRecord]) -> Result<String> {
    if records.is_empty() {
        return Err(ScrapeError::NoData);
    }
    Ok(serde_json::to_string_pretty(records)?)
}

pub fn write_export(records: &[&PropertyRecord], format: DataFormat, path: &Path) -> Result<PathBuf> {
    let content = match format {
        DataFormat::Csv => to_csv(records)?,
        DataFormat::Json => to_json(records)?,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)?;
    Ok(path.to_path_buf())
}
