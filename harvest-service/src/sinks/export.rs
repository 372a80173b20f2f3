//! File exports fed with the same records as the usage store.

use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use time::{format_description::well_known::Rfc3339, macros::format_description, OffsetDateTime};
use usage_client::UsageRecord;

use crate::pipeline::{PipelineError, Sink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Csv,
    Json,
}

impl ExportFormat {
    fn extension(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Json => "json",
        }
    }
}

#[derive(Debug, Serialize)]
struct ExportRow {
    date: String,
    hour: Option<u8>,
    usage_kwh: f64,
    fetched_at: String,
}

impl From<&UsageRecord> for ExportRow {
    fn from(r: &UsageRecord) -> Self {
        Self {
            date: r.date.to_string(),
            hour: r.hour,
            usage_kwh: r.usage_kwh,
            fetched_at: r.fetched_at.format(&Rfc3339).unwrap_or_else(|_| r.fetched_at.to_string()),
        }
    }
}

fn export_path(dir: &Path, label: &str, format: ExportFormat) -> PathBuf {
    let stamp = OffsetDateTime::now_utc()
        .format(format_description!("[year][month][day]_[hour][minute][second]"))
        .unwrap_or_else(|_| "export".to_string());
    dir.join(format!("usage_{label}_{stamp}.{}", format.extension()))
}

fn export_err(e: impl std::fmt::Display) -> PipelineError {
    PipelineError::Export(e.to_string())
}

/// Collect the stream and hand it to a blocking writer. Empty input writes
/// nothing.
async fn write_export<S, F>(
    input: S,
    dir: PathBuf,
    label: String,
    format: ExportFormat,
    write: F,
) -> Result<usize, PipelineError>
where
    S: Stream<Item = UsageRecord> + Send + Unpin + 'static,
    F: FnOnce(&Path, &[ExportRow]) -> Result<(), PipelineError> + Send + 'static,
{
    let rows: Vec<ExportRow> = input.map(|r| ExportRow::from(&r)).collect().await;
    if rows.is_empty() {
        tracing::debug!(?format, "nothing to export");
        return Ok(0);
    }

    let count = rows.len();
    let path = tokio::task::spawn_blocking(move || {
        fs::create_dir_all(&dir).map_err(export_err)?;
        let path = export_path(&dir, &label, format);
        write(&path, &rows)?;
        Ok::<_, PipelineError>(path)
    })
    .await
    .map_err(export_err)??;

    tracing::info!(path = %path.display(), rows = count, "usage export written");
    Ok(count)
}

pub struct CsvExportSink {
    dir: PathBuf,
    label: String,
}

impl CsvExportSink {
    pub fn new<P: Into<PathBuf>>(dir: P, label: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            label: label.into(),
        }
    }
}

#[async_trait::async_trait]
impl Sink for CsvExportSink {
    async fn run<S>(&self, input: S) -> Result<usize, PipelineError>
    where
        S: Stream<Item = UsageRecord> + Send + Unpin + 'static,
    {
        write_export(input, self.dir.clone(), self.label.clone(), ExportFormat::Csv, |path, rows| {
            let mut wtr = csv::Writer::from_path(path).map_err(export_err)?;
            for row in rows {
                wtr.serialize(row).map_err(export_err)?;
            }
            wtr.flush().map_err(export_err)
        })
        .await
    }
}

pub struct JsonExportSink {
    dir: PathBuf,
    label: String,
}

impl JsonExportSink {
    pub fn new<P: Into<PathBuf>>(dir: P, label: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            label: label.into(),
        }
    }
}

#[async_trait::async_trait]
impl Sink for JsonExportSink {
    async fn run<S>(&self, input: S) -> Result<usize, PipelineError>
    where
        S: Stream<Item = UsageRecord> + Send + Unpin + 'static,
    {
        write_export(input, self.dir.clone(), self.label.clone(), ExportFormat::Json, |path, rows| {
            let mut out = BufWriter::new(File::create(path).map_err(export_err)?);
            serde_json::to_writer_pretty(&mut out, rows).map_err(export_err)?;
            out.flush().map_err(export_err)
        })
        .await
    }
}

pub enum ExportSink {
    Csv(CsvExportSink),
    Json(JsonExportSink),
}

impl ExportSink {
    pub fn new<P: Into<PathBuf>>(format: ExportFormat, dir: P, label: impl Into<String>) -> Self {
        match format {
            ExportFormat::Csv => Self::Csv(CsvExportSink::new(dir, label)),
            ExportFormat::Json => Self::Json(JsonExportSink::new(dir, label)),
        }
    }
}

#[async_trait::async_trait]
impl Sink for ExportSink {
    async fn run<S>(&self, input: S) -> Result<usize, PipelineError>
    where
        S: Stream<Item = UsageRecord> + Send + Unpin + 'static,
    {
        match self {
            Self::Csv(s) => s.run(input).await,
            Self::Json(s) => s.run(input).await,
        }
    }
}
