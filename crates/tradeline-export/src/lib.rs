//! Table sinks: CSV and XLSX exports with identical contents, an optional
//! Parquet snapshot, and a sha256 manifest over whatever was written.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arrow_array::{ArrayRef, Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use parquet::arrow::ArrowWriter;
use rust_xlsxwriter::Workbook;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::info;
use tradeline_core::{Cell, ColumnKind, OutputTable, COLUMN_KINDS, OUTPUT_COLUMNS};

pub const CRATE_NAME: &str = "tradeline-export";

/// Worksheet row limit, header included.
pub const XLSX_MAX_ROWS: usize = 1_048_576;

pub trait TableSink {
    fn name(&self) -> &'static str;
    fn path(&self) -> &Path;
    fn write(&self, table: &OutputTable) -> Result<()>;
}

pub fn write_csv<W: io::Write>(writer: W, table: &OutputTable) -> Result<()> {
    let mut writer = csv::Writer::from_writer(writer);
    writer
        .write_record(OUTPUT_COLUMNS)
        .context("writing csv header")?;
    for cells in table.cell_rows() {
        writer
            .write_record(cells.iter().map(Cell::to_string))
            .context("writing csv row")?;
    }
    writer.flush().context("flushing csv writer")?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct CsvSink {
    path: PathBuf,
}

impl CsvSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TableSink for CsvSink {
    fn name(&self) -> &'static str {
        "csv"
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, table: &OutputTable) -> Result<()> {
        let file = File::create(&self.path)
            .with_context(|| format!("creating {}", self.path.display()))?;
        write_csv(file, table).with_context(|| format!("writing {}", self.path.display()))
    }
}

#[derive(Debug, Clone)]
pub struct XlsxSink {
    path: PathBuf,
}

impl XlsxSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TableSink for XlsxSink {
    fn name(&self) -> &'static str {
        "xlsx"
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, table: &OutputTable) -> Result<()> {
        if table.len() + 1 > XLSX_MAX_ROWS {
            bail!(
                "{} rows exceed the worksheet limit of {}",
                table.len(),
                XLSX_MAX_ROWS - 1
            );
        }

        let mut workbook = Workbook::new();
        let worksheet = workbook.add_worksheet();
        worksheet
            .set_name("tradelines")
            .context("naming worksheet")?;

        for (col, name) in OUTPUT_COLUMNS.iter().enumerate() {
            worksheet
                .write_string(0, col as u16, *name)
                .context("writing xlsx header")?;
        }

        for (idx, cells) in table.cell_rows().enumerate() {
            let row = (idx + 1) as u32;
            for (col, cell) in cells.iter().enumerate() {
                let col = col as u16;
                match cell {
                    Cell::Null => {}
                    Cell::Text(s) => {
                        worksheet.write_string(row, col, s.as_str())?;
                    }
                    Cell::Float(v) => {
                        worksheet.write_number(row, col, *v)?;
                    }
                    Cell::Integer(v) => {
                        worksheet.write_number(row, col, *v as f64)?;
                    }
                }
            }
        }

        workbook
            .save(&self.path)
            .with_context(|| format!("saving {}", self.path.display()))?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ParquetSink {
    path: PathBuf,
}

impl ParquetSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TableSink for ParquetSink {
    fn name(&self) -> &'static str {
        "parquet"
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, table: &OutputTable) -> Result<()> {
        write_parquet(&self.path, table_record_batch(table)?)
    }
}

pub fn arrow_schema() -> Schema {
    Schema::new(
        OUTPUT_COLUMNS
            .iter()
            .zip(COLUMN_KINDS)
            .map(|(name, kind)| {
                let data_type = match kind {
                    ColumnKind::Text => DataType::Utf8,
                    ColumnKind::Float => DataType::Float64,
                    ColumnKind::Integer => DataType::Int64,
                };
                ArrowField::new(*name, data_type, true)
            })
            .collect::<Vec<_>>(),
    )
}

fn table_record_batch(table: &OutputTable) -> Result<RecordBatch> {
    let grid: Vec<[Cell; 31]> = table.cell_rows().collect();

    let columns = COLUMN_KINDS
        .iter()
        .enumerate()
        .map(|(idx, kind)| -> ArrayRef {
            match kind {
                ColumnKind::Text => Arc::new(StringArray::from(
                    grid.iter()
                        .map(|row| match &row[idx] {
                            Cell::Text(s) => Some(s.as_str()),
                            _ => None,
                        })
                        .collect::<Vec<_>>(),
                )),
                ColumnKind::Float => Arc::new(Float64Array::from(
                    grid.iter()
                        .map(|row| match row[idx] {
                            Cell::Float(v) => Some(v),
                            Cell::Integer(v) => Some(v as f64),
                            _ => None,
                        })
                        .collect::<Vec<_>>(),
                )),
                ColumnKind::Integer => Arc::new(Int64Array::from(
                    grid.iter()
                        .map(|row| match row[idx] {
                            Cell::Integer(v) => Some(v),
                            _ => None,
                        })
                        .collect::<Vec<_>>(),
                )),
            }
        })
        .collect::<Vec<_>>();

    RecordBatch::try_new(Arc::new(arrow_schema()), columns).context("building tradeline record batch")
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportManifest {
    pub schema_version: u32,
    pub row_count: usize,
    pub columns: Vec<String>,
    pub files: Vec<ExportManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ExportSet {
    dir: PathBuf,
    stem: String,
    parquet: bool,
}

impl ExportSet {
    pub fn new(dir: impl Into<PathBuf>, stem: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            stem: stem.into(),
            parquet: true,
        }
    }

    pub fn with_parquet(mut self, enabled: bool) -> Self {
        self.parquet = enabled;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join("manifest.json")
    }

    fn sinks(&self) -> Vec<Box<dyn TableSink>> {
        let mut sinks: Vec<Box<dyn TableSink>> = vec![
            Box::new(CsvSink::new(self.dir.join(format!("{}.csv", self.stem)))),
            Box::new(XlsxSink::new(self.dir.join(format!("{}.xlsx", self.stem)))),
        ];
        if self.parquet {
            sinks.push(Box::new(ParquetSink::new(
                self.dir.join(format!("{}.parquet", self.stem)),
            )));
        }
        sinks
    }

    pub fn write_all(&self, table: &OutputTable) -> Result<ExportManifest> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating {}", self.dir.display()))?;

        let mut files = Vec::new();
        for sink in self.sinks() {
            sink.write(table)
                .with_context(|| format!("{} export failed", sink.name()))?;
            files.push(manifest_entry(sink.name(), &self.dir, sink.path())?);
            info!(sink = sink.name(), path = %sink.path().display(), rows = table.len(), "export written");
        }

        let manifest = ExportManifest {
            schema_version: 1,
            row_count: table.len(),
            columns: OUTPUT_COLUMNS.iter().map(ToString::to_string).collect(),
            files,
        };
        let manifest_path = self.manifest_path();
        let bytes = serde_json::to_vec_pretty(&manifest).context("serializing export manifest")?;
        fs::write(&manifest_path, bytes)
            .with_context(|| format!("writing {}", manifest_path.display()))?;
        Ok(manifest)
    }
}

fn manifest_entry(name: &str, dir: &Path, path: &Path) -> Result<ExportManifestFile> {
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ExportManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}
