//! The bulk extract/load pipeline: query → delimited temp file → optional
//! on-disk split → staged loads into the target table.
//!
//! Partial progress is acceptable; callers load into tables they own (a
//! staging table, or a live table with duplicate-tolerant ingest) and
//! discard on failure. The extract file is deleted on every exit path.

use crate::adapter::{DatabaseAdapter, ExtractQuery};
use crate::error::{Result, SyncError};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ExtractLoadPipeline {
    /// Maximum lines per load chunk; `0` loads the extract in one piece.
    pub chunk_size: usize,
}

impl ExtractLoadPipeline {
    pub fn new(chunk_size: usize) -> Self {
        Self { chunk_size }
    }

    /// Extract from the source and load into `target_table`, returning the
    /// number of extracted rows.
    pub async fn run(
        &self,
        source: &mut dyn DatabaseAdapter,
        target: &mut dyn DatabaseAdapter,
        query: &ExtractQuery,
        target_table: &str,
        charset: Option<&str>,
    ) -> Result<u64> {
        let extract_file = extract_file_path(target_table);
        let result = self
            .run_inner(source, target, query, target_table, charset, &extract_file)
            .await;
        remove_quietly(&extract_file);
        result
    }

    async fn run_inner(
        &self,
        source: &mut dyn DatabaseAdapter,
        target: &mut dyn DatabaseAdapter,
        query: &ExtractQuery,
        target_table: &str,
        charset: Option<&str>,
        extract_file: &Path,
    ) -> Result<u64> {
        source
            .extract_to_file(query, extract_file, charset)
            .await?;

        let rows = count_lines(extract_file)
            .map_err(|e| SyncError::split(extract_file, anyhow::Error::from(e)))?;
        if rows == 0 {
            debug!(table = target_table, "extract produced no rows");
            return Ok(0);
        }

        if self.chunk_size > 0 && rows > self.chunk_size as u64 {
            let chunks = split_file(extract_file, self.chunk_size)?;
            let result = self
                .load_chunks(target, target_table, &query.columns, &chunks)
                .await;
            for chunk in &chunks {
                remove_quietly(chunk);
            }
            result?;
        } else {
            target
                .load_from_file(target_table, &query.columns, extract_file)
                .await?;
        }

        Ok(rows)
    }

    async fn load_chunks(
        &self,
        target: &mut dyn DatabaseAdapter,
        target_table: &str,
        columns: &[String],
        chunks: &[PathBuf],
    ) -> Result<()> {
        for chunk in chunks {
            target.load_from_file(target_table, columns, chunk).await?;
            remove_quietly(chunk);
        }
        Ok(())
    }
}

/// Unique extract-file path in the temp directory. `TMPDIR` overrides the
/// directory; the default on some hosts is not world-writable, which
/// breaks bulk loaders running under a different OS user.
pub fn extract_file_path(target_table: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "warehouse_sync_{target_table}_{}.tsv",
        Uuid::new_v4().simple()
    ))
}

fn count_lines(path: &Path) -> std::io::Result<u64> {
    let reader = BufReader::new(File::open(path)?);
    let mut count = 0u64;
    for line in reader.lines() {
        line?;
        count += 1;
    }
    Ok(count)
}

/// Split a delimited file into chunks of at most `max_lines` lines,
/// written next to the original. The original is left in place.
fn split_file(path: &Path, max_lines: usize) -> Result<Vec<PathBuf>> {
    let split = || -> std::io::Result<Vec<PathBuf>> {
        let reader = BufReader::new(File::open(path)?);
        let mut chunks = Vec::new();
        let mut writer: Option<BufWriter<File>> = None;
        let mut lines_in_chunk = 0usize;

        for line in reader.lines() {
            let line = line?;
            if writer.is_none() || lines_in_chunk == max_lines {
                if let Some(mut w) = writer.take() {
                    w.flush()?;
                }
                let chunk_path =
                    PathBuf::from(format!("{}.{}", path.display(), chunks.len()));
                writer = Some(BufWriter::new(File::create(&chunk_path)?));
                chunks.push(chunk_path);
                lines_in_chunk = 0;
            }
            let w = writer.as_mut().expect("chunk writer just created");
            w.write_all(line.as_bytes())?;
            w.write_all(b"\n")?;
            lines_in_chunk += 1;
        }
        if let Some(mut w) = writer.take() {
            w.flush()?;
        }
        Ok(chunks)
    };

    split().map_err(|e| SyncError::split(path, anyhow::Error::from(e)))
}

fn remove_quietly(path: &Path) {
    let _ = std::fs::remove_file(path);
}
