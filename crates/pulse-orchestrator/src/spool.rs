//! Disk-backed batch spool between pipeline stages
//!
//! The scrape stage appends raw items as JSON lines to a per-pipeline file;
//! the process stage reads them back. Keeping the batch on disk bounds
//! memory for large scrapes and survives the items' trip between stages.

use pulse_common::{Error, RawItem, Result, TaskId};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tracing::debug;

/// Append-only writer for one pipeline's scraped batch
pub struct SpoolWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    count: usize,
}

impl SpoolWriter {
    pub async fn create(dir: &Path, pipeline_id: TaskId) -> Result<Self> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| Error::Internal(format!("cannot create spool dir: {}", e)))?;
        let path = dir.join(format!("{}.jsonl", pipeline_id));
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&path)
            .await
            .map_err(|e| Error::Internal(format!("cannot create spool file: {}", e)))?;
        Ok(Self {
            writer: BufWriter::new(file),
            path,
            count: 0,
        })
    }

    pub async fn append(&mut self, item: &RawItem) -> Result<()> {
        let mut line = serde_json::to_vec(item)?;
        line.push(b'\n');
        self.writer
            .write_all(&line)
            .await
            .map_err(|e| Error::Internal(format!("spool write failed: {}", e)))?;
        self.count += 1;
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Drop the partially written batch and remove its file
    pub async fn discard(self) {
        let _ = tokio::fs::remove_file(&self.path).await;
    }

    /// Flush and hand the batch over for reading
    pub async fn finish(mut self) -> Result<SpoolHandle> {
        self.writer
            .flush()
            .await
            .map_err(|e| Error::Internal(format!("spool flush failed: {}", e)))?;
        debug!(path = %self.path.display(), items = self.count, "spool sealed");
        Ok(SpoolHandle {
            path: self.path,
            count: self.count,
        })
    }
}

/// A sealed batch file ready to be read back
#[derive(Debug, Clone)]
pub struct SpoolHandle {
    path: PathBuf,
    count: usize,
}

impl SpoolHandle {
    pub fn count(&self) -> usize {
        self.count
    }

    /// Read the raw JSON lines back; decoding happens per line so the
    /// process stage can skip and count malformed entries.
    pub async fn lines(&self) -> Result<Vec<String>> {
        let file = File::open(&self.path)
            .await
            .map_err(|e| Error::Internal(format!("cannot open spool file: {}", e)))?;
        let mut reader = BufReader::new(file).lines();
        let mut lines = Vec::with_capacity(self.count);
        while let Some(line) = reader
            .next_line()
            .await
            .map_err(|e| Error::Internal(format!("spool read failed: {}", e)))?
        {
            if !line.trim().is_empty() {
                lines.push(line);
            }
        }
        Ok(lines)
    }

    /// Remove the batch file; missing files are fine
    pub async fn remove(&self) {
        let _ = tokio::fs::remove_file(&self.path).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pulse_common::ItemKind;
    use uuid::Uuid;

    fn item(id: &str) -> RawItem {
        RawItem {
            id: id.into(),
            kind: ItemKind::Comment,
            parent_id: Some("t3_x".into()),
            author: None,
            subreddit: "ucla".into(),
            created_at: Utc::now(),
            title: None,
            body: format!("body of {}", id),
            score: Some(1),
            upvote_ratio: None,
        }
    }

    #[tokio::test]
    async fn round_trips_items_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SpoolWriter::create(dir.path(), Uuid::new_v4()).await.unwrap();
        writer.append(&item("a")).await.unwrap();
        writer.append(&item("b")).await.unwrap();
        assert_eq!(writer.count(), 2);

        let handle = writer.finish().await.unwrap();
        assert_eq!(handle.count(), 2);

        let lines = handle.lines().await.unwrap();
        assert_eq!(lines.len(), 2);
        let first: RawItem = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(first.id, "a");

        handle.remove().await;
        assert!(File::open(dir.path().join("missing")).await.is_err());
    }

    #[tokio::test]
    async fn empty_spool_reads_back_empty() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SpoolWriter::create(dir.path(), Uuid::new_v4()).await.unwrap();
        let handle = writer.finish().await.unwrap();
        assert_eq!(handle.count(), 0);
        assert!(handle.lines().await.unwrap().is_empty());
    }
}
