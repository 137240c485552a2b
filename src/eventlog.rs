//! Date-partitioned event log
//!
//! Lines are appended to `{dir}/{YYYY}/{MMDD}.log`, chosen by the event
//! time. The open file is kept until the date changes.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, FixedOffset};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

pub struct EventLog {
    dir: PathBuf,
    current: Option<(PathBuf, File)>,
}

impl EventLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            current: None,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File that holds lines for `time`
    pub fn path_for(&self, time: &DateTime<FixedOffset>) -> PathBuf {
        self.dir
            .join(time.format("%Y").to_string())
            .join(format!("{}.log", time.format("%m%d")))
    }

    pub async fn append(&mut self, time: &DateTime<FixedOffset>, line: &str) -> io::Result<()> {
        let path = self.path_for(time);
        if self.current.as_ref().map_or(true, |(open, _)| *open != path) {
            // Close the previous day's file before opening the next
            self.current = None;
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            debug!("Event log: Writing to {}", path.display());
            self.current = Some((path, file));
        }

        if let Some((_, file)) = &mut self.current {
            let mut buf = String::with_capacity(line.len() + 1);
            buf.push_str(line);
            buf.push('\n');
            file.write_all(buf.as_bytes()).await?;
            file.flush().await?;
        }
        Ok(())
    }
}
