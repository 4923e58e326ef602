//! Per-rank timing log.
//!
//! Each line is `<epoch ms>\t<ms since previous line>\t<description>`. Only a subset of ranks
//! writes a log (about twenty for any group size, see [`should_log`]). Write failures are
//! reported as warnings and never abort a run.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

const MAX_LOGS: usize = 20;

/// True if `rank` of a group of `size` should keep a timing log.
#[must_use]
pub fn should_log(rank: usize, size: usize) -> bool {
    let stride = ((size + MAX_LOGS) / MAX_LOGS).saturating_sub(1).max(1);
    rank % stride == 0
}

#[must_use]
pub fn path_for(dir: &Path, rank: usize) -> PathBuf {
    dir.join(format!("PIPE_times_{rank}.txt"))
}

#[derive(Debug)]
pub struct TimingLog {
    sink: Option<tokio::io::BufWriter<tokio::fs::File>>,
    last: i64,
}

impl TimingLog {
    /// A log that records nothing.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            sink: None,
            last: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Opens `dir/PIPE_times_<rank>.txt` if this rank is selected, otherwise a disabled log.
    /// A file that cannot be created is reported and yields a disabled log.
    pub async fn create(dir: &Path, rank: usize, size: usize) -> Self {
        if !should_log(rank, size) {
            return Self::disabled();
        }
        let path = path_for(dir, rank);
        match tokio::fs::File::create(&path).await {
            Ok(file) => {
                tracing::debug!("timing log: {:?}", &path);
                Self {
                    sink: Some(tokio::io::BufWriter::new(file)),
                    last: chrono::Utc::now().timestamp_millis(),
                }
            }
            Err(error) => {
                tracing::warn!("failed creating timing log {:?}: {}", &path, &error);
                Self::disabled()
            }
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    pub async fn now(&mut self, description: &str) {
        let Some(sink) = &mut self.sink else {
            return;
        };
        let current = chrono::Utc::now().timestamp_millis();
        let line = format!("{}\t{}\t{}\n", current, current - self.last, description);
        self.last = current;
        if let Err(error) = sink.write_all(line.as_bytes()).await {
            tracing::warn!("failed writing timing log: {}", &error);
        }
    }

    pub async fn flush(&mut self) {
        let Some(sink) = &mut self.sink else {
            return;
        };
        if let Err(error) = sink.flush().await {
            tracing::warn!("failed flushing timing log: {}", &error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn stride_selection() {
        // up to 39 ranks everybody logs
        assert!((0..39).all(|rank| should_log(rank, 39)));
        // 40..59 ranks: every second one
        assert!(should_log(2, 40));
        assert!(!should_log(3, 40));
        // 100 ranks: every fifth
        assert_eq!((0..100).filter(|&rank| should_log(rank, 100)).count(), 20);
        assert!(should_log(0, 1));
    }

    #[tokio::test]
    async fn writes_lines() -> Result<(), anyhow::Error> {
        let tmp_dir = tempfile::tempdir()?;
        let mut log = TimingLog::create(tmp_dir.path(), 0, 1).await;
        assert!(log.is_enabled());
        log.now("Received iteration 0").await;
        log.now("Closing incoming iteration 0").await;
        log.flush().await;
        let text = tokio::fs::read_to_string(path_for(tmp_dir.path(), 0)).await?;
        let lines: Vec<Vec<&str>> = text.lines().map(|l| l.split('\t').collect()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0][2], "Received iteration 0");
        assert_eq!(lines[1][2], "Closing incoming iteration 0");
        assert!(lines[1][1].parse::<i64>()? >= 0);
        Ok(())
    }

    #[tokio::test]
    async fn unselected_rank_writes_nothing() -> Result<(), anyhow::Error> {
        let tmp_dir = tempfile::tempdir()?;
        let mut log = TimingLog::create(tmp_dir.path(), 3, 40).await;
        assert!(!log.is_enabled());
        log.now("ignored").await;
        assert!(!path_for(tmp_dir.path(), 3).exists());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn uncreatable_directory_disables_log() -> Result<(), anyhow::Error> {
        let tmp_dir = tempfile::tempdir()?;
        let missing = tmp_dir.path().join("missing").join("dir");
        let mut log = TimingLog::create(&missing, 0, 1).await;
        assert!(!log.is_enabled());
        assert!(logs_contain("failed creating timing log"));
        log.now("Received iteration 0").await;
        log.flush().await;
        assert!(!missing.exists());
        Ok(())
    }
}
