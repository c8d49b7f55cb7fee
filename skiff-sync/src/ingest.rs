//! Batch-link files dropped into the watched directory.
//!
//! A file `name.txt` holds one link per line. Its non-empty lines become a
//! new scheduler batch called `name`. Files found by the initial scan are
//! queued without starting; files that show up later start immediately.

use std::path::{Path, PathBuf};

use crate::hub::{Scheduler, SchedulerError};

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot derive a batch name from {0}")]
    NoName(PathBuf),

    #[error("Scheduler refused batch: {0}")]
    Scheduler(#[from] SchedulerError),
}

/// Matches batch files by extension, ignoring case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkFileFilter {
    extension: String,
}

impl LinkFileFilter {
    pub fn new(extension: impl Into<String>) -> Self {
        let extension: String = extension.into();
        Self {
            extension: extension.trim_start_matches('.').to_string(),
        }
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn matches(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case(&self.extension))
            .unwrap_or(false)
    }
}

impl Default for LinkFileFilter {
    fn default() -> Self {
        Self::new("txt")
    }
}

/// A batch read from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkBatch {
    pub name: String,
    pub links: Vec<String>,
}

/// Non-empty, trimmed lines.
pub fn parse_links(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// File name without its extension.
pub fn batch_name(path: &Path) -> Option<String> {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.is_empty())
        .map(str::to_string)
}

/// Read a batch file. Returns `None` when it holds no links.
pub async fn read_batch(path: &Path) -> Result<Option<LinkBatch>, IngestError> {
    let name = batch_name(path).ok_or_else(|| IngestError::NoName(path.to_path_buf()))?;
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| IngestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    let links = parse_links(&text);
    if links.is_empty() {
        return Ok(None);
    }
    Ok(Some(LinkBatch { name, links }))
}

/// Read `path` and submit it to the scheduler.
pub async fn ingest_file(
    path: &Path,
    scheduler: &dyn Scheduler,
    autostart: bool,
) -> Result<Option<LinkBatch>, IngestError> {
    let Some(batch) = read_batch(path).await? else {
        log::debug!("Ignoring {} (no links)", path.display());
        return Ok(None);
    };
    scheduler.create_batch(&batch.name, batch.links.clone(), autostart)?;
    log::info!(
        "Queued batch '{}' with {} links from {} (autostart: {autostart})",
        batch.name,
        batch.links.len(),
        path.display()
    );
    Ok(Some(batch))
}

/// Submit every matching file already present in `dir`, without autostart.
///
/// Unreadable files are logged and skipped. Returns the number of batches
/// created.
pub async fn scan_directory(
    dir: &Path,
    filter: &LinkFileFilter,
    scheduler: &dyn Scheduler,
) -> Result<usize, IngestError> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|source| IngestError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

    let mut paths = Vec::new();
    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => {
                let path = entry.path();
                if filter.matches(&path) && path.is_file() {
                    paths.push(path);
                }
            }
            Ok(None) => break,
            Err(source) => {
                return Err(IngestError::Io {
                    path: dir.to_path_buf(),
                    source,
                })
            }
        }
    }
    paths.sort();

    let mut created = 0;
    for path in paths {
        match ingest_file(&path, scheduler, false).await {
            Ok(Some(_)) => created += 1,
            Ok(None) => {}
            Err(e) => log::warn!("Skipping {}: {e}", path.display()),
        }
    }
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryScheduler;

    #[test]
    fn test_parse_links_skips_blank_lines() {
        let links = parse_links("https://a\n\n  https://b  \r\n\t\nhttps://c");
        assert_eq!(links, vec!["https://a", "https://b", "https://c"]);
        assert!(parse_links("\n \n").is_empty());
    }

    #[test]
    fn test_filter_matches_extension() {
        let filter = LinkFileFilter::default();
        assert!(filter.matches(Path::new("/drop/batch1.txt")));
        assert!(filter.matches(Path::new("/drop/BATCH.TXT")));
        assert!(!filter.matches(Path::new("/drop/batch1.txt.part")));
        assert!(!filter.matches(Path::new("/drop/readme")));
        assert_eq!(LinkFileFilter::new(".lst").extension(), "lst");
    }

    #[test]
    fn test_batch_name() {
        assert_eq!(batch_name(Path::new("/x/batch1.txt")), Some("batch1".to_string()));
        assert_eq!(batch_name(Path::new("/x/a.b.txt")), Some("a.b".to_string()));
    }

    #[tokio::test]
    async fn test_initial_scan_without_autostart() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("batch1.txt"), "l1\nl2\n\nl3\n").unwrap();
        std::fs::write(dir.path().join("empty.txt"), "\n\n").unwrap();
        std::fs::write(dir.path().join("notes.md"), "ignored\n").unwrap();

        let (scheduler, _events) = MemoryScheduler::new();
        let created = scan_directory(dir.path(), &LinkFileFilter::default(), &scheduler)
            .await
            .unwrap();

        assert_eq!(created, 1);
        let submitted = scheduler.submitted();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].name, "batch1");
        assert_eq!(submitted[0].links.len(), 3);
        assert!(!submitted[0].autostart);
    }

    #[tokio::test]
    async fn test_ingest_later_file_autostarts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("later.txt");
        std::fs::write(&path, "x\ny\n").unwrap();

        let (scheduler, _events) = MemoryScheduler::new();
        let batch = ingest_file(&path, &scheduler, true).await.unwrap().unwrap();
        assert_eq!(batch.name, "later");

        let submitted = scheduler.submitted();
        assert_eq!(submitted[0].links, vec!["x", "y"]);
        assert!(submitted[0].autostart);
    }

    #[tokio::test]
    async fn test_empty_file_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.txt");
        std::fs::write(&path, "").unwrap();

        let (scheduler, _events) = MemoryScheduler::new();
        assert!(ingest_file(&path, &scheduler, true).await.unwrap().is_none());
        assert!(scheduler.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, _events) = MemoryScheduler::new();
        let err = ingest_file(&dir.path().join("gone.txt"), &scheduler, true)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Io { .. }));
    }
}
