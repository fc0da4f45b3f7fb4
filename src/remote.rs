//! Fetching a dataset from remote storage into the local cache before it is
//! loaded.

use crate::downloader::secure_filename;
use crate::error::{PlotError, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

const COPY_CHUNK: usize = 1 << 20;

/// A file in remote storage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub id: String,
    pub name: String,
    pub size: u64,
}

/// Download state reported by `cloud_progress`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CloudProgress {
    pub progress: f64,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub in_cache: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CloudProgress {
    pub fn started(total_bytes: u64) -> Self {
        CloudProgress {
            progress: 0.0,
            downloaded_bytes: 0,
            total_bytes,
            in_cache: false,
            error: None,
        }
    }

    fn at(downloaded_bytes: u64, total_bytes: u64) -> Self {
        let progress = if total_bytes == 0 {
            1.0
        } else {
            (downloaded_bytes as f64 / total_bytes as f64).min(1.0)
        };
        CloudProgress {
            progress,
            downloaded_bytes,
            ..CloudProgress::started(total_bytes)
        }
    }
}

/// Downloads a remote file to a local path.
pub trait RemoteFetcher: Send + Sync {
    /// Write `file` to `destination`, calling `progress(downloaded, total)`
    /// as bytes arrive.
    fn download(
        &self,
        file: &RemoteFile,
        destination: &Path,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<()>;
}

/// Fetcher that copies from a local mirror directory where each file is
/// stored under its id.
#[derive(Clone, Debug)]
pub struct DirectoryFetcher {
    pub root: PathBuf,
}

impl RemoteFetcher for DirectoryFetcher {
    fn download(
        &self,
        file: &RemoteFile,
        destination: &Path,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<()> {
        let source = self.root.join(secure_filename(&file.id));
        let mut input = File::open(&source)
            .map_err(|e| PlotError::RemoteFetch(format!("{}: {}", file.id, e)))?;
        let mut output = File::create(destination)?;
        let mut buf = vec![0u8; COPY_CHUNK];
        let mut done = 0u64;
        loop {
            let n = input.read(&mut buf)?;
            if n == 0 {
                break;
            }
            output.write_all(&buf[..n])?;
            done += n as u64;
            progress(done, file.size);
        }
        Ok(())
    }
}

/// Where `file` is kept in the cache directory.
pub fn cache_path(cache_dir: &Path, file: &RemoteFile) -> PathBuf {
    cache_dir.join(format!(
        "{}_{}",
        secure_filename(&file.id),
        secure_filename(&file.name)
    ))
}

/// Make `file` available locally, reusing a cached copy of the same size.
///
/// # Arguments
/// * `fetcher` - Remote storage client
/// * `file` - The file to fetch
/// * `cache_dir` - Directory cached downloads live in
/// * `on_progress` - Receives a snapshot on every chunk
///
/// # Returns
/// * `Result<PathBuf>` - Path of the local copy, or a `RemoteFetch` error
pub fn fetch(
    fetcher: &dyn RemoteFetcher,
    file: &RemoteFile,
    cache_dir: &Path,
    on_progress: &mut dyn FnMut(CloudProgress),
) -> Result<PathBuf> {
    let path = cache_path(cache_dir, file);
    if fs::metadata(&path).is_ok_and(|m| m.len() == file.size) {
        info!("Using cached copy of {} at {}", file.name, path.display());
        on_progress(CloudProgress {
            in_cache: true,
            ..CloudProgress::at(file.size, file.size)
        });
        return Ok(path);
    }

    fs::create_dir_all(cache_dir)?;
    on_progress(CloudProgress::started(file.size));
    fetcher.download(file, &path, &mut |done, total| {
        on_progress(CloudProgress::at(done, total))
    })?;

    let written = fs::metadata(&path)?.len();
    if written != file.size {
        return Err(PlotError::RemoteFetch(format!(
            "{}: expected {} bytes, received {}",
            file.name, file.size, written
        )));
    }
    debug!("Downloaded {} ({} bytes)", file.name, written);
    on_progress(CloudProgress::at(written, file.size));
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mirror_with(contents: &[u8]) -> (tempfile::TempDir, RemoteFile) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("abc123"), contents).unwrap();
        let file = RemoteFile {
            id: "abc123".into(),
            name: "cells.csv".into(),
            size: contents.len() as u64,
        };
        (dir, file)
    }

    #[test]
    fn downloads_then_reuses_cache() {
        let (mirror, file) = mirror_with(b"a,b\n1,2\n");
        let cache = tempfile::tempdir().unwrap();
        let fetcher = DirectoryFetcher {
            root: mirror.path().to_path_buf(),
        };

        let mut seen = Vec::new();
        let path = fetch(&fetcher, &file, cache.path(), &mut |p| seen.push(p)).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"a,b\n1,2\n");
        assert!(!seen.last().unwrap().in_cache);
        assert_eq!(seen.last().unwrap().progress, 1.0);

        let mut seen = Vec::new();
        fetch(&fetcher, &file, cache.path(), &mut |p| seen.push(p)).unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].in_cache);
    }

    #[test]
    fn missing_remote_file_is_a_fetch_error() {
        let (mirror, mut file) = mirror_with(b"x");
        file.id = "missing".into();
        let cache = tempfile::tempdir().unwrap();
        let fetcher = DirectoryFetcher {
            root: mirror.path().to_path_buf(),
        };
        assert!(matches!(
            fetch(&fetcher, &file, cache.path(), &mut |_| {}),
            Err(PlotError::RemoteFetch(_))
        ));
    }
}
