use parking_lot::Mutex;
use std::fs::File;
use std::path::PathBuf;
use tracing::debug;

use super::read_limited;
use crate::error::FetchError;

/// Reads a local subscription file.
#[derive(Debug)]
pub struct FileFetcher {
    path: PathBuf,
    size_limit: u64,
    cache: Mutex<Option<Vec<u8>>>,
}

impl FileFetcher {
    pub fn new(path: impl Into<PathBuf>, size_limit: u64) -> Self {
        Self {
            path: path.into(),
            size_limit,
            cache: Mutex::new(None),
        }
    }

    pub fn fetch(&self, force_reload: bool) -> Result<Vec<u8>, FetchError> {
        if !force_reload {
            if let Some(cached) = self.cache.lock().as_ref() {
                debug!(path = %self.path.display(), "file fetch served from cache");
                return Ok(cached.clone());
            }
        }
        let location = self.path.display().to_string();
        let io_err = |source| FetchError::Io {
            location: location.clone(),
            source,
        };
        let file = File::open(&self.path).map_err(io_err)?;
        if let Ok(meta) = file.metadata() {
            if meta.len() > self.size_limit {
                return Err(FetchError::TooLarge {
                    location: location.clone(),
                    limit: self.size_limit,
                });
            }
        }
        let data = read_limited(file, self.size_limit)
            .map_err(io_err)?
            .ok_or_else(|| FetchError::TooLarge {
                location: location.clone(),
                limit: self.size_limit,
            })?;
        debug!(path = %location, bytes = data.len(), "file fetched");
        *self.cache.lock() = Some(data.clone());
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn reads_and_caches() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"ss://abc").unwrap();
        let fetcher = FileFetcher::new(f.path(), 1024);
        assert_eq!(fetcher.fetch(false).unwrap(), b"ss://abc");

        std::fs::write(f.path(), b"changed").unwrap();
        assert_eq!(fetcher.fetch(false).unwrap(), b"ss://abc");
        assert_eq!(fetcher.fetch(true).unwrap(), b"changed");
    }

    #[test]
    fn rejects_oversize_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&[b'x'; 64]).unwrap();
        let err = FileFetcher::new(f.path(), 16).fetch(false).unwrap_err();
        assert!(matches!(err, FetchError::TooLarge { limit: 16, .. }));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = FileFetcher::new("/definitely/not/here.txt", 16)
            .fetch(false)
            .unwrap_err();
        assert!(matches!(err, FetchError::Io { .. }));
    }
}
