use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Atomically write data to path by writing to a temporary file in the same
/// directory and renaming it over the target. The temp file is fsynced first;
/// on Windows the target is removed before the rename is retried.
pub fn write_atomic<P: AsRef<Path>>(path: P, data: &[u8]) -> io::Result<()> {
    let path = path.as_ref();
    let dir = match path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "store".to_string());
    let mut tmp = dir;
    tmp.push(format!(
        ".{}.{}-{}-{}.tmp",
        file_name,
        std::process::id(),
        TMP_SEQ.fetch_add(1, Ordering::Relaxed),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos()
    ));

    let mut f = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)?;
    if let Err(e) = f.write_all(data).and_then(|_| f.flush()).and_then(|_| f.sync_all()) {
        drop(f);
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    drop(f);

    match fs::rename(&tmp, path) {
        Ok(()) => Ok(()),
        Err(e) => {
            #[cfg(target_os = "windows")]
            {
                let _ = fs::remove_file(path);
                fs::rename(&tmp, path).or(Err(e))
            }
            #[cfg(not(target_os = "windows"))]
            {
                let _ = fs::remove_file(&tmp);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn concurrent_writes_leave_consistent_file() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("out.json");
        let mut hs = Vec::new();
        for i in 0..8u8 {
            let p = p.clone();
            hs.push(thread::spawn(move || {
                let s = format!("{{\"i\":{}}}", i);
                write_atomic(&p, s.as_bytes()).unwrap();
            }));
        }
        for h in hs {
            let _ = h.join();
        }
        let s = fs::read_to_string(&p).unwrap();
        assert!(s.starts_with('{'));
        assert!(s.ends_with('}'));
    }

    #[test]
    fn creates_missing_parent_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("nested/deeper/store.json");
        write_atomic(&p, b"[]").unwrap();
        assert_eq!(fs::read_to_string(&p).unwrap(), "[]");
        let leftovers: Vec<_> = fs::read_dir(p.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn overwrite_replaces_old_content() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("data.txt");
        fs::write(&p, b"old").unwrap();
        write_atomic(&p, b"new").unwrap();
        assert_eq!(fs::read_to_string(&p).unwrap(), "new");
    }
}
