use crate::dcc::errors::StoreError;
use std::path::{Path, PathBuf};

pub type Result<T> = std::result::Result<T, StoreError>;

pub const PART_SUFFIX: &str = ".part";

/// Filesystem home of in-flight and finished downloads.
///
/// For a file `F` the working file is `F.part`; completion renames it to `F`
/// in the same directory, so the promotion is atomic on any sane filesystem.
#[derive(Debug, Clone)]
pub struct DownloadStore {
    dest_dir: PathBuf,
}

impl DownloadStore {
    pub fn new(dest_dir: &str) -> Self {
        // Trailing separators would otherwise survive into every joined path.
        let trimmed = dest_dir.trim_end_matches(['/', '\\']);
        let dir = if trimmed.is_empty() { dest_dir } else { trimmed };
        Self {
            dest_dir: PathBuf::from(dir),
        }
    }

    pub fn dest_dir(&self) -> &Path {
        &self.dest_dir
    }

    pub async fn ensure_dir(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dest_dir)
            .await
            .map_err(|source| StoreError::EnsureDir {
                path: self.dest_dir.clone(),
                source,
            })
    }

    /// Reduce a bot-supplied filename to a plain final component. Anything
    /// absolute or multi-part is refused rather than resolved.
    pub fn sanitize(input: &str) -> Result<String> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(StoreError::BadFilename("empty filename".to_string()));
        }
        let path = Path::new(trimmed);
        if path.is_absolute() {
            return Err(StoreError::BadFilename(format!(
                "absolute path '{trimmed}'"
            )));
        }
        let mut comps = path.components();
        let first = comps.next();
        if comps.next().is_some() {
            return Err(StoreError::BadFilename(format!(
                "path with separators '{trimmed}'"
            )));
        }
        match first {
            Some(std::path::Component::Normal(name)) => match name.to_str() {
                Some(name) => Ok(name.to_string()),
                None => Err(StoreError::BadFilename("not valid UTF-8".to_string())),
            },
            _ => Err(StoreError::BadFilename(format!(
                "not a plain file name '{trimmed}'"
            ))),
        }
    }

    pub fn part_path(&self, name: &str) -> PathBuf {
        self.dest_dir.join(format!("{name}{PART_SUFFIX}"))
    }

    pub fn final_path(&self, name: &str) -> PathBuf {
        self.dest_dir.join(name)
    }

    /// Decide the starting offset for `name`.
    ///
    /// With resume enabled an existing `.part` contributes its length; with
    /// resume disabled it is unlinked first. No `.part` means offset 0 —
    /// notably, a previously *completed* `F` does not count as progress.
    pub async fn resume_offset(&self, name: &str, resume: bool) -> Result<u64> {
        let part = self.part_path(name);
        match tokio::fs::metadata(&part).await {
            Ok(meta) => {
                if resume {
                    Ok(meta.len())
                } else {
                    tokio::fs::remove_file(&part)
                        .await
                        .map_err(|source| StoreError::Unlink {
                            path: part.clone(),
                            source,
                        })?;
                    Ok(0)
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(source) => Err(StoreError::Inspect { path: part, source }),
        }
    }

    /// Open the working file in append mode; the OS decides the write
    /// position, which is exactly the resume semantics we want.
    pub async fn open_part(&self, name: &str) -> Result<tokio::fs::File> {
        let part = self.part_path(name);
        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&part)
            .await
            .map_err(|source| StoreError::Open { path: part, source })
    }

    /// Rename `F.part` to `F`. On failure the `.part` file stays in place so
    /// a later attempt can resume from it.
    pub async fn promote(&self, name: &str) -> Result<PathBuf> {
        let from = self.part_path(name);
        let to = self.final_path(name);
        tokio::fs::rename(&from, &to)
            .await
            .map_err(|source| StoreError::Promote {
                from,
                to: to.clone(),
                source,
            })?;
        Ok(to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn temp_store(tag: &str) -> DownloadStore {
        let mut p = std::env::temp_dir();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        p.push(format!("xdccd-store-{tag}-{nanos}"));
        DownloadStore::new(p.to_str().expect("utf-8 temp dir"))
    }

    #[test]
    fn trailing_separators_are_stripped() {
        let store = DownloadStore::new("/data///");
        assert_eq!(store.dest_dir(), Path::new("/data"));
        assert_eq!(store.part_path("a.bin"), Path::new("/data/a.bin.part"));
        assert_eq!(store.final_path("a.bin"), Path::new("/data/a.bin"));
    }

    #[test]
    fn sanitize_keeps_plain_names_and_rejects_paths() {
        assert_eq!(DownloadStore::sanitize("a.bin").expect("plain"), "a.bin");
        assert_eq!(
            DownloadStore::sanitize("  spaced name.iso ").expect("trim"),
            "spaced name.iso"
        );
        assert!(DownloadStore::sanitize("").is_err());
        assert!(DownloadStore::sanitize("/etc/passwd").is_err());
        assert!(DownloadStore::sanitize("../escape.bin").is_err());
        assert!(DownloadStore::sanitize("dir/inner.bin").is_err());
        assert!(DownloadStore::sanitize("..").is_err());
    }

    #[tokio::test]
    async fn fresh_file_starts_at_zero() {
        let store = temp_store("fresh");
        store.ensure_dir().await.expect("ensure dir");
        assert_eq!(
            store.resume_offset("a.bin", true).await.expect("offset"),
            0
        );
        let _ = std::fs::remove_dir_all(store.dest_dir());
    }

    #[tokio::test]
    async fn existing_part_length_is_the_resume_offset() {
        let store = temp_store("resume");
        store.ensure_dir().await.expect("ensure dir");
        tokio::fs::write(store.part_path("a.bin"), b"\x01\x02\x03")
            .await
            .expect("seed part");
        assert_eq!(
            store.resume_offset("a.bin", true).await.expect("offset"),
            3
        );
        // The .part must survive inspection.
        assert!(store.part_path("a.bin").exists());
        let _ = std::fs::remove_dir_all(store.dest_dir());
    }

    #[tokio::test]
    async fn resume_disabled_unlinks_the_part_file() {
        let store = temp_store("nores");
        store.ensure_dir().await.expect("ensure dir");
        tokio::fs::write(store.part_path("a.bin"), b"stale")
            .await
            .expect("seed part");
        assert_eq!(
            store.resume_offset("a.bin", false).await.expect("offset"),
            0
        );
        assert!(!store.part_path("a.bin").exists());
        let _ = std::fs::remove_dir_all(store.dest_dir());
    }

    #[tokio::test]
    async fn append_open_continues_after_existing_bytes() {
        let store = temp_store("append");
        store.ensure_dir().await.expect("ensure dir");
        tokio::fs::write(store.part_path("a.bin"), b"\x01\x02\x03")
            .await
            .expect("seed part");

        let mut file = store.open_part("a.bin").await.expect("open");
        file.write_all(b"\x04\x05").await.expect("append");
        file.flush().await.expect("flush");
        drop(file);

        let bytes = tokio::fs::read(store.part_path("a.bin"))
            .await
            .expect("read back");
        assert_eq!(bytes, b"\x01\x02\x03\x04\x05");
        let _ = std::fs::remove_dir_all(store.dest_dir());
    }

    #[tokio::test]
    async fn promote_renames_part_to_final() {
        let store = temp_store("promote");
        store.ensure_dir().await.expect("ensure dir");
        tokio::fs::write(store.part_path("a.bin"), b"done")
            .await
            .expect("seed part");

        let path = store.promote("a.bin").await.expect("promote");
        assert_eq!(path, store.final_path("a.bin"));
        assert!(!store.part_path("a.bin").exists());
        assert_eq!(std::fs::read(path).expect("read final"), b"done");
        let _ = std::fs::remove_dir_all(store.dest_dir());
    }

    #[tokio::test]
    async fn promote_without_part_fails_and_changes_nothing() {
        let store = temp_store("promote-missing");
        store.ensure_dir().await.expect("ensure dir");
        assert!(store.promote("ghost.bin").await.is_err());
        assert!(!store.final_path("ghost.bin").exists());
        let _ = std::fs::remove_dir_all(store.dest_dir());
    }
}
