//! On-disk destination for completed downloads.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::info;

/// The local directory downloads land in. Auto-created on startup.
pub struct StorageDir {
    dir: PathBuf,
}

impl StorageDir {
    pub async fn create(dir: PathBuf) -> io::Result<Self> {
        fs::create_dir_all(&dir).await?;
        info!("download directory: {}", dir.display());
        Ok(Self { dir })
    }

    /// Picks a path for `name` that does not collide with an existing file,
    /// appending `_N` before the extension until one is free.
    pub async fn unique_destination(&self, name: &str) -> io::Result<PathBuf> {
        let safe = sanitize_file_name(name);
        let candidate = self.dir.join(&safe);
        if !fs::try_exists(&candidate).await? {
            return Ok(candidate);
        }

        let path = Path::new(&safe);
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| safe.clone());
        let ext = path.extension().map(|e| e.to_string_lossy().into_owned());

        for n in 1u32.. {
            let alt = match &ext {
                Some(ext) => format!("{stem}_{n}.{ext}"),
                None => format!("{stem}_{n}"),
            };
            let candidate = self.dir.join(alt);
            if !fs::try_exists(&candidate).await? {
                return Ok(candidate);
            }
        }
        unreachable!("ran out of collision suffixes")
    }
}

/// Reduces an announced file name to a plain basename. Peers do not get to
/// pick where their bytes land.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name).trim();
    if base.is_empty() || base == "." || base == ".." {
        "download".into()
    } else {
        base.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_directories() {
        assert_eq!(sanitize_file_name("x.bin"), "x.bin");
        assert_eq!(sanitize_file_name("a/b/x.bin"), "x.bin");
        assert_eq!(sanitize_file_name("..\\..\\evil.exe"), "evil.exe");
        assert_eq!(sanitize_file_name("/etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name(".."), "download");
        assert_eq!(sanitize_file_name(""), "download");
    }

    #[tokio::test]
    async fn collisions_get_numbered_suffixes() {
        let dir = std::env::temp_dir().join(format!("courier_storage_test_{}", std::process::id()));
        let _ = tokio::fs::remove_dir_all(&dir).await;
        let storage = StorageDir::create(dir.clone()).await.unwrap();

        let first = storage.unique_destination("x.bin").await.unwrap();
        assert_eq!(first, dir.join("x.bin"));
        tokio::fs::write(&first, b"one").await.unwrap();

        let second = storage.unique_destination("x.bin").await.unwrap();
        assert_eq!(second, dir.join("x_1.bin"));
        tokio::fs::write(&second, b"two").await.unwrap();

        let third = storage.unique_destination("x.bin").await.unwrap();
        assert_eq!(third, dir.join("x_2.bin"));

        let no_ext = storage.unique_destination("notes").await.unwrap();
        tokio::fs::write(&no_ext, b"n").await.unwrap();
        let no_ext_2 = storage.unique_destination("notes").await.unwrap();
        assert_eq!(no_ext_2, dir.join("notes_1"));

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
