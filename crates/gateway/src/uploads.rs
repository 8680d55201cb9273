//! Temporary storage for media received over HTTP before it is sent.

use std::{
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use {
    tokio::task::JoinHandle,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

/// Write an upload under `dir` with a unique name that keeps the original
/// extension.
pub async fn store_upload(dir: &Path, original_name: &str, bytes: &[u8]) -> std::io::Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let ext = Path::new(original_name)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| e.len() <= 8 && e.chars().all(|c| c.is_ascii_alphanumeric()));
    let name = match ext {
        Some(ext) => format!("{}.{ext}", uuid::Uuid::new_v4()),
        None => uuid::Uuid::new_v4().to_string(),
    };
    let path = dir.join(name);
    tokio::fs::write(&path, bytes).await?;
    debug!(path = %path.display(), size = bytes.len(), "stored upload");
    Ok(path)
}

/// Delete regular files in `dir` last modified more than `max_age` ago.
/// A missing directory counts as empty.
pub async fn sweep_stale_uploads(dir: &Path, max_age: Duration) -> std::io::Result<usize> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let now = SystemTime::now();
    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let meta = match entry.metadata().await {
            Ok(meta) if meta.is_file() => meta,
            _ => continue,
        };
        let age = meta
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age <= max_age {
            continue;
        }
        match tokio::fs::remove_file(entry.path()).await {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %entry.path().display(), error = %e, "failed to remove stale upload"),
        }
    }
    if removed > 0 {
        info!(dir = %dir.display(), removed, "swept stale uploads");
    }
    Ok(removed)
}

pub fn spawn_upload_janitor(
    dir: PathBuf,
    every: Duration,
    max_age: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval(every.max(Duration::from_secs(1)));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticks.tick() => {
                    if let Err(e) = sweep_stale_uploads(&dir, max_age).await {
                        warn!(dir = %dir.display(), error = %e, "upload sweep failed");
                    }
                },
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sweep_removes_only_old_files() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("old.jpg");
        let fresh = dir.path().join("fresh.jpg");
        std::fs::write(&old, b"x").unwrap();
        std::fs::write(&fresh, b"y").unwrap();
        std::fs::File::options()
            .write(true)
            .open(&old)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(2 * 86_400))
            .unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        let removed = sweep_stale_uploads(dir.path(), Duration::from_secs(86_400))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(!old.exists());
        assert!(fresh.exists());
        assert!(dir.path().join("nested").exists());
    }

    #[tokio::test]
    async fn missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("nope");
        assert_eq!(sweep_stale_uploads(&gone, Duration::ZERO).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn store_keeps_safe_extension() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("uploads");
        let path = store_upload(&target, "photo.PNG", b"png").await.unwrap();
        assert_eq!(path.extension().unwrap(), "PNG");
        assert_eq!(std::fs::read(&path).unwrap(), b"png");

        let odd = store_upload(&target, "../../etc/passwd", b"x").await.unwrap();
        assert!(odd.starts_with(&target));
        assert!(odd.extension().is_none());
    }
}
