use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use sha2::{Digest, Sha256};

/// Content-addressed JSON cache on disk for generated artifacts. Keys are
/// sha256 digests; entries survive restarts and are cleared explicitly.
pub struct DiskCache {
    cache_dir: PathBuf,
}

pub fn sha256_text(value: &str) -> String {
    sha256_bytes(value.as_bytes())
}

pub fn sha256_bytes(blob: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(blob);
    format!("{:x}", hasher.finalize())
}

fn sanitize(component: &str) -> String {
    component
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedImage {
    pub image_id: String,
    pub image_data_url: String,
}

impl DiskCache {
    pub fn new(cache_dir: &str) -> std::io::Result<Self> {
        let cache_dir = PathBuf::from(cache_dir);
        fs::create_dir_all(&cache_dir)?;
        Ok(Self { cache_dir })
    }

    fn file(&self, kind: &str, key: &str) -> PathBuf {
        self.cache_dir.join(format!("{}_{}.json", sanitize(kind), sanitize(key)))
    }

    pub fn get_json(&self, kind: &str, key: &str) -> Option<Value> {
        let raw = fs::read_to_string(self.file(kind, key)).ok()?;
        serde_json::from_str::<Value>(&raw).ok().filter(Value::is_object)
    }

    pub fn put_json(&self, kind: &str, key: &str, payload: &Value) {
        if let Ok(raw) = serde_json::to_string(payload) {
            // Cache writes are best-effort; a failed write only costs a
            // provider round-trip later.
            let _ = fs::write(self.file(kind, key), raw);
        }
    }

    pub fn get_image(&self, kind: &str, key: &str) -> Option<CachedImage> {
        let payload = self.get_json(kind, key)?;
        let image_data_url =
            payload.get("image_data_url")?.as_str().map(str::trim).filter(|s| !s.is_empty())?.to_string();
        let image_id = payload
            .get("image_id")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("cached-{kind}-{}", &key[..key.len().min(8)]));
        Some(CachedImage { image_id, image_data_url })
    }

    pub fn put_image(&self, kind: &str, key: &str, image_id: &str, image_data_url: &str) {
        self.put_json(kind, key, &json!({"image_id": image_id, "image_data_url": image_data_url}));
    }

    /// Removes every cached file plus any extra artifact directories
    /// (generated CAD runs). Returns the number of files removed.
    pub fn clear_all(&self, extra_dirs: &[&Path]) -> usize {
        let mut removed = remove_files_recursively(&self.cache_dir);
        for dir in extra_dirs {
            removed += remove_files_recursively(dir);
            remove_empty_dirs(dir);
        }
        removed
    }
}

fn remove_files_recursively(dir: &Path) -> usize {
    let Ok(entries) = fs::read_dir(dir) else { return 0 };
    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            removed += remove_files_recursively(&path);
        } else if fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    removed
}

fn remove_empty_dirs(dir: &Path) {
    let Ok(entries) = fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            remove_empty_dirs(&path);
            let _ = fs::remove_dir(&path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn image_entries_round_trip() {
        let tmp = TempDir::new().unwrap();
        let cache = DiskCache::new(tmp.path().join("cache").to_str().unwrap()).unwrap();
        let key = sha256_text("a prompt");
        assert!(cache.get_image("concept", &key).is_none());

        cache.put_image("concept", &key, "img-1", "data:image/png;base64,xyz");
        let hit = cache.get_image("concept", &key).unwrap();
        assert_eq!(hit.image_id, "img-1");
        assert_eq!(hit.image_data_url, "data:image/png;base64,xyz");
    }

    #[test]
    fn blank_data_url_is_a_miss() {
        let tmp = TempDir::new().unwrap();
        let cache = DiskCache::new(tmp.path().join("cache").to_str().unwrap()).unwrap();
        cache.put_image("concept", "k", "img-1", "  ");
        assert!(cache.get_image("concept", "k").is_none());
    }

    #[test]
    fn digests_are_stable() {
        assert_eq!(sha256_text("abc"), sha256_text("abc"));
        assert_ne!(sha256_text("abc"), sha256_text("abd"));
        assert_eq!(sha256_text("abc").len(), 64);
    }

    #[test]
    fn clear_all_removes_cache_and_run_dirs() {
        let tmp = TempDir::new().unwrap();
        let cache = DiskCache::new(tmp.path().join("cache").to_str().unwrap()).unwrap();
        cache.put_image("concept", "k", "img-1", "data:image/png;base64,xyz");

        let runs = tmp.path().join("cad_runs").join("run-1");
        std::fs::create_dir_all(&runs).unwrap();
        std::fs::write(runs.join("generated_cad.py"), "import cadquery as cq").unwrap();

        let removed = cache.clear_all(&[&tmp.path().join("cad_runs")]);
        assert_eq!(removed, 2);
        assert!(cache.get_image("concept", "k").is_none());
        assert!(!runs.exists());
    }
}
