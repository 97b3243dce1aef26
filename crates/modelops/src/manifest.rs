use std::path::Path;

use walkdir::WalkDir;

use crate::ModelFile;

/// What a downloaded model directory holds, plus its fingerprint.
#[derive(Clone, Debug, PartialEq)]
pub struct Manifest {
    /// Sorted by `rel_path`.
    pub files: Vec<ModelFile>,
    pub size_bytes: u64,
    pub hash: String,
}

impl Manifest {
    /// Blocking walk of `dir`. A missing directory gives an empty manifest.
    pub fn of_dir(dir: &Path) -> Self {
        let mut files = collect_files(dir);
        files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
        let size_bytes = files.iter().map(|f| f.size).sum();
        let hash = manifest_hash(&files);
        Self { files, size_bytes, hash }
    }
}

/// Fingerprint of a snapshot, independent of walk order. Each file feeds
/// its relative path, a NUL and its size as little-endian u64.
pub fn manifest_hash(files: &[ModelFile]) -> String {
    let mut ordered: Vec<&ModelFile> = files.iter().collect();
    ordered.sort_unstable_by(|a, b| a.rel_path.cmp(&b.rel_path));

    let mut hasher = blake3::Hasher::new();
    for f in ordered {
        hasher.update(f.rel_path.as_bytes());
        hasher.update(&[0]);
        hasher.update(&f.size.to_le_bytes());
    }
    hex::encode(hasher.finalize().as_bytes())
}

/// Every regular file under `dir`, relative paths with `/` separators.
/// Entries that cannot be read are skipped.
pub fn collect_files(dir: &Path) -> Vec<ModelFile> {
    let mut out = Vec::new();
    for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        let Ok(rel) = entry.path().strip_prefix(dir) else { continue };
        let rel_path = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        out.push(ModelFile { rel_path, size: meta.len() });
    }
    out
}

/// Recursive size in bytes, best effort.
pub fn dir_size(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(root: &Path, rel: &str, len: usize) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, vec![0u8; len]).unwrap();
    }

    fn sharded_model(root: &Path) {
        write(root, "config.json", 2);
        write(root, "tokenizer.json", 5);
        write(root, "model-00001-of-00002.safetensors", 10);
        write(root, "model-00002-of-00002.safetensors", 7);
        write(root, "original/params.json", 3);
    }

    #[test]
    fn test_manifest_of_sharded_model_dir() {
        let dir = tempfile::tempdir().unwrap();
        sharded_model(dir.path());

        let m = Manifest::of_dir(dir.path());

        let paths: Vec<&str> = m.files.iter().map(|f| f.rel_path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "config.json",
                "model-00001-of-00002.safetensors",
                "model-00002-of-00002.safetensors",
                "original/params.json",
                "tokenizer.json",
            ]
        );
        assert_eq!(m.size_bytes, 27);
        assert_eq!(m.size_bytes, dir_size(dir.path()));
        assert_eq!(m.hash, manifest_hash(&m.files));
    }

    #[test]
    fn test_identical_snapshots_in_different_roots_match() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        sharded_model(a.path());
        sharded_model(&b.path().join("Qwen--Qwen2.5-7B"));

        assert_eq!(
            Manifest::of_dir(a.path()).hash,
            Manifest::of_dir(&b.path().join("Qwen--Qwen2.5-7B")).hash
        );
    }

    #[test]
    fn test_partial_or_moved_shards_change_the_hash() {
        let dir = tempfile::tempdir().unwrap();
        sharded_model(dir.path());
        let full = Manifest::of_dir(dir.path()).hash;

        // interrupted download: second shard truncated
        write(dir.path(), "model-00002-of-00002.safetensors", 3);
        let partial = Manifest::of_dir(dir.path()).hash;
        assert_ne!(full, partial);

        write(dir.path(), "model-00002-of-00002.safetensors", 7);
        fs::rename(dir.path().join("original/params.json"), dir.path().join("params.json")).unwrap();
        assert_ne!(full, Manifest::of_dir(dir.path()).hash);
    }

    #[test]
    fn test_missing_dir_is_empty_manifest() {
        let m = Manifest::of_dir(Path::new("/definitely/not/here"));
        assert!(m.files.is_empty());
        assert_eq!(m.size_bytes, 0);
        assert_eq!(m.hash, manifest_hash(&[]));
    }
}
