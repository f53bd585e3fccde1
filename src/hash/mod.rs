//! Content hashing behind a swappable seam
//!
//! All bulk hashing in the crate goes through the [`Hasher`] trait so the
//! implementation can change without touching callers. The default streams
//! files in fixed-size chunks; directory hashes are deterministic over
//! sorted relative paths.

use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::core::MortarResult;

const CHUNK_SIZE: usize = 64 * 1024;

/// Hashing operations used by the cache, updater, and parse cache.
pub trait Hasher: Send + Sync {
    /// SHA-256 of a byte slice, lowercase hex.
    fn sha256(&self, data: &[u8]) -> String;

    /// SHA-256 of a file's contents, lowercase hex.
    fn sha256_file(&self, path: &Path) -> MortarResult<String>;

    /// SHA-256 fingerprint of a directory tree: per-file content hashes
    /// folded over sorted relative paths.
    fn sha256_directory(&self, path: &Path) -> MortarResult<String>;

    /// MD5 of a byte slice, lowercase hex.
    fn md5(&self, data: &[u8]) -> String;

    /// MD5 of a file's contents, lowercase hex.
    fn md5_file(&self, path: &Path) -> MortarResult<String>;

    /// CRC32 of a byte slice, 8-digit lowercase hex.
    fn crc32(&self, data: &[u8]) -> String;

    /// CRC32 of a file's contents, 8-digit lowercase hex.
    fn crc32_file(&self, path: &Path) -> MortarResult<String>;
}

/// Default chunked-read implementation of [`Hasher`].
#[derive(Debug, Default, Clone, Copy)]
pub struct StreamingHasher;

impl StreamingHasher {
    pub fn new() -> Self {
        Self
    }

    fn for_each_chunk<F: FnMut(&[u8])>(path: &Path, mut f: F) -> MortarResult<()> {
        let mut file = std::fs::File::open(path)?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            f(&buf[..n]);
        }
        Ok(())
    }

    /// Regular files under `root`, as sorted root-relative path strings.
    fn sorted_files(root: &Path) -> MortarResult<Vec<(String, std::path::PathBuf)>> {
        let mut files = Vec::new();
        for entry in walkdir::WalkDir::new(root).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
            })?;
            if entry.file_type().is_file() {
                let rel = entry
                    .path()
                    .strip_prefix(root)
                    .unwrap_or(entry.path())
                    .to_string_lossy()
                    .replace('\\', "/");
                files.push((rel, entry.path().to_path_buf()));
            }
        }
        files.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(files)
    }
}

impl Hasher for StreamingHasher {
    fn sha256(&self, data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        hex::encode(hasher.finalize())
    }

    fn sha256_file(&self, path: &Path) -> MortarResult<String> {
        let mut hasher = Sha256::new();
        Self::for_each_chunk(path, |chunk| hasher.update(chunk))?;
        Ok(hex::encode(hasher.finalize()))
    }

    fn sha256_directory(&self, path: &Path) -> MortarResult<String> {
        let mut outer = Sha256::new();
        for (rel, abs) in Self::sorted_files(path)? {
            let file_hash = self.sha256_file(&abs)?;
            outer.update(rel.as_bytes());
            outer.update(b":");
            outer.update(file_hash.as_bytes());
            outer.update(b"\n");
        }
        Ok(hex::encode(outer.finalize()))
    }

    fn md5(&self, data: &[u8]) -> String {
        format!("{:x}", md5::compute(data))
    }

    fn md5_file(&self, path: &Path) -> MortarResult<String> {
        let mut context = md5::Context::new();
        Self::for_each_chunk(path, |chunk| context.consume(chunk))?;
        Ok(format!("{:x}", context.compute()))
    }

    fn crc32(&self, data: &[u8]) -> String {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(data);
        format!("{:08x}", hasher.finalize())
    }

    fn crc32_file(&self, path: &Path) -> MortarResult<String> {
        let mut hasher = crc32fast::Hasher::new();
        Self::for_each_chunk(path, |chunk| hasher.update(chunk))?;
        Ok(format!("{:08x}", hasher.finalize()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_sha256_known_vector() {
        let h = StreamingHasher::new();
        assert_eq!(
            h.sha256(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            h.sha256(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_md5_known_vector() {
        let h = StreamingHasher::new();
        assert_eq!(h.md5(b""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(h.md5(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn test_crc32_known_vector() {
        let h = StreamingHasher::new();
        assert_eq!(h.crc32(b"123456789"), "cbf43926");
    }

    #[test]
    fn test_file_matches_slice() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"hello mortar").unwrap();

        let h = StreamingHasher::new();
        assert_eq!(h.sha256_file(&path).unwrap(), h.sha256(b"hello mortar"));
        assert_eq!(h.md5_file(&path).unwrap(), h.md5(b"hello mortar"));
        assert_eq!(h.crc32_file(&path).unwrap(), h.crc32(b"hello mortar"));
    }

    #[test]
    fn test_directory_hash_is_order_independent() {
        let h = StreamingHasher::new();

        let a = tempdir().unwrap();
        std::fs::create_dir_all(a.path().join("src")).unwrap();
        std::fs::write(a.path().join("src/zeta.cpp"), b"z").unwrap();
        std::fs::write(a.path().join("alpha.hpp"), b"a").unwrap();

        let b = tempdir().unwrap();
        std::fs::create_dir_all(b.path().join("src")).unwrap();
        std::fs::write(b.path().join("alpha.hpp"), b"a").unwrap();
        std::fs::write(b.path().join("src/zeta.cpp"), b"z").unwrap();

        assert_eq!(
            h.sha256_directory(a.path()).unwrap(),
            h.sha256_directory(b.path()).unwrap()
        );
    }

    #[test]
    fn test_directory_hash_sees_content_change() {
        let h = StreamingHasher::new();
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"one").unwrap();
        let before = h.sha256_directory(dir.path()).unwrap();
        std::fs::write(dir.path().join("f"), b"two").unwrap();
        let after = h.sha256_directory(dir.path()).unwrap();
        assert_ne!(before, after);
    }
}
