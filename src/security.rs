use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

/// Replaces secret values with `***` in anything headed for logs or files.
#[derive(Debug, Clone, Default)]
pub struct SecretMasker {
    values: Vec<String>,
}

impl SecretMasker {
    pub fn new(values: impl IntoIterator<Item = String>) -> Self {
        let mut values: Vec<String> = values.into_iter().filter(|v| !v.is_empty()).collect();
        // Longest first so a secret containing another is masked whole.
        values.sort_by(|a, b| b.len().cmp(&a.len()));
        values.dedup();
        Self { values }
    }

    pub fn mask(&self, text: &str) -> String {
        let mut masked = text.to_string();
        for value in &self.values {
            if masked.contains(value.as_str()) {
                masked = masked.replace(value.as_str(), "***");
            }
        }
        masked
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Compute the SHA256 digest of the file at `path` and return it as a hex string.
pub fn compute_sha256(path: &Path) -> Result<String> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open file for hashing: {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Write the SHA256 digest of `path` into the `output` file.
pub fn write_sha256(path: &Path, output: &Path) -> Result<String> {
    let digest = compute_sha256(path)?;
    if let Some(parent) = output.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create digest directory: {}", parent.display()))?;
    }
    let mut file = File::create(output)
        .with_context(|| format!("Failed to create digest file: {}", output.display()))?;
    writeln!(file, "{}  {}", digest, path.display()).with_context(|| {
        format!(
            "Failed to write digest for '{}' into '{}'.",
            path.display(),
            output.display()
        )
    })?;
    Ok(digest)
}

/// Digest over several files plus free-form extra entries. Missing files
/// contribute their path only, so creating one changes the digest.
pub fn fingerprint(files: &[&Path], extra: &[String]) -> Result<String> {
    let mut hasher = Sha256::new();
    for path in files {
        hasher.update(path.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        if path.is_file() {
            let content = std::fs::read(path)
                .with_context(|| format!("Failed to read file for hashing: {}", path.display()))?;
            hasher.update(&content);
        }
        hasher.update([0u8]);
    }
    for entry in extra {
        hasher.update(entry.as_bytes());
        hasher.update([0u8]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn compute_sha256_is_stable() {
        let temp = tempdir().unwrap();
        let file_path = temp.path().join("digest.bin");
        let mut file = File::create(&file_path).unwrap();
        file.write_all(b"mlsecops").unwrap();

        let digest = compute_sha256(&file_path).unwrap();
        assert_eq!(
            digest,
            "05d76492e8f246ad99f68bca38d8a568286343267353ce47bb13f95e9967131b"
        );
    }

    #[test]
    fn fingerprint_changes_with_file_content() {
        let temp = tempdir().unwrap();
        let req = temp.path().join("requirements.txt");
        std::fs::write(&req, "pandas==2.2.2\n").unwrap();
        let first = fingerprint(&[req.as_path()], &[]).unwrap();
        assert_eq!(first, fingerprint(&[req.as_path()], &[]).unwrap());

        std::fs::write(&req, "pandas==2.2.3\n").unwrap();
        let second = fingerprint(&[req.as_path()], &[]).unwrap();
        assert_ne!(first, second);

        let third = fingerprint(&[req.as_path()], &["garak".to_string()]).unwrap();
        assert_ne!(second, third);
    }

    #[test]
    fn masker_hides_every_occurrence() {
        let masker = SecretMasker::new(["s3cr3t".to_string(), String::new()]);
        assert_eq!(masker.mask("a=s3cr3t b=s3cr3t"), "a=*** b=***");
        assert_eq!(masker.mask("nothing here"), "nothing here");
        assert!(!masker.is_empty());
    }
}
