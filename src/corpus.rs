use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path};

/// Relative path -> content. Fixed once the suite is defined; seeds both the
/// saved-state build root and every working repo.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Corpus {
    files: BTreeMap<String, String>,
}

impl Corpus {
    #[cfg(test)]
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn with_file(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.files.insert(path.into(), content.into());
        self
    }

    pub fn files(&self) -> impl Iterator<Item = (&str, &str)> {
        self.files.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        for path in self.files.keys() {
            validate_relative(path)?;
        }
        Ok(())
    }

    /// Write every file under `dir`, creating parents as needed.
    pub fn write_to(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        for (rel, content) in &self.files {
            validate_relative(rel)?;
            let path = dir.join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            fs::write(&path, content)
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }
        Ok(())
    }

    /// Remove `dir` entirely and write the corpus into a fresh directory, so
    /// nothing from a previous test survives.
    pub fn reset(&self, dir: &Path) -> Result<()> {
        if dir.exists() {
            fs::remove_dir_all(dir)
                .with_context(|| format!("Failed to remove {}", dir.display()))?;
        }
        self.write_to(dir)
    }

    /// Read every regular file under `dir` back into a corpus.
    #[cfg(test)]
    pub fn capture(dir: &Path) -> Result<Self> {
        let mut files = BTreeMap::new();
        for entry in walkdir::WalkDir::new(dir).sort_by_file_name() {
            let entry = entry.with_context(|| format!("Failed to walk {}", dir.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(dir)
                .with_context(|| format!("{} escaped {}", entry.path().display(), dir.display()))?;
            let content = fs::read_to_string(entry.path())
                .with_context(|| format!("Failed to read {}", entry.path().display()))?;
            files.insert(rel.to_string_lossy().replace('\\', "/"), content);
        }
        Ok(Self { files })
    }
}

/// Corpus paths (and mutation targets) must stay inside the repo.
pub fn validate_relative(rel: &str) -> Result<()> {
    let path = Path::new(rel);
    if rel.is_empty() || path.is_absolute() {
        bail!("corpus path must be relative: {:?}", rel);
    }
    if path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        bail!("corpus path must not leave the repo: {:?}", rel);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> Corpus {
        Corpus::new()
            .with_file(".hhconfig", "assume_php = false")
            .with_file("foo_1.php", "<?hh\nfunction f() {}\n")
            .with_file("lib/foo_2.php", "<?hh\nfunction g(): int { return 0; }\n")
    }

    #[test]
    fn write_then_capture_is_identity() {
        let tmp = TempDir::new().unwrap();
        let corpus = sample();
        corpus.write_to(tmp.path()).unwrap();
        assert_eq!(Corpus::capture(tmp.path()).unwrap(), corpus);
    }

    #[test]
    fn reset_leaves_no_residue() {
        let tmp = TempDir::new().unwrap();
        let repo = tmp.path().join("repo");
        let corpus = sample();
        corpus.write_to(&repo).unwrap();
        fs::write(repo.join("stray.php"), "<?hh").unwrap();
        fs::write(repo.join("foo_1.php"), "edited").unwrap();

        corpus.reset(&repo).unwrap();
        assert_eq!(Corpus::capture(&repo).unwrap(), corpus);
    }

    #[test]
    fn same_corpus_writes_anywhere() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let corpus = sample();
        corpus.write_to(a.path()).unwrap();
        corpus.write_to(&b.path().join("deeper")).unwrap();
        assert_eq!(
            Corpus::capture(a.path()).unwrap(),
            Corpus::capture(&b.path().join("deeper")).unwrap()
        );
    }

    #[test]
    fn rejects_escaping_paths() {
        assert!(validate_relative("../outside.php").is_err());
        assert!(validate_relative("/etc/passwd").is_err());
        assert!(validate_relative("").is_err());
        assert!(validate_relative("a/./b.php").is_ok());
        assert!(Corpus::new().with_file("x/../../y", "").validate().is_err());
    }
}
