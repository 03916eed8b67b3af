use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Append-only output files of one monitoring sequence
///
/// ```text
/// <root>/bench/data{seq}.txt             metrics blocks
/// <root>/bench/bench-metadata{seq}.txt   monitor events and script output
/// <root>/crashes/crash{seq}.txt          compiler crashes
/// <root>/storage-diff/diff{seq}.txt      verification discrepancies
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidenceFiles {
    pub sequence: u64,
    pub bench: PathBuf,
    pub metadata: PathBuf,
    pub crashes: PathBuf,
    pub discrepancies: PathBuf,
}

impl EvidenceFiles {
    pub fn new(root: &Path, sequence: u64) -> Self {
        Self {
            sequence,
            bench: root.join("bench").join(format!("data{sequence}.txt")),
            metadata: root.join("bench").join(format!("bench-metadata{sequence}.txt")),
            crashes: root.join("crashes").join(format!("crash{sequence}.txt")),
            discrepancies: root.join("storage-diff").join(format!("diff{sequence}.txt")),
        }
    }

    /// Create the directories and start empty metrics and metadata files
    pub async fn create(&self) -> io::Result<()> {
        for path in [&self.bench, &self.metadata, &self.crashes, &self.discrepancies] {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
        }
        fs::write(&self.bench, b"").await?;
        fs::write(&self.metadata, b"").await?;
        Ok(())
    }
}

/// One past the highest `data{n}.txt` already present, starting at 1
pub fn discover_sequence(root: &Path) -> io::Result<u64> {
    let bench = root.join("bench");
    if !bench.exists() {
        return Ok(1);
    }

    let mut highest = 0;
    for entry in std::fs::read_dir(bench)? {
        let name = entry?.file_name();
        let n = name
            .to_str()
            .and_then(|name| name.strip_prefix("data"))
            .and_then(|rest| rest.strip_suffix(".txt"))
            .and_then(|n| n.parse::<u64>().ok());
        if let Some(n) = n {
            highest = highest.max(n);
        }
    }
    Ok(highest + 1)
}

pub async fn append(path: &Path, text: &str) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(text.as_bytes()).await?;
    file.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sequence_follows_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(discover_sequence(dir.path()).unwrap(), 1);

        EvidenceFiles::new(dir.path(), 1).create().await.unwrap();
        EvidenceFiles::new(dir.path(), 7).create().await.unwrap();
        assert_eq!(discover_sequence(dir.path()).unwrap(), 8);
    }

    #[tokio::test]
    async fn test_append_keeps_existing_lines() {
        let dir = tempfile::tempdir().unwrap();
        let files = EvidenceFiles::new(dir.path(), 3);
        files.create().await.unwrap();

        append(&files.crashes, "first\n").await.unwrap();
        append(&files.crashes, "second\n").await.unwrap();
        let text = std::fs::read_to_string(&files.crashes).unwrap();
        assert_eq!(text, "first\nsecond\n");
        assert!(files.metadata.ends_with("bench/bench-metadata3.txt"));
    }
}
