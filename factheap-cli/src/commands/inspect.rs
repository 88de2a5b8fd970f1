//! Inspect command - summarize a flat dependency blob without a region.

use anyhow::{bail, Context, Result};
use std::path::Path;

const TAG: u32 = 1 << 31;

/// Counts gathered from one pass over a blob.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BlobReport {
    /// Runs in the file.
    pub keys: u64,
    /// Values across all runs.
    pub edges: u64,
    /// Key with the longest run, and its length.
    pub widest: Option<(u32, u64)>,
}

/// Walk the words of a blob.
pub fn scan(data: &[u8]) -> Result<BlobReport> {
    if data.len() % 4 != 0 {
        bail!("blob length {} is not a multiple of 4", data.len());
    }
    let mut report = BlobReport::default();
    let mut run: Option<(u32, u64)> = None;
    for (index, chunk) in data.chunks_exact(4).enumerate() {
        let word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        let tagged = word & TAG != 0;
        let Some((key, len)) = run else {
            if !tagged {
                bail!("word {index} should start a run but is untagged");
            }
            run = Some((word & !TAG, 0));
            continue;
        };

        let len = len + 1;
        report.edges += 1;
        if tagged {
            run = Some((key, len));
            continue;
        }
        report.keys += 1;
        if report.widest.map_or(true, |(_, widest)| len > widest) {
            report.widest = Some((key, len));
        }
        run = None;
    }
    if let Some((key, _)) = run {
        bail!("run for v{key} is truncated");
    }
    Ok(report)
}

/// Run the inspect-blob command.
pub fn run(file: &Path) -> Result<()> {
    tracing::info!(file = %file.display(), "Inspecting blob");
    let data =
        std::fs::read(file).with_context(|| format!("Failed to read blob: {}", file.display()))?;
    let report = scan(&data).with_context(|| format!("Malformed blob: {}", file.display()))?;

    println!("Blob Information");
    println!("================");
    println!("Path:     {}", file.display());
    println!("Size:     {} bytes", data.len());
    println!("Keys:     {}", report.keys);
    println!("Edges:    {}", report.edges);
    match report.widest {
        Some((key, len)) => println!("Widest:   v{key} ({len} values)"),
        None => println!("Widest:   -"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(ws: &[u32]) -> Vec<u8> {
        ws.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn counts_runs() {
        let data = words(&[1 | TAG, 2 | TAG, 3, 9 | TAG, 1]);
        let report = scan(&data).unwrap();
        assert_eq!(
            report,
            BlobReport {
                keys: 2,
                edges: 3,
                widest: Some((1, 2)),
            }
        );
    }

    #[test]
    fn rejects_truncated_run() {
        assert!(scan(&words(&[1 | TAG, 2 | TAG])).is_err());
        assert!(scan(&words(&[5])).is_err());
        assert!(scan(&[0u8; 3]).is_err());
    }

    #[test]
    fn empty_blob() {
        assert_eq!(scan(&[]).unwrap(), BlobReport::default());
    }
}
