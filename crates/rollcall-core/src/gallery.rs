//! Discovery of reference images in a legacy photo directory.
//!
//! Older deployments kept one directory per partition (`Photos/LY/101/101.jpeg`)
//! and identified students only by the digits in the file name. This module
//! turns such a tree into `(roll number, path)` pairs so they can be enrolled
//! into the explicit gallery index.

use crate::types::RollNumber;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Roll number encoded as the digits immediately preceding the extension,
/// e.g. `photos/LY/101/101.jpeg` or `front_2021300.png`.
pub fn roll_number_from_path(path: &Path) -> Option<RollNumber> {
    let stem = path.file_stem()?.to_str()?;
    let digits_start = stem
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_digit())
        .last()
        .map(|(i, _)| i)?;
    stem[digits_start..].parse().ok()
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
}

/// Walk `root` and collect every reference image with a recoverable roll number,
/// sorted by path.
pub fn scan_partition(root: &Path) -> Vec<(RollNumber, PathBuf)> {
    let mut found = Vec::new();

    for entry in WalkDir::new(root).follow_links(true).sort_by_file_name() {
        let entry = match entry {
            Ok(e) => e,
            Err(err) => {
                tracing::warn!(error = %err, "gallery scan: unreadable entry");
                continue;
            }
        };
        let path = entry.path();
        if !entry.file_type().is_file() || !is_image(path) {
            continue;
        }

        match roll_number_from_path(path) {
            Some(roll) => found.push((roll, path.to_path_buf())),
            None => tracing::warn!(path = %path.display(), "gallery scan: no roll number in file name"),
        }
    }

    tracing::info!(root = %root.display(), images = found.len(), "gallery scan complete");
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_roll_number_from_path() {
        let roll = |p: &str| roll_number_from_path(Path::new(p)).map(|r| r.to_string());
        assert_eq!(roll("Photos/LY/101/101.jpeg").as_deref(), Some("101"));
        assert_eq!(roll("front_2021300.png").as_deref(), Some("2021300"));
        assert_eq!(roll("v2_student42.jpg").as_deref(), Some("42"));
        assert_eq!(roll("101_side.jpeg"), None);
        assert_eq!(roll("lecturer.jpeg"), None);
    }

    #[test]
    fn test_scan_partition() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("101")).unwrap();
        fs::create_dir_all(root.join("102")).unwrap();
        fs::write(root.join("101/101.jpeg"), b"x").unwrap();
        fs::write(root.join("101/profile_101.JPG"), b"x").unwrap();
        fs::write(root.join("102/102.png"), b"x").unwrap();
        fs::write(root.join("102/notes.txt"), b"x").unwrap();
        fs::write(root.join("102/unknown.jpeg"), b"x").unwrap();

        let found = scan_partition(root);
        let rolls: Vec<String> = found.iter().map(|(r, _)| r.to_string()).collect();
        assert_eq!(rolls, vec!["101", "101", "102"]);
        assert!(found.iter().all(|(_, p)| p.starts_with(root)));
    }

    #[test]
    fn test_scan_missing_root() {
        assert!(scan_partition(Path::new("/nonexistent/rollcall/gallery")).is_empty());
    }
}
