//! Fixture scaffolding utilities for integration tests.

use std::path::Path;

/// Recursively copy a directory tree. Preserves file contents but not metadata.
pub fn copy_dir_recursive(src: &Path, dst: &Path) {
    if !dst.exists() {
        std::fs::create_dir_all(dst).expect("Failed to create dir");
    }
    for entry in std::fs::read_dir(src).expect("Failed to read dir") {
        let entry = entry.expect("Failed to read entry");
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        if src_path.is_dir() {
            copy_dir_recursive(&src_path, &dst_path);
        } else {
            std::fs::copy(&src_path, &dst_path).expect("Failed to copy file");
        }
    }
}

/// Generate a large TypeScript file of `total_lines` filler lines with a
/// distinctive function block spanning `[block_start, block_end]` (1-based).
pub fn large_file_with_block(total_lines: usize, block_start: usize, block_end: usize) -> String {
    let mut lines = Vec::with_capacity(total_lines);
    for line in 1..=total_lines {
        if line == block_start {
            lines.push("export function migrateLegacyRecords(batch: Record[]) {".to_string());
        } else if line > block_start && line < block_end {
            lines.push(format!("  normalizeRecord(batch[{}]);", line - block_start));
        } else if line == block_end {
            lines.push("}".to_string());
        } else {
            lines.push(format!("// filler line {line}"));
        }
    }
    lines.join("\n")
}
