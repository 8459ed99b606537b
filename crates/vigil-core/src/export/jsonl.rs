//! Append-mode JSONL effector with size-based rollover.
//!
//! Used by the `task_jsonl` and `infrastructure` sinks. When the file has
//! reached `rotate_max_bytes` before an append, it is renamed to
//! `<stem>.<epoch><ext>` and a fresh file is started.

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::Value;

use super::ExportError;

/// Appends JSON rows, one per line, to a (possibly rotating) file.
pub struct JsonlEffector {
    path: PathBuf,
    rotate_max_bytes: Option<u64>,
}

impl JsonlEffector {
    /// Creates an effector for the given path.
    #[must_use]
    pub fn new(path: impl AsRef<Path>, rotate_max_bytes: Option<u64>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            rotate_max_bytes,
        }
    }

    /// Appends the rows, rotating first if the file is over the limit.
    ///
    /// Returns the number of rows written. An empty batch is a no-op and
    /// does not create the file.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the file cannot be written or rotated.
    pub fn emit(&self, rows: &[Value]) -> Result<usize, ExportError> {
        if rows.is_empty() {
            return Ok(0);
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        self.maybe_rotate()?;

        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        for row in rows {
            let line = serde_json::to_string(row)?;
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")?;
        }
        file.flush()?;
        Ok(rows.len())
    }

    fn maybe_rotate(&self) -> Result<(), ExportError> {
        let Some(limit) = self.rotate_max_bytes else {
            return Ok(());
        };
        let Ok(metadata) = std::fs::metadata(&self.path) else {
            return Ok(());
        };
        if metadata.len() < limit {
            return Ok(());
        }

        let stem = self
            .path
            .file_stem()
            .map_or_else(|| "rotated".to_string(), |s| s.to_string_lossy().into_owned());
        let ext = self
            .path
            .extension()
            .map_or_else(String::new, |e| format!(".{}", e.to_string_lossy()));
        let rotated = self
            .path
            .with_file_name(format!("{stem}.{}{ext}", Utc::now().timestamp()));
        tracing::info!(from = %self.path.display(), to = %rotated.display(), "rotating jsonl sink");
        std::fs::rename(&self.path, rotated)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_appends_one_line_per_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.jsonl");
        let effector = JsonlEffector::new(&path, None);

        assert_eq!(effector.emit(&[json!({"id": "t1"}), json!({"id": "t2"})]).unwrap(), 2);
        assert_eq!(effector.emit(&[json!({"id": "t3"})]).unwrap(), 1);

        let lines: Vec<String> = std::fs::read_to_string(&path)
            .unwrap()
            .lines()
            .map(String::from)
            .collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[2].contains("t3"));
    }

    #[test]
    fn test_empty_batch_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.jsonl");
        JsonlEffector::new(&path, None).emit(&[]).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_rotation_when_over_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("actions.jsonl");
        let effector = JsonlEffector::new(&path, Some(8));

        effector.emit(&[json!({"id": "a_fairly_long_row"})]).unwrap();
        // File is now past 8 bytes; the next emit rotates first.
        effector.emit(&[json!({"id": "next"})]).unwrap();

        let rotated: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with("actions.") && name != "actions.jsonl")
            .collect();
        assert_eq!(rotated.len(), 1, "expected one rotated file, got {rotated:?}");
        let current = std::fs::read_to_string(&path).unwrap();
        assert!(current.contains("next"));
        assert!(!current.contains("a_fairly_long_row"));
    }
}
