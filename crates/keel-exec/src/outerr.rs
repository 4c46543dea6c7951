//! Scoped stdout/stderr log handles.
//!
//! Both handles are opened on construction and closed when the value is
//! dropped, on every exit path of the caller.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct FileOutErr {
    out_path: PathBuf,
    err_path: PathBuf,
    out: File,
    err: File,
}

impl FileOutErr {
    /// Create (truncating) both files, creating parent directories as needed.
    pub fn create(out_path: impl Into<PathBuf>, err_path: impl Into<PathBuf>) -> io::Result<Self> {
        let out_path = out_path.into();
        let err_path = err_path.into();
        for path in [&out_path, &err_path] {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
        }
        let out = File::create(&out_path)?;
        let err = File::create(&err_path)?;
        Ok(Self {
            out_path,
            err_path,
            out,
            err,
        })
    }

    pub fn out_path(&self) -> &Path {
        &self.out_path
    }

    pub fn err_path(&self) -> &Path {
        &self.err_path
    }

    pub fn out(&self) -> &File {
        &self.out
    }

    pub fn err(&self) -> &File {
        &self.err
    }

    /// Write a line to the stdout log (used for harness banners).
    pub fn write_out_line(&self, line: &str) -> io::Result<()> {
        let mut out = &self.out;
        writeln!(out, "{line}")
    }

    /// Close both handles, append the stderr log to the stdout log and
    /// remove the stderr file.
    pub fn append_err_to_out(self) -> io::Result<PathBuf> {
        let FileOutErr {
            out_path,
            err_path,
            out,
            err,
        } = self;
        out.sync_all()?;
        drop(out);
        drop(err);

        let stderr = fs::read(&err_path)?;
        if !stderr.is_empty() {
            let mut log = OpenOptions::new().append(true).open(&out_path)?;
            log.write_all(&stderr)?;
        }
        fs::remove_file(&err_path)?;
        Ok(out_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_makes_parents() {
        let dir = tempfile::tempdir().unwrap();
        let outerr = FileOutErr::create(
            dir.path().join("a/b/test.log"),
            dir.path().join("a/b/test.err"),
        )
        .unwrap();
        assert!(outerr.out_path().exists());
        assert!(outerr.err_path().exists());
    }

    #[test]
    fn test_append_err_to_out() {
        let dir = tempfile::tempdir().unwrap();
        let outerr =
            FileOutErr::create(dir.path().join("test.log"), dir.path().join("test.err")).unwrap();
        outerr.write_out_line("from stdout").unwrap();
        {
            let mut err = outerr.err();
            writeln!(err, "from stderr").unwrap();
        }

        let log = outerr.append_err_to_out().unwrap();

        let content = fs::read_to_string(&log).unwrap();
        assert_eq!(content, "from stdout\nfrom stderr\n");
        assert!(!dir.path().join("test.err").exists());
    }

    #[test]
    fn test_append_empty_err_leaves_log_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let outerr =
            FileOutErr::create(dir.path().join("test.log"), dir.path().join("test.err")).unwrap();
        outerr.write_out_line("only").unwrap();
        let log = outerr.append_err_to_out().unwrap();
        assert_eq!(fs::read_to_string(log).unwrap(), "only\n");
    }
}
