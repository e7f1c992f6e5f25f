//! Input file reading and rewinding.
//!
//! One logical record per non-blank, non-comment (`#`) line. A seekable
//! file rewinds and re-reads from the top once exhausted, up to
//! `max_runs` passes (`0` = forever); stdin cannot be rewound and is
//! always treated as a single pass.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Seek, SeekFrom, Stdin};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context as _, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextRecord {
    Ok,
    Eof,
    InvalidFile,
}

enum Source {
    File(BufReader<File>),
    Stdin(BufReader<Stdin>),
}

pub struct DataFile {
    source: Source,
    path: PathBuf,
    max_runs: u32,
    runs: u32,
    /// Stands in for the source contract's `set_pipe_fd`: a blocked stdin
    /// read can't be un-blocked by writing to a descriptor the way the
    /// OS-wait primitives in `src/os.rs` do, so shutdown is instead
    /// observed between lines via this shared flag.
    interrupt: Arc<AtomicBool>,
}

impl DataFile {
    pub fn open(path: &Path) -> Result<Self> {
        let is_stdin = path.as_os_str() == "-" || path.as_os_str().is_empty();

        let source = if is_stdin {
            Source::Stdin(BufReader::new(io::stdin()))
        } else {
            let file = File::open(path)
                .with_context(|| format!("Failed to open data file `{}`", path.display()))?;
            Source::File(BufReader::new(file))
        };

        Ok(Self {
            source,
            path: path.to_path_buf(),
            max_runs: 0,
            runs: 0,
            interrupt: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn set_max_runs(&mut self, n: u32) {
        self.max_runs = n;
    }

    pub fn set_interrupt_flag(&mut self, interrupt: Arc<AtomicBool>) {
        self.interrupt = interrupt;
    }

    pub fn nruns(&self) -> u32 {
        self.runs
    }

    /// Yields the next record's text into `out`. `is_update` is accepted to
    /// match the source contract but doesn't change how lines are read —
    /// query vs. update framing is `DnsCodec`'s concern, not `DataFile`'s.
    pub fn next(&mut self, out: &mut String, _is_update: bool) -> Result<NextRecord> {
        loop {
            if self.interrupt.load(Ordering::Relaxed) {
                return Ok(NextRecord::Eof);
            }

            out.clear();
            let mut raw = Vec::new();
            let n = match &mut self.source {
                Source::File(r) => r.read_until(b'\n', &mut raw),
                Source::Stdin(r) => r.read_until(b'\n', &mut raw),
            }
            .with_context(|| format!("Failed to read from `{}`", self.path.display()))?;

            if n == 0 {
                if self.rewind_for_next_run()? {
                    continue;
                }
                return Ok(NextRecord::Eof);
            }

            let Ok(line) = String::from_utf8(raw) else {
                return Ok(NextRecord::InvalidFile);
            };
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            out.push_str(trimmed);
            return Ok(NextRecord::Ok);
        }
    }

    fn rewind_for_next_run(&mut self) -> Result<bool> {
        self.runs += 1;

        if self.max_runs != 0 && self.runs >= self.max_runs {
            return Ok(false);
        }

        match &mut self.source {
            Source::File(r) => {
                r.seek(SeekFrom::Start(0))
                    .with_context(|| format!("Failed to rewind `{}`", self.path.display()))?;
                Ok(true)
            }
            Source::Stdin(_) => Ok(false),
        }
    }

    pub fn close(self) {
        drop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn skips_blank_lines_and_comments() {
        let file = write_temp("# comment\n\nwww.example.com A\n\nwww.example.org AAAA\n");
        let mut df = DataFile::open(file.path()).unwrap();

        let mut out = String::new();
        assert_eq!(df.next(&mut out, false).unwrap(), NextRecord::Ok);
        assert_eq!(out, "www.example.com A");

        assert_eq!(df.next(&mut out, false).unwrap(), NextRecord::Ok);
        assert_eq!(out, "www.example.org AAAA");

        assert_eq!(df.next(&mut out, false).unwrap(), NextRecord::Eof);
    }

    #[test]
    fn rewinds_up_to_max_runs() {
        let file = write_temp("a.example.com A\n");
        let mut df = DataFile::open(file.path()).unwrap();
        df.set_max_runs(3);

        let mut out = String::new();
        for _ in 0..3 {
            assert_eq!(df.next(&mut out, false).unwrap(), NextRecord::Ok);
        }
        assert_eq!(df.next(&mut out, false).unwrap(), NextRecord::Eof);
        assert_eq!(df.nruns(), 3);
    }

    #[test]
    fn unlimited_runs_loop_forever_until_interrupted() {
        let file = write_temp("a.example.com A\n");
        let mut df = DataFile::open(file.path()).unwrap();
        df.set_max_runs(0);

        let mut out = String::new();
        for _ in 0..25 {
            assert_eq!(df.next(&mut out, false).unwrap(), NextRecord::Ok);
        }

        df.set_interrupt_flag(Arc::new(AtomicBool::new(true)));
        assert_eq!(df.next(&mut out, false).unwrap(), NextRecord::Eof);
    }

    #[test]
    fn missing_file_fails_to_open() {
        assert!(DataFile::open(Path::new("/nonexistent/does/not/exist")).is_err());
    }
}
