//! Line-oriented hex firmware images.
//!
//! Every line that starts with `:` becomes one record: the hex digit pairs
//! after the marker, decoded to bytes and passed to the device untouched.
//! Record types and per-line checksums are interpreted by the bootloader,
//! not here. Lines without the marker are skipped.

use crate::error::{Error, Result};
use log::debug;
use std::fs::File;
use std::io::{BufRead, BufReader, Cursor};
use std::path::{Path, PathBuf};

/// Marker that starts a record line.
pub const RECORD_MARKER: u8 = b':';

/// One decoded record, ready to be sent in a ProgramFlash frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// 1-based line number in the image.
    pub line: usize,
    /// Decoded bytes following the marker.
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
enum Source {
    File(PathBuf),
    Text(String),
}

/// A firmware image that can be walked any number of times.
#[derive(Debug, Clone)]
pub struct HexImage {
    source: Source,
}

impl HexImage {
    /// Use the image stored at `path`.
    ///
    /// The file is opened once here to surface a missing file early, and
    /// reopened by every call to [`HexImage::records`].
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading hex image from: {}", path.display());
        File::open(path)?;

        Ok(Self {
            source: Source::File(path.to_path_buf()),
        })
    }

    /// Use an in-memory image.
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            source: Source::Text(text.into()),
        }
    }

    /// Start a fresh pass over the records.
    pub fn records(&self) -> Result<HexRecords<Box<dyn BufRead + '_>>> {
        let reader: Box<dyn BufRead + '_> = match &self.source {
            Source::File(path) => Box::new(BufReader::new(File::open(path)?)),
            Source::Text(text) => Box::new(Cursor::new(text.as_bytes())),
        };
        Ok(HexRecords::new(reader))
    }
}

/// Iterator over the records of one pass.
pub struct HexRecords<R> {
    reader: R,
    line: Vec<u8>,
    line_no: usize,
    done: bool,
}

impl<R: BufRead> HexRecords<R> {
    /// Walk the records of `reader`.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: Vec::new(),
            line_no: 0,
            done: false,
        }
    }
}

impl<R: BufRead> Iterator for HexRecords<R> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            self.line.clear();
            match self.reader.read_until(b'\n', &mut self.line) {
                Ok(0) => self.done = true,
                Ok(_) => {
                    self.line_no += 1;
                    if let Some(record) = decode_line(self.line_no, &self.line) {
                        return Some(record);
                    }
                },
                Err(e) => {
                    self.done = true;
                    return Some(Err(e.into()));
                },
            }
        }
        None
    }
}

/// Decode one line. `None` means the line carries no record.
pub fn decode_line(line_no: usize, line: &[u8]) -> Option<Result<Record>> {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let digits = line.strip_prefix(&[RECORD_MARKER])?;

    if digits.len() % 2 != 0 {
        return Some(Err(Error::InvalidImage {
            line: line_no,
            reason: format!("odd number of hex digits ({})", digits.len()),
        }));
    }

    let mut data = Vec::with_capacity(digits.len() / 2);
    for (i, pair) in digits.chunks_exact(2).enumerate() {
        match (hex_value(pair[0]), hex_value(pair[1])) {
            (Some(hi), Some(lo)) => data.push((hi << 4) | lo),
            _ => {
                return Some(Err(Error::InvalidImage {
                    line: line_no,
                    reason: format!(
                        "invalid hex digits {:?} at column {}",
                        String::from_utf8_lossy(pair),
                        2 + 2 * i
                    ),
                }));
            },
        }
    }

    Some(Ok(Record {
        line: line_no,
        data,
    }))
}

#[allow(clippy::cast_possible_truncation)]
fn hex_value(digit: u8) -> Option<u8> {
    char::from(digit).to_digit(16).map(|v| v as u8)
}
