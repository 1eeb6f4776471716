//! Delimited text input.
//!
//! One tuple per line, fields separated by a single character and parsed in
//! schema order. Files starting with the bzip2 magic `BZh` are decompressed
//! on the fly.

use std::fs::File;
use std::io::{BufRead, BufReader, ErrorKind, Read};
use std::path::Path;
use std::sync::Arc;

use bzip2::read::MultiBzDecoder;
use tracing::info;

use crate::error::{JoinError, Result};
use crate::table::Table;

const BZ2_MAGIC: &[u8; 3] = b"BZh";

pub struct Loader {
    separator: char,
}

impl Loader {
    pub fn new(separator: char) -> Self {
        Self { separator }
    }

    /// Parses `path` into `output`, returning the number of tuples appended.
    pub fn load(&self, path: &Path, output: &mut Table) -> Result<usize> {
        let compressed = is_bz2(path)?;
        let file = File::open(path)?;
        let loaded = if compressed {
            self.load_lines(BufReader::new(MultiBzDecoder::new(file)), output, true)?
        } else {
            self.load_lines(BufReader::new(file), output, false)?
        };
        info!(path = %path.display(), tuples = loaded, compressed, "loaded table");
        Ok(loaded)
    }

    fn load_lines<R: BufRead>(&self, reader: R, output: &mut Table, compressed: bool) -> Result<usize> {
        let schema = Arc::clone(output.schema());
        let mut tuple = vec![0u8; schema.tuple_size()];
        let mut loaded = 0;

        for (n, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| {
                if compressed {
                    JoinError::NotImplemented(format!("unreadable bzip2 stream: {e}"))
                } else {
                    JoinError::Io(e)
                }
            })?;
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            let fields = self.split_line(line);
            schema
                .parse_tuple(&mut tuple, &fields)
                .map_err(|e| at_line(e, n + 1))?;
            output.append(&tuple);
            loaded += 1;
        }
        Ok(loaded)
    }

    /// Splits a line into fields. A single trailing separator, as in TPC-H
    /// `.tbl` files, does not open an extra field.
    pub fn split_line<'l>(&self, line: &'l str) -> Vec<&'l str> {
        let line = line.strip_suffix(self.separator).unwrap_or(line);
        line.split(self.separator).collect()
    }
}

/// Whether the file starts with the bzip2 magic.
pub fn is_bz2(path: &Path) -> Result<bool> {
    let mut header = [0u8; 3];
    match File::open(path)?.read_exact(&mut header) {
        Ok(()) => Ok(&header == BZ2_MAGIC),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn at_line(err: JoinError, line: usize) -> JoinError {
    match err {
        JoinError::Parse { reason, .. } => JoinError::Parse { line, reason },
        other => other,
    }
}
