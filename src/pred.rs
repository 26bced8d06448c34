//! K-way merge over binary MAPQ prediction files.
//!
//! Each file is a series of 16-byte records, two little-endian IEEE-754
//! doubles: the 1-based line ordinal and the predicted MAPQ.  Ordinals are
//! strictly ascending within a file and unique across files.

use anyhow::{bail, Context, Result};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

const PRED_BUFSZ: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub line: u64,
    pub mapq: f64,
}

pub struct PredictionMerger {
    fns: Vec<PathBuf>,
    readers: Vec<BufReader<File>>,
    heads: Vec<Option<Prediction>>,
    /// Known next file, when the previous record's successor ordinal was
    /// already at that file's head; `None` forces an argmin rescan.
    next_hint: Option<usize>,
}

impl PredictionMerger {
    /// Open every file and prime one prediction from each.
    pub fn new<P: AsRef<Path>>(fns: &[P]) -> Result<Self> {
        let mut merger = PredictionMerger {
            fns: fns.iter().map(|p| p.as_ref().to_path_buf()).collect(),
            readers: Vec::with_capacity(fns.len()),
            heads: vec![None; fns.len()],
            next_hint: None,
        };
        for i in 0..merger.fns.len() {
            let fn_ = merger.fns[i].clone();
            let fh = File::open(&fn_)
                .with_context(|| format!("could not open prediction file {}", fn_.display()))?;
            merger.readers.push(BufReader::with_capacity(PRED_BUFSZ, fh));
            merger.advance(i)?;
        }
        Ok(merger)
    }

    /// Next prediction in global ascending line order, or `None` when every
    /// file is exhausted.
    pub fn next(&mut self) -> Result<Option<Prediction>> {
        let argmin = match self.next_hint.take() {
            Some(i) => i,
            None => {
                let mut best: Option<usize> = None;
                let mut min_line = u64::MAX;
                for (i, head) in self.heads.iter().enumerate() {
                    if let Some(p) = head {
                        debug_assert_ne!(p.line, min_line, "duplicate line ordinal across files");
                        if p.line < min_line {
                            min_line = p.line;
                            best = Some(i);
                        }
                    }
                }
                match best {
                    Some(i) => i,
                    None => return Ok(None),
                }
            }
        };
        let pred = self.heads[argmin].take().expect("head primed");
        self.advance(argmin)?;
        // Fast path: if this file's new head continues the run, no other
        // file can hold a smaller ordinal (ordinals are unique and every
        // smaller one has been yielded already).
        if let Some(head) = self.heads[argmin] {
            if head.line == pred.line + 1 {
                self.next_hint = Some(argmin);
            }
        }
        Ok(Some(pred))
    }

    /// Read the next record from file `i` into its head slot.  A clean EOF
    /// clears the slot; a partial record is fatal.
    fn advance(&mut self, i: usize) -> Result<()> {
        let mut rec = [0u8; 16];
        if !read_full_or_eof(&mut self.readers[i], &mut rec).with_context(|| {
            format!("error reading prediction file {}", self.fns[i].display())
        })? {
            self.heads[i] = None;
            return Ok(());
        }
        let line_f = f64::from_le_bytes(rec[..8].try_into().expect("8 bytes"));
        let mapq = f64::from_le_bytes(rec[8..].try_into().expect("8 bytes"));
        if !(0.0..=100.0).contains(&mapq) {
            bail!(
                "MAPQ {} out of range in prediction file {}",
                mapq,
                self.fns[i].display()
            );
        }
        self.heads[i] = Some(Prediction {
            line: line_f as u64,
            mapq,
        });
        Ok(())
    }
}

/// Fill `buf` completely, or return false on a clean EOF at a record
/// boundary.  EOF in the middle of a record is an error.
fn read_full_or_eof<R: Read>(rd: &mut R, buf: &mut [u8]) -> Result<bool> {
    let mut n = 0;
    while n < buf.len() {
        match rd.read(&mut buf[n..]) {
            Ok(0) => {
                if n == 0 {
                    return Ok(false);
                }
                bail!("short read: {} of {} record bytes", n, buf.len());
            }
            Ok(k) => n += k,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn pred_file(preds: &[(u64, f64)]) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        for &(line, mapq) in preds {
            f.write_all(&(line as f64).to_le_bytes()).unwrap();
            f.write_all(&mapq.to_le_bytes()).unwrap();
        }
        f.flush().unwrap();
        f
    }

    fn drain(fns: &[&Path]) -> Vec<(u64, f64)> {
        let mut m = PredictionMerger::new(fns).unwrap();
        let mut out = Vec::new();
        while let Some(p) = m.next().unwrap() {
            out.push((p.line, p.mapq));
        }
        out
    }

    const FILE_A: &[(u64, f64)] = &[(0, 10.0), (2, 20.0), (3, 30.0), (10, 11.0), (12, 1.0)];
    const FILE_B: &[(u64, f64)] = &[
        (1, 17.0),
        (4, 27.0),
        (6, 37.0),
        (11, 47.0),
        (14, 17.0),
        (15, 18.0),
    ];

    #[test]
    fn single_file_passthrough() {
        let a = pred_file(FILE_A);
        assert_eq!(drain(&[a.path()]), FILE_A.to_vec());
    }

    #[test]
    fn two_files_interleave_in_line_order() {
        let a = pred_file(FILE_A);
        let b = pred_file(FILE_B);
        let got = drain(&[a.path(), b.path()]);
        assert_eq!(
            got,
            vec![
                (0, 10.0),
                (1, 17.0),
                (2, 20.0),
                (3, 30.0),
                (4, 27.0),
                (6, 37.0),
                (10, 11.0),
                (11, 47.0),
                (12, 1.0),
                (14, 17.0),
                (15, 18.0),
            ]
        );
    }

    #[test]
    fn three_files_merge_completely() {
        let a = pred_file(FILE_A);
        let b = pred_file(FILE_B);
        let c = pred_file(&[(5, 15.0), (7, 13.0), (8, 13.0), (9, 13.0)]);
        let got = drain(&[a.path(), b.path(), c.path()]);
        assert_eq!(got.len(), FILE_A.len() + FILE_B.len() + 4);
        // Strictly ascending line ordinals, 0..12 plus 14, 15.
        for w in got.windows(2) {
            assert!(w[0].0 < w[1].0);
        }
        assert_eq!(got[5], (5, 15.0));
        assert_eq!(got[7], (7, 13.0));
    }

    #[test]
    fn empty_input_set_yields_nothing() {
        let fns: Vec<&Path> = Vec::new();
        assert!(drain(&fns).is_empty());
    }

    #[test]
    fn empty_file_yields_nothing() {
        let e = pred_file(&[]);
        assert!(drain(&[e.path()]).is_empty());
    }

    #[test]
    fn truncated_record_is_fatal() {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(&1.0f64.to_le_bytes()).unwrap();
        f.write_all(&[0u8; 4]).unwrap(); // half a mapq
        f.flush().unwrap();
        assert!(PredictionMerger::new(&[f.path()]).is_err());
    }

    #[test]
    fn out_of_range_mapq_is_fatal() {
        let f = pred_file(&[(1, 250.0)]);
        assert!(PredictionMerger::new(&[f.path()]).is_err());
    }

    #[test]
    fn sequential_run_stays_in_one_file() {
        // One file holds a dense run; the fast path must still yield the
        // other file's records at the right points.
        let a = pred_file(&[(1, 1.0), (2, 2.0), (3, 3.0), (4, 4.0), (6, 6.0)]);
        let b = pred_file(&[(5, 5.0), (7, 7.0)]);
        let got = drain(&[a.path(), b.path()]);
        assert_eq!(
            got,
            vec![
                (1, 1.0),
                (2, 2.0),
                (3, 3.0),
                (4, 4.0),
                (5, 5.0),
                (6, 6.0),
                (7, 7.0),
            ]
        );
    }
}
