//! Chunkwise FASTA reader: yields fixed-size windows over the entries of
//! one or more multi-FASTA files, with consecutive windows of the same
//! reference overlapping by a fixed number of bases.

use anyhow::{ensure, Context, Result};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

/// 256-entry table folding sequence bytes to upper case; anything outside
/// `{A, C, G, T}` maps to `N`.
static DNA_UPPER: [u8; 256] = build_dna_upper();

const fn build_dna_upper() -> [u8; 256] {
    let mut t = [b'N'; 256];
    t[b'A' as usize] = b'A';
    t[b'a' as usize] = b'A';
    t[b'C' as usize] = b'C';
    t[b'c' as usize] = b'C';
    t[b'G' as usize] = b'G';
    t[b'g' as usize] = b'G';
    t[b'T' as usize] = b'T';
    t[b't' as usize] = b'T';
    t
}

const FASTA_BUFSZ: usize = 64 * 1024;

/// A byte pulled from the stream, or end-of-file.  EOF participates in the
/// pushback slot: the byte that terminates a window is unread and seen
/// again on the next call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Byte {
    Eof,
    Chr(u8),
}

/// One window of reference sequence.  The borrowed slice is valid until the
/// next call to [`FastaChunkReader::next_chunk`].
#[derive(Debug)]
pub struct Chunk<'a> {
    /// First whitespace-delimited token of the defline.
    pub refid: &'a str,
    /// Full defline (minus `>` and the newline).
    pub refid_full: &'a str,
    /// 0-based offset of `seq[0]` within its reference.
    pub refoff: u64,
    pub seq: &'a [u8],
}

pub struct FastaChunkReader {
    fns: Vec<PathBuf>,
    fni: usize,
    reader: Option<BufReader<File>>,
    buf: Vec<u8>,
    bufcur: usize, // live bytes in buf
    chunksz: usize,
    olap: usize,
    refoff: u64, // bases consumed from the current reference
    refid: String,
    refid_full: String,
    pushback: Option<Byte>,
}

impl FastaChunkReader {
    pub fn new<P: AsRef<Path>>(fns: &[P], chunksz: usize, olap: usize) -> Result<Self> {
        ensure!(
            chunksz > olap,
            "chunk size ({}) must exceed overlap ({})",
            chunksz,
            olap
        );
        Ok(FastaChunkReader {
            fns: fns.iter().map(|p| p.as_ref().to_path_buf()).collect(),
            fni: 0,
            reader: None,
            buf: vec![0; chunksz],
            bufcur: 0,
            chunksz,
            olap,
            refoff: 0,
            refid: String::new(),
            refid_full: String::new(),
            pushback: None,
        })
    }

    /// Estimated total reference length: the sum of the input files' byte
    /// sizes.  An overestimate (deflines and newlines count), which the
    /// simulator compensates for.
    pub fn estimate_total_len<P: AsRef<Path>>(fns: &[P]) -> Result<u64> {
        let mut total = 0u64;
        for fn_ in fns {
            let md = std::fs::metadata(fn_.as_ref()).with_context(|| {
                format!("could not stat FASTA file {}", fn_.as_ref().display())
            })?;
            total += md.len();
        }
        Ok(total)
    }

    fn get(&mut self) -> Result<Byte> {
        if let Some(b) = self.pushback.take() {
            return Ok(b);
        }
        let reader = self.reader.as_mut().expect("reader open");
        let mut byte = [0u8; 1];
        loop {
            match reader.read(&mut byte) {
                Ok(0) => return Ok(Byte::Eof),
                Ok(_) => return Ok(Byte::Chr(byte[0])),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("error reading FASTA file {}", self.fns[self.fni].display())
                    });
                }
            }
        }
    }

    fn unread(&mut self, b: Byte) {
        debug_assert!(self.pushback.is_none());
        self.pushback = Some(b);
    }

    /// Yield the next window, or `None` once every file is exhausted.
    ///
    /// Within one reference, each window starts `chunksz - olap` bases
    /// after its predecessor; the first `olap` bytes are physically copied
    /// from the previous window's tail.  A new reference (or file) starts a
    /// fresh buffer with no carried overlap.
    pub fn next_chunk(&mut self) -> Result<Option<Chunk<'_>>> {
        loop {
            if self.fni >= self.fns.len() {
                return Ok(None);
            }
            if self.reader.is_none() {
                let path = &self.fns[self.fni];
                let fh = File::open(path)
                    .with_context(|| format!("could not open FASTA file {}", path.display()))?;
                self.reader = Some(BufReader::with_capacity(FASTA_BUFSZ, fh));
            }

            // Carry the tail of the previous window to the front.
            let mut at = self.bufcur;
            if self.bufcur >= self.olap {
                self.buf.copy_within(self.bufcur - self.olap..self.bufcur, 0);
                at = self.olap;
                self.bufcur = self.olap;
            }

            let mut first = true;
            loop {
                match self.get()? {
                    Byte::Eof => {
                        if !first {
                            self.unread(Byte::Eof);
                            self.bufcur = at;
                            let refoff = self.refoff - at as u64;
                            return Ok(Some(self.chunk(refoff, at)));
                        }
                        self.bufcur = 0;
                        self.fni += 1;
                        self.reader = None;
                        break; // next file
                    }
                    Byte::Chr(b'>') => {
                        if !first {
                            self.unread(Byte::Chr(b'>'));
                            self.bufcur = at;
                            let refoff = self.refoff - at as u64;
                            return Ok(Some(self.chunk(refoff, at)));
                        }
                        // Start of a new record: reset buffer and parse the
                        // defline.
                        at = 0;
                        self.bufcur = 0;
                        self.refoff = 0;
                        self.refid.clear();
                        self.refid_full.clear();
                        let mut in_id = true;
                        loop {
                            match self.get()? {
                                Byte::Eof => break,
                                Byte::Chr(c) if c == b'\n' || c == b'\r' => break,
                                Byte::Chr(c) => {
                                    if c.is_ascii_whitespace() {
                                        in_id = false;
                                    }
                                    if in_id {
                                        self.refid.push(c as char);
                                    }
                                    self.refid_full.push(c as char);
                                }
                            }
                        }
                    }
                    Byte::Chr(c) if c.is_ascii_whitespace() => {}
                    Byte::Chr(c) => {
                        first = false;
                        self.buf[at] = DNA_UPPER[c as usize];
                        at += 1;
                        self.refoff += 1;
                        if at == self.chunksz {
                            self.bufcur = at;
                            let refoff = self.refoff - at as u64;
                            return Ok(Some(self.chunk(refoff, at)));
                        }
                    }
                }
            }
        }
    }

    fn chunk(&self, refoff: u64, retsz: usize) -> Chunk<'_> {
        Chunk {
            refid: &self.refid,
            refid_full: &self.refid_full,
            refoff,
            seq: &self.buf[..retsz],
        }
    }
}
