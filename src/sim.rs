//! Tandem read simulator: draws templates from the input model, applies
//! their edit transcripts to freshly read reference windows, and writes
//! labeled FASTQ reads until per-class count budgets are met.

use crate::fasta::{Chunk, FastaChunkReader};
use crate::model::{InputModelPaired, InputModelUnpaired, TemplateStore};
use crate::rng::RngSource;
use anyhow::{bail, Result};
use std::io::Write;
use std::path::Path;

/// Read-name prefix marking a read as simulator-generated.  The correctness
/// oracle keys on the same constants.
pub const SIM_PREFIX: &str = "qsim!";
pub const SIM_SEP: &str = ":";

/// Placement attempts per draw before the draw is abandoned.
const MAX_ATTEMPTS: usize = 10;

/// Windows at least this fraction `N` are skipped outright.
const WINDOW_N_FRACTION: f64 = 0.9;

/// Constant quality for the random companion mate of a bad-end pair.
const BAD_END_QUAL: u8 = b'I';

/// Watson-Crick complements, covering the IUPAC ambiguity codes; `-` maps
/// to itself and anything unrecognized maps to 0.
static COMPLEMENT: [u8; 256] = build_complement();

const fn build_complement() -> [u8; 256] {
    let mut t = [0u8; 256];
    let pairs: &[(u8, u8)] = &[
        (b'A', b'T'),
        (b'C', b'G'),
        (b'G', b'C'),
        (b'T', b'A'),
        (b'U', b'A'),
        (b'R', b'Y'),
        (b'Y', b'R'),
        (b'S', b'S'),
        (b'W', b'W'),
        (b'K', b'M'),
        (b'M', b'K'),
        (b'B', b'V'),
        (b'V', b'B'),
        (b'D', b'H'),
        (b'H', b'D'),
        (b'N', b'N'),
    ];
    let mut i = 0;
    while i < pairs.len() {
        let (from, to) = pairs[i];
        t[from as usize] = to;
        t[(from + 32) as usize] = to + 32; // lower case
        i += 1;
    }
    t[b'-' as usize] = b'-';
    t
}

pub fn reverse_complement(seq: &mut [u8]) {
    seq.reverse();
    for b in seq.iter_mut() {
        *b = COMPLEMENT[*b as usize];
    }
}

/// Budget shaping function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimFunction {
    Sqrt,
    Linear,
}

pub struct SimParams {
    pub factor: f64,
    pub function: SimFunction,
    pub min_u: u64,
    pub min_b: u64,
    pub min_c: u64,
    pub min_d: u64,
    /// Rolling FASTA buffer length.
    pub chunksz: usize,
}

/// Per-class target count: `max(min, factor * f(n_observed))`, zero when
/// the class was never observed.
pub(crate) fn target_count(n_observed: u64, factor: f64, function: SimFunction, min: u64) -> u64 {
    if n_observed == 0 {
        return 0;
    }
    let shaped = match function {
        SimFunction::Sqrt => (n_observed as f64).sqrt(),
        SimFunction::Linear => n_observed as f64,
    };
    ((factor * shaped) as u64).max(min)
}

#[derive(Debug, Default)]
pub struct SimStats {
    pub n_wrote_u: u64,
    pub n_wrote_b: u64,
    pub n_wrote_c: u64,
    pub n_wrote_d: u64,
    pub n_windows: u64,
    pub n_windows_skipped_short: u64,
    pub n_windows_skipped_n: u64,
    pub n_placement_failed: u64,
}

impl SimStats {
    pub fn n_wrote_total(&self) -> u64 {
        self.n_wrote_u + self.n_wrote_b + self.n_wrote_c + self.n_wrote_d
    }
}

/// FASTQ sinks: one file for unpaired reads, mate-1/mate-2 pairs for the
/// three paired classes.
pub struct SimOutputs<W: Write> {
    pub u: W,
    pub b1: W,
    pub b2: W,
    pub c1: W,
    pub c2: W,
    pub d1: W,
    pub d2: W,
}

/// A simulated read under construction.  The sequence buffer is reused
/// across draws and grows on demand.
#[derive(Default)]
struct SimulatedRead {
    seq: Vec<u8>,
    qual: Vec<u8>,
}

impl SimulatedRead {
    /// Mutate a reference substring into a read according to the edit
    /// transcript: `=` copies, `X` substitutes, `I` inserts, `D`/`N` skip
    /// reference, `S` draws a clipped base.
    fn mutate(&mut self, refseq: &[u8], xscript: &[u8], rng: &mut dyn RngSource) -> Result<()> {
        self.seq.clear();
        let mut ri = 0usize;
        for &op in xscript {
            match op {
                b'=' => {
                    self.seq.push(refseq[ri]);
                    ri += 1;
                }
                b'X' => {
                    self.seq.push(rng.draw_base_except(refseq[ri]));
                    ri += 1;
                }
                b'I' => self.seq.push(rng.draw_base()),
                b'D' | b'N' => ri += 1,
                b'S' => {
                    self.seq.push(rng.draw_base());
                    ri += 1;
                }
                _ => bail!("invalid edit transcript byte '{}'", op as char),
            }
        }
        Ok(())
    }

    /// Write one FASTQ record.  Reverse-strand reads are emitted
    /// reverse-complemented with reversed qualities.
    fn write<W: Write>(&mut self, fh: &mut W, name: &str, qual: &[u8], fw: bool) -> Result<()> {
        debug_assert_eq!(self.seq.len(), qual.len());
        self.qual.clear();
        self.qual.extend_from_slice(qual);
        if !fw {
            reverse_complement(&mut self.seq);
            self.qual.reverse();
        }
        fh.write_all(b"@")?;
        fh.write_all(name.as_bytes())?;
        fh.write_all(b"\n")?;
        fh.write_all(&self.seq)?;
        fh.write_all(b"\n+\n")?;
        fh.write_all(&self.qual)?;
        fh.write_all(b"\n")?;
        Ok(())
    }
}

fn push_tuple(name: &mut String, refid: &str, fw: bool, refoff: u64, score: i32) {
    name.push_str(SIM_SEP);
    name.push_str(refid);
    name.push_str(SIM_SEP);
    name.push(if fw { '+' } else { '-' });
    name.push_str(SIM_SEP);
    name.push_str(&refoff.to_string());
    name.push_str(SIM_SEP);
    name.push_str(&score.to_string());
}

fn all_acgt(seq: &[u8]) -> bool {
    seq.iter().all(|b| matches!(b, b'A' | b'C' | b'G' | b'T'))
}

/// Simulate one batch of reads over the given FASTA inputs, using the
/// template store accumulated by the scanner.
pub fn simulate_batch<W: Write, P: AsRef<Path>>(
    fastas: &[P],
    store: &TemplateStore,
    params: &SimParams,
    outs: &mut SimOutputs<W>,
    rng: &mut dyn RngSource,
) -> Result<SimStats> {
    let model_u = InputModelUnpaired::new(&store.u);
    let model_b = InputModelUnpaired::new(&store.b);
    let model_c = InputModelPaired::new(&store.c);
    let model_d = InputModelPaired::new(&store.d);

    let t_u = target_count(model_u.n_added(), params.factor, params.function, params.min_u);
    let t_b = target_count(model_b.n_added(), params.factor, params.function, params.min_b);
    let t_c = target_count(model_c.n_added(), params.factor, params.function, params.min_c);
    let t_d = target_count(model_d.n_added(), params.factor, params.function, params.min_d);

    let mut stats = SimStats::default();
    if t_u + t_b + t_c + t_d == 0 {
        return Ok(stats);
    }

    // The window overlap must fit the largest footprint any template can
    // produce, so every draw can be satisfied within one window.
    let olap = model_u
        .max_reflen()
        .max(model_b.max_reflen())
        .max(model_c.max_fraglen())
        .max(model_d.max_fraglen())
        .max(1);
    let chunksz = params.chunksz.max(olap + 1);
    let total_len = FastaChunkReader::estimate_total_len(fastas)?.max(1);

    let mut fa = FastaChunkReader::new(fastas, chunksz, olap)?;
    let mut read1 = SimulatedRead::default();
    let mut read2 = SimulatedRead::default();

    while let Some(chunk) = fa.next_chunk()? {
        stats.n_windows += 1;
        let retsz = chunk.seq.len();
        if retsz < olap {
            stats.n_windows_skipped_short += 1;
            continue;
        }
        let n_count = chunk.seq.iter().filter(|&&b| b == b'N').count();
        if n_count as f64 >= WINDOW_N_FRACTION * retsz as f64 {
            stats.n_windows_skipped_n += 1;
            continue;
        }
        let nchances = retsz - olap + 1;
        // The 1.1 inflation compensates for the conservative byte-size
        // estimate of the total reference length.
        let p = (1.1 * nchances as f64 / total_len as f64).min(0.999);

        if !model_u.is_empty() {
            for _ in 0..rng.binomial(t_u, p) {
                if sim_unpaired(&chunk, &model_u, olap, false, outs, &mut read1, rng)? {
                    stats.n_wrote_u += 1;
                } else {
                    stats.n_placement_failed += 1;
                }
            }
        }
        if !model_b.is_empty() {
            for _ in 0..rng.binomial(t_b, p) {
                if sim_unpaired(&chunk, &model_b, olap, true, outs, &mut read1, rng)? {
                    stats.n_wrote_b += 1;
                } else {
                    stats.n_placement_failed += 1;
                }
            }
        }
        if !model_c.is_empty() {
            for _ in 0..rng.binomial(t_c, p) {
                if sim_paired(&chunk, &model_c, olap, b'c', outs, &mut read1, &mut read2, rng)? {
                    stats.n_wrote_c += 1;
                } else {
                    stats.n_placement_failed += 1;
                }
            }
        }
        if !model_d.is_empty() {
            for _ in 0..rng.binomial(t_d, p) {
                if sim_paired(&chunk, &model_d, olap, b'd', outs, &mut read1, &mut read2, rng)? {
                    stats.n_wrote_d += 1;
                } else {
                    stats.n_placement_failed += 1;
                }
            }
        }
    }
    Ok(stats)
}

/// One unpaired (or bad-end) draw.  Returns true if a read was written
/// within the attempt budget.
fn sim_unpaired<W: Write>(
    chunk: &Chunk<'_>,
    model: &InputModelUnpaired<'_>,
    olap: usize,
    bad_end: bool,
    outs: &mut SimOutputs<W>,
    read: &mut SimulatedRead,
    rng: &mut dyn RngSource,
) -> Result<bool> {
    let t = model.draw(rng);
    let rlen = t.reflen();
    let retsz = chunk.seq.len();
    if rlen == 0 || rlen > retsz {
        return Ok(false);
    }
    let span = retsz - olap;
    for _ in 0..MAX_ATTEMPTS {
        let off = (rng.uniform_01() * span as f64) as usize;
        if off + rlen > retsz {
            continue;
        }
        let footprint = &chunk.seq[off..off + rlen];
        if !all_acgt(footprint) {
            continue;
        }
        read.mutate(footprint, &t.xscript, rng)?;
        let refoff = chunk.refoff + off as u64;

        let mut name = String::from(SIM_PREFIX);
        if bad_end {
            // Both mate tuples appear in the name; the companion mate is
            // random bases, so its tuple just mirrors the aligned mate's
            // coordinates with a zero score.
            if t.mate == b'2' {
                push_tuple(&mut name, chunk.refid, !t.fw, refoff, 0);
                push_tuple(&mut name, chunk.refid, t.fw, refoff, t.best_score);
            } else {
                push_tuple(&mut name, chunk.refid, t.fw, refoff, t.best_score);
                push_tuple(&mut name, chunk.refid, !t.fw, refoff, 0);
            }
            name.push_str(SIM_SEP);
            name.push('b');
            name.push(t.mate as char);
        } else {
            push_tuple(&mut name, chunk.refid, t.fw, refoff, t.best_score);
            name.push_str(SIM_SEP);
            name.push('u');
        }

        if bad_end {
            let (fh_main, fh_opp) = if t.mate == b'2' {
                (&mut outs.b2, &mut outs.b1)
            } else {
                (&mut outs.b1, &mut outs.b2)
            };
            read.write(fh_main, &name, &t.qual, t.fw)?;
            write_random_companion(fh_opp, &name, t.opp_len as usize, rng)?;
        } else {
            read.write(&mut outs.u, &name, &t.qual, t.fw)?;
        }
        return Ok(true);
    }
    Ok(false)
}

/// The opposite mate of a bad-end pair never aligned, so there is nothing
/// to mutate from; it is emitted as uniform random bases with constant
/// quality, purely to keep the paired FASTQ files symmetric.
fn write_random_companion<W: Write>(
    fh: &mut W,
    name: &str,
    len: usize,
    rng: &mut dyn RngSource,
) -> Result<()> {
    let mut seq = Vec::with_capacity(len);
    for _ in 0..len {
        seq.push(rng.draw_base());
    }
    fh.write_all(b"@")?;
    fh.write_all(name.as_bytes())?;
    fh.write_all(b"\n")?;
    fh.write_all(&seq)?;
    fh.write_all(b"\n+\n")?;
    fh.write_all(&vec![BAD_END_QUAL; len])?;
    fh.write_all(b"\n")?;
    Ok(())
}

/// One concordant or discordant draw: place the whole fragment, then the
/// two mate footprints at its ends.
fn sim_paired<W: Write>(
    chunk: &Chunk<'_>,
    model: &InputModelPaired<'_>,
    olap: usize,
    typ: u8,
    outs: &mut SimOutputs<W>,
    read1: &mut SimulatedRead,
    read2: &mut SimulatedRead,
    rng: &mut dyn RngSource,
) -> Result<bool> {
    let t = model.draw(rng);
    let fraglen = t.fraglen as usize;
    let rl1 = t.reflen_1();
    let rl2 = t.reflen_2();
    let retsz = chunk.seq.len();
    if rl1 == 0 || rl2 == 0 || fraglen < rl1 || fraglen < rl2 || fraglen > retsz {
        return Ok(false);
    }
    let span = retsz - olap;
    for _ in 0..MAX_ATTEMPTS {
        let off = (rng.uniform_01() * span as f64) as usize;
        if off + fraglen > retsz {
            continue;
        }
        let (off1, off2) = if t.upstream_1 {
            (off, off + fraglen - rl2)
        } else {
            (off + fraglen - rl1, off)
        };
        let fp1 = &chunk.seq[off1..off1 + rl1];
        let fp2 = &chunk.seq[off2..off2 + rl2];
        if !all_acgt(fp1) || !all_acgt(fp2) {
            continue;
        }
        read1.mutate(fp1, &t.xscript_1, rng)?;
        read2.mutate(fp2, &t.xscript_2, rng)?;

        let refoff1 = chunk.refoff + off1 as u64;
        let refoff2 = chunk.refoff + off2 as u64;
        let mut name = String::from(SIM_PREFIX);
        push_tuple(&mut name, chunk.refid, t.fw_1, refoff1, t.score_1);
        push_tuple(&mut name, chunk.refid, t.fw_2, refoff2, t.score_2);
        name.push_str(SIM_SEP);
        name.push(typ as char);

        let (fh1, fh2) = if typ == b'c' {
            (&mut outs.c1, &mut outs.c2)
        } else {
            (&mut outs.d1, &mut outs.d2)
        };
        read1.write(fh1, &name, &t.qual_1, t.fw_1)?;
        read2.write(fh2, &name, &t.qual_2, t.fw_2)?;
        return Ok(true);
    }
    Ok(false)
}
