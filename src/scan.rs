//! One-pass SAM scanner.  Routes every record to one of seven cases,
//! pairing consecutive mates with a two-slot lookback, and emits feature
//! rows, input-model template rows, and reservoir-sampled templates.

use crate::model::{ReservoirSample, TemplatePaired, TemplateStore, TemplateUnpaired};
use crate::rng::RngSource;
use crate::sam::{self, Alignment};
use anyhow::{Context, Result};
use indicatif::ProgressBar;
use std::io::{BufRead, Write};

const PROGRESS_UPDATE_INTERVAL: u64 = 100_000;

pub struct ScanConfig {
    /// Tolerance, in bases, for the correctness oracle.
    pub wiggle: u64,
    /// Fragment lengths are clamped to this ceiling before templating.
    pub max_allowed_fraglen: u64,
}

/// Per-pass counters, reported at the end of the run.
#[derive(Debug, Default)]
pub struct ScanStats {
    pub nline: u64,
    pub nhead: u64,
    pub nsec: u64,
    pub ntyp_mismatch: u64,
    pub nunp: u64,
    pub nunp_al: u64,
    pub nunp_unal: u64,
    pub npair: u64,
    pub npair_conc: u64,
    pub npair_disc: u64,
    pub npair_badend: u64,
    pub npair_unal: u64,
}

/// Output handles for one template class.  Headers are written lazily when
/// the first record of the class arrives, since the ZT:Z arity is inferred
/// from that record.
pub struct ClassFiles<W: Write> {
    pub rec: Option<W>,
    pub model: Option<W>,
    header_written: bool,
}

impl<W: Write> ClassFiles<W> {
    pub fn new(rec: Option<W>, model: Option<W>) -> Self {
        ClassFiles {
            rec,
            model,
            header_written: false,
        }
    }

    fn ensure_unpaired_header(&mut self, n_ztz: usize) -> Result<()> {
        if self.header_written {
            return Ok(());
        }
        self.header_written = true;
        if let Some(fh) = &mut self.rec {
            write!(fh, "id,len,olen")?;
            for i in 0..n_ztz {
                write!(fh, ",ztz_{}", i)?;
            }
            writeln!(fh, ",mapq,correct")?;
        }
        Ok(())
    }

    fn ensure_paired_header(&mut self, n_ztz: usize) -> Result<()> {
        if self.header_written {
            return Ok(());
        }
        self.header_written = true;
        if let Some(fh) = &mut self.rec {
            write!(fh, "id,len")?;
            for i in 0..n_ztz {
                write!(fh, ",ztz_{}", i)?;
            }
            write!(fh, ",olen,fraglen")?;
            for i in 0..n_ztz {
                write!(fh, ",oztz_{}", i)?;
            }
            writeln!(fh, ",mapq,correct")?;
        }
        Ok(())
    }
}

/// Output handles for all four classes.
pub struct ScanOutputs<W: Write> {
    pub u: ClassFiles<W>,
    pub b: ClassFiles<W>,
    pub c: ClassFiles<W>,
    pub d: ClassFiles<W>,
}

/// One pass over a SAM stream.  Line ordinals are 1-based over non-header,
/// non-secondary records and reset per input file; counters accumulate
/// across files.
pub fn sam_pass1<R: BufRead, W: Write>(
    mut reader: R,
    outs: &mut ScanOutputs<W>,
    mut store: Option<&mut TemplateStore>,
    rng: &mut dyn RngSource,
    cfg: &ScanConfig,
    stats: &mut ScanStats,
    progress: Option<&ProgressBar>,
) -> Result<()> {
    let mut al1 = Alignment::default();
    let mut al2 = Alignment::default();
    let mut cur1 = true;
    let mut line = Vec::with_capacity(1024);
    let mut ordinal = 0u64;

    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            break;
        }
        stats.nline += 1;
        if let Some(pb) = progress {
            if stats.nline % PROGRESS_UPDATE_INTERVAL == 0 {
                pb.set_message(format!("scanned {} lines", stats.nline));
                pb.tick();
            }
        }
        if line.first() == Some(&b'@') {
            stats.nhead += 1;
            continue;
        }
        let flag = sniff_flag(&line)?;
        if flag & sam::FLAG_SECONDARY != 0 {
            stats.nsec += 1;
            continue;
        }
        ordinal += 1;

        let (cur, prev) = if cur1 {
            (&mut al1, &mut al2)
        } else {
            (&mut al2, &mut al1)
        };
        cur1 = !cur1;
        // A pending mate in this slot means its partner never arrived;
        // overwriting it drops the orphan.
        debug_assert!(!cur.valid);
        cur.set_line(&line, ordinal)
            .with_context(|| format!("SAM line {}", stats.nline))?;

        if cur.mate_flag() == b'0' {
            stats.nunp += 1;
            if !cur.is_aligned() {
                stats.nunp_unal += 1;
                continue;
            }
            if type_gate(cur.typ(), b'u', 0) {
                stats.nunp_al += 1;
                emit_unpaired(cur, 0, &mut outs.u, store.as_mut().map(|s| &mut s.u), rng, cfg)
                    .with_context(|| format!("SAM line {}", stats.nline))?;
            } else {
                stats.ntyp_mismatch += 1;
            }
        } else if prev.valid {
            // Close the pair.  Mate roles come from the 0x40/0x80 flags;
            // emission order follows appearance in the file.
            prev.valid = false;
            stats.npair += 1;
            debug_assert_ne!(cur.mate_flag(), prev.mate_flag());

            if !cur.is_aligned() && !prev.is_aligned() {
                stats.npair_unal += 1;
            } else if cur.is_aligned() != prev.is_aligned() {
                let (alm, other_len) = if cur.is_aligned() {
                    let len = prev.seq_len();
                    (&mut *cur, len)
                } else {
                    let len = cur.seq_len();
                    (&mut *prev, len)
                };
                if type_gate(alm.typ(), b'b', alm.mate_flag()) {
                    stats.npair_badend += 1;
                    emit_unpaired(
                        alm,
                        other_len,
                        &mut outs.b,
                        store.as_mut().map(|s| &mut s.b),
                        rng,
                        cfg,
                    )
                    .with_context(|| format!("SAM line {}", stats.nline))?;
                } else {
                    stats.ntyp_mismatch += 1;
                }
            } else {
                debug_assert_eq!(cur.is_concordant(), prev.is_concordant());
                let conc = prev.is_concordant();
                let typ = if conc { b'c' } else { b'd' };
                if type_gate(prev.typ(), typ, 0) {
                    if conc {
                        stats.npair_conc += 1;
                    } else {
                        stats.npair_disc += 1;
                    }
                    let (files, rs) = if conc {
                        (&mut outs.c, store.as_mut().map(|s| &mut s.c))
                    } else {
                        (&mut outs.d, store.as_mut().map(|s| &mut s.d))
                    };
                    emit_paired(prev, cur, files, rs, rng, cfg)
                        .with_context(|| format!("SAM line {}", stats.nline))?;
                } else {
                    stats.ntyp_mismatch += 1;
                }
            }
        } else {
            // Paired, mate not yet seen: hold this record back.
            cur.valid = true;
        }
    }
    Ok(())
}

/// Check a simulated read's advertised type against the class it was
/// routed to.  Reads without a type token always pass.  For bad-end
/// records the second type byte must name the aligned mate.
fn type_gate(typ: Option<&[u8]>, class: u8, mate: u8) -> bool {
    match typ {
        None => true,
        Some(t) => {
            t.first() == Some(&class) && (mate == 0 || t.get(1) == Some(&mate))
        }
    }
}

fn sniff_flag(line: &[u8]) -> Result<u16> {
    let mut it = line.split(|&b| b == b'\t');
    it.next();
    let fld = it.next().context("SAM record is missing the FLAG column")?;
    Ok(sam::parse_uint(fld).context("bad FLAG column")? as u16)
}

fn fw_char(fw: bool) -> char {
    if fw {
        'T'
    } else {
        'F'
    }
}

/// Emit one unpaired (or bad-end) record: feature row, template row, and
/// reservoir slot.  `ordlen` is the opposite mate's read length, 0 for a
/// truly unpaired read.
fn emit_unpaired<W: Write>(
    al: &mut Alignment,
    ordlen: usize,
    files: &mut ClassFiles<W>,
    reservoir: Option<&mut ReservoirSample<TemplateUnpaired>>,
    rng: &mut dyn RngSource,
    cfg: &ScanConfig,
) -> Result<()> {
    al.parse_details()?;
    al.set_correctness(cfg.wiggle);
    files.ensure_unpaired_header(al.ztz_tokens().count())?;

    if let Some(fh) = &mut files.model {
        writeln!(
            fh,
            "{},{},{},{},{},{},{}",
            al.best_score,
            fw_char(al.is_fw()),
            String::from_utf8_lossy(al.qual()),
            al.seq_len(),
            al.mate_flag() as char,
            ordlen,
            String::from_utf8_lossy(&al.edit_xscript),
        )?;
    }

    if let Some(rs) = reservoir {
        if let Some(slot) = rs.add_part1(rng) {
            let t = rs.slot(slot);
            t.best_score = al.best_score;
            t.fw = al.is_fw();
            t.len = al.seq_len() as u32;
            t.mate = al.mate_flag();
            t.opp_len = ordlen as u32;
            t.qual.clear();
            t.qual.extend_from_slice(al.qual());
            t.xscript.clear();
            t.xscript.extend_from_slice(&al.edit_xscript);
        }
    }

    if let Some(fh) = &mut files.rec {
        write!(fh, "{},{},{}", al.line, al.seq_len(), ordlen)?;
        for tok in al.ztz_tokens() {
            write!(fh, ",{}", String::from_utf8_lossy(tok))?;
        }
        writeln!(fh, ",{},{}", al.mapq, al.correct)?;
    }
    Ok(())
}

/// Emit a concordant or discordant pair: one feature row per mate (each
/// listing its own features then its mate's), one template row, one
/// reservoir slot.  `al1` is the mate that appeared first in the file.
fn emit_paired<W: Write>(
    al1: &mut Alignment,
    al2: &mut Alignment,
    files: &mut ClassFiles<W>,
    reservoir: Option<&mut ReservoirSample<TemplatePaired>>,
    rng: &mut dyn RngSource,
    cfg: &ScanConfig,
) -> Result<()> {
    al1.parse_details()?;
    al2.parse_details()?;
    al1.set_correctness(cfg.wiggle);
    al2.set_correctness(cfg.wiggle);

    let fraglen = cfg
        .max_allowed_fraglen
        .min(Alignment::fragment_length(al1, al2));
    let upstream1 = al1.pos < al2.pos;
    files.ensure_paired_header(al1.ztz_tokens().count())?;

    if let Some(fh) = &mut files.rec {
        for (a, o) in [(&*al1, &*al2), (&*al2, &*al1)] {
            write!(fh, "{},{}", a.line, a.seq_len())?;
            for tok in a.ztz_tokens() {
                write!(fh, ",{}", String::from_utf8_lossy(tok))?;
            }
            write!(fh, ",{},{}", o.seq_len(), fraglen)?;
            for tok in o.ztz_tokens() {
                write!(fh, ",{}", String::from_utf8_lossy(tok))?;
            }
            writeln!(fh, ",{},{}", a.mapq, a.correct)?;
        }
    }

    if let Some(fh) = &mut files.model {
        writeln!(
            fh,
            "{},{},{},{},{},{},{},{},{},{},{},{},{}",
            al1.best_score + al2.best_score,
            fw_char(al1.is_fw()),
            String::from_utf8_lossy(al1.qual()),
            al1.best_score,
            al1.seq_len(),
            String::from_utf8_lossy(&al1.edit_xscript),
            fw_char(al2.is_fw()),
            String::from_utf8_lossy(al2.qual()),
            al2.best_score,
            al2.seq_len(),
            String::from_utf8_lossy(&al2.edit_xscript),
            fw_char(upstream1),
            fraglen,
        )?;
    }

    if let Some(rs) = reservoir {
        if let Some(slot) = rs.add_part1(rng) {
            let t = rs.slot(slot);
            t.score_12 = al1.best_score + al2.best_score;
            t.score_1 = al1.best_score;
            t.len_1 = al1.seq_len() as u32;
            t.fw_1 = al1.is_fw();
            t.qual_1.clear();
            t.qual_1.extend_from_slice(al1.qual());
            t.xscript_1.clear();
            t.xscript_1.extend_from_slice(&al1.edit_xscript);
            t.score_2 = al2.best_score;
            t.len_2 = al2.seq_len() as u32;
            t.fw_2 = al2.is_fw();
            t.qual_2.clear();
            t.qual_2.extend_from_slice(al2.qual());
            t.xscript_2.clear();
            t.xscript_2.extend_from_slice(&al2.edit_xscript);
            t.upstream_1 = upstream1;
            t.fraglen = fraglen as u32;
        }
    }
    Ok(())
}
