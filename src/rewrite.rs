//! SAM rewriter: copies a SAM file to output in order, substituting the
//! predicted MAPQ on lines that have one.

use crate::pred::PredictionMerger;
use anyhow::{bail, Context, Result};
use std::io::{BufRead, Write};

#[derive(Debug)]
pub struct RewriteConfig {
    /// Tag (without trailing colon-value) for the original MAPQ.
    pub orig_mapq_flag: String,
    /// Tag for the precise (3-decimal) predicted MAPQ.
    pub precise_mapq_flag: String,
    pub write_orig_mapq: bool,
    pub write_precise_mapq: bool,
    /// Keep ZT:Z fields instead of stripping them.
    pub keep_ztz: bool,
}

impl Default for RewriteConfig {
    fn default() -> Self {
        RewriteConfig {
            orig_mapq_flag: "Zm:i".to_string(),
            precise_mapq_flag: "Zp:Z".to_string(),
            write_orig_mapq: false,
            write_precise_mapq: false,
            keep_ztz: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct RewriteStats {
    pub nline: u64,
    pub nhead: u64,
    pub nrewritten: u64,
    pub npassthrough: u64,
}

/// Advance the merged prediction stream and the SAM stream in lockstep.
/// Header lines pass through unchanged and do not count toward the line
/// ordinal.  When predictions run out first, the remaining SAM lines pass
/// through; the SAM running out first means the inputs disagree and is
/// fatal.
pub fn rewrite_sam<R: BufRead, W: Write>(
    mut sam: R,
    preds: &mut PredictionMerger,
    out: &mut W,
    cfg: &RewriteConfig,
) -> Result<RewriteStats> {
    let mut stats = RewriteStats::default();
    let mut line = Vec::with_capacity(1024);
    let mut ordinal = 0u64;

    let mut pending = preds.next()?;
    loop {
        line.clear();
        if sam.read_until(b'\n', &mut line)? == 0 {
            if let Some(p) = pending {
                bail!(
                    "SAM input ended at ordinal {} but a prediction for line {} remains",
                    ordinal,
                    p.line
                );
            }
            break;
        }
        stats.nline += 1;
        if line.first() == Some(&b'@') {
            stats.nhead += 1;
            out.write_all(&line)?;
            continue;
        }
        ordinal += 1;
        match pending {
            Some(p) if p.line == ordinal => {
                rewrite_line(&line, p.mapq, cfg, out)
                    .with_context(|| format!("SAM line {}", stats.nline))?;
                stats.nrewritten += 1;
                pending = preds.next()?;
                if let Some(next) = pending {
                    debug_assert!(next.line > p.line);
                }
            }
            _ => {
                debug_assert!(pending.map_or(true, |p| p.line > ordinal));
                out.write_all(&line)?;
                stats.npassthrough += 1;
            }
        }
    }
    Ok(stats)
}

/// Rewrite one alignment line: columns 1-4 verbatim, MAPQ replaced by the
/// rounded prediction, then the rest with ZT:Z optionally stripped and the
/// provenance tags appended.
fn rewrite_line<W: Write>(line: &[u8], mapq: f64, cfg: &RewriteConfig, out: &mut W) -> Result<()> {
    let mut end = line.len();
    while end > 0 && (line[end - 1] == b'\n' || line[end - 1] == b'\r') {
        end -= 1;
    }
    let body = &line[..end];
    let fields: Vec<&[u8]> = body.split(|&b| b == b'\t').collect();
    if fields.len() < 11 {
        bail!("SAM record has only {} fields", fields.len());
    }

    for f in &fields[..4] {
        out.write_all(f)?;
        out.write_all(b"\t")?;
    }
    let rounded = (mapq + 0.5).floor() as u32;
    write!(out, "{}", rounded)?;
    for f in &fields[5..] {
        if !cfg.keep_ztz && f.starts_with(b"ZT:Z:") {
            continue;
        }
        out.write_all(b"\t")?;
        out.write_all(f)?;
    }
    if cfg.write_orig_mapq {
        out.write_all(b"\t")?;
        out.write_all(cfg.orig_mapq_flag.as_bytes())?;
        out.write_all(b":")?;
        out.write_all(fields[4])?;
    }
    if cfg.write_precise_mapq {
        write!(out, "\t{}:{:.3}", cfg.precise_mapq_flag, mapq)?;
    }
    out.write_all(b"\n")?;
    Ok(())
}
