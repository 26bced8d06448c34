//! Edit-transcript codec: normalizes CIGAR and MD:Z annotations into a
//! single per-reference-position edit string over `{=, X, I, D, N, S}`.

use anyhow::{bail, Result};

/// Parsed CIGAR, kept as parallel op/run lists so runs can be re-walked
/// against MD:Z.
#[derive(Debug, Default)]
pub struct CigarParse {
    pub ops: Vec<u8>,
    pub runs: Vec<u32>,
    pub left_clip: u32,
    pub right_clip: u32,
    /// True when the CIGAR uses the extended `=`/`X` operators, in which
    /// case MD:Z is not consulted.
    pub has_equal_x: bool,
}

impl CigarParse {
    pub fn clear(&mut self) {
        self.ops.clear();
        self.runs.clear();
        self.left_clip = 0;
        self.right_clip = 0;
        self.has_equal_x = false;
    }
}

/// One run of an MD:Z string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MdOp {
    Match,
    Mismatch,
    Deletion,
}

/// MD:Z decomposed into ordered runs; mismatch/deletion characters live in
/// a shared side buffer addressed by `offset`.
#[derive(Debug, Clone, Copy)]
pub struct MdRun {
    pub op: MdOp,
    pub run: u32,
    pub offset: usize,
}

#[derive(Debug, Default)]
pub struct MdzParse {
    pub runs: Vec<MdRun>,
    pub chars: Vec<u8>,
}

impl MdzParse {
    pub fn clear(&mut self) {
        self.runs.clear();
        self.chars.clear();
    }
}

/// Parse a CIGAR string into `out`, recording clip lengths and whether the
/// extended operators appear.
pub fn parse_cigar(cigar: &[u8], out: &mut CigarParse) -> Result<()> {
    out.clear();
    let mut i = 0;
    while i < cigar.len() {
        if !cigar[i].is_ascii_digit() {
            bail!(
                "bad CIGAR '{}': expected digit at offset {}",
                String::from_utf8_lossy(cigar),
                i
            );
        }
        let mut run: u32 = 0;
        while i < cigar.len() && cigar[i].is_ascii_digit() {
            run = run * 10 + u32::from(cigar[i] - b'0');
            i += 1;
        }
        if i >= cigar.len() {
            bail!(
                "bad CIGAR '{}': run without operator",
                String::from_utf8_lossy(cigar)
            );
        }
        let op = cigar[i];
        if !matches!(op, b'M' | b'I' | b'D' | b'N' | b'S' | b'H' | b'P' | b'=' | b'X') {
            bail!(
                "bad CIGAR '{}': unknown operator '{}'",
                String::from_utf8_lossy(cigar),
                op as char
            );
        }
        if out.ops.is_empty() && op == b'S' {
            out.left_clip = run;
        } else if i + 1 >= cigar.len() && op == b'S' {
            out.right_clip = run;
        }
        if op == b'X' || op == b'=' {
            out.has_equal_x = true;
        }
        out.ops.push(op);
        out.runs.push(run);
        i += 1;
    }
    Ok(())
}

/// Parse an MD:Z value into `out`.
pub fn parse_mdz(mdz: &[u8], out: &mut MdzParse) -> Result<()> {
    out.clear();
    let mut i = 0;
    while i < mdz.len() {
        if mdz[i].is_ascii_digit() {
            let mut run: u32 = 0;
            while i < mdz.len() && mdz[i].is_ascii_digit() {
                run = run * 10 + u32::from(mdz[i] - b'0');
                i += 1;
            }
            // A 0-length match separates adjacent mismatch runs; it emits
            // nothing itself.
            if run > 0 {
                out.runs.push(MdRun {
                    op: MdOp::Match,
                    run,
                    offset: usize::MAX,
                });
            }
        } else if mdz[i].is_ascii_alphabetic() {
            let start = out.chars.len();
            let mut run: u32 = 0;
            while i < mdz.len() && mdz[i].is_ascii_alphabetic() {
                out.chars.push(mdz[i]);
                run += 1;
                i += 1;
            }
            out.runs.push(MdRun {
                op: MdOp::Mismatch,
                run,
                offset: start,
            });
        } else if mdz[i] == b'^' {
            i += 1;
            let start = out.chars.len();
            let mut run: u32 = 0;
            while i < mdz.len() && mdz[i].is_ascii_alphabetic() {
                out.chars.push(mdz[i]);
                run += 1;
                i += 1;
            }
            out.runs.push(MdRun {
                op: MdOp::Deletion,
                run,
                offset: start,
            });
        } else {
            bail!(
                "unexpected character at offset {} of MD:Z string '{}'",
                i,
                String::from_utf8_lossy(mdz)
            );
        }
    }
    Ok(())
}

/// Direct expansion of an extended (`=`/`X`) CIGAR into a transcript.
/// `M` and `P` are invalid in this branch.
pub fn cigar_to_xscript(cig: &CigarParse, out: &mut Vec<u8>) -> Result<()> {
    debug_assert!(cig.has_equal_x);
    out.clear();
    for (&op, &run) in cig.ops.iter().zip(cig.runs.iter()) {
        match op {
            b'M' | b'P' => {
                bail!("operator '{}' is invalid in an extended CIGAR", op as char)
            }
            b'H' => {}
            _ => extend_run(out, op, run),
        }
    }
    Ok(())
}

/// Walk a plain CIGAR against MD:Z runs, emitting `=`/`X` for each `M`
/// stretch.  Consumes every MD:Z run exactly once; a match run split by an
/// intervening insertion is consumed across the pieces.
pub fn cigar_and_mdz_to_xscript(
    cig: &CigarParse,
    mdz: &MdzParse,
    out: &mut Vec<u8>,
) -> Result<()> {
    debug_assert!(!cig.has_equal_x);
    out.clear();
    let mut mdo = 0usize; // cursor into mdz.runs
    let mut carry: u32 = 0; // remainder of a partially consumed match run
    for (&cop, &crun) in cig.ops.iter().zip(cig.runs.iter()) {
        match cop {
            b'M' => {
                let mut runleft = crun;
                while runleft > 0 {
                    if mdo >= mdz.runs.len() {
                        bail!("MD:Z exhausted with {} M bases unaccounted", runleft);
                    }
                    let md = mdz.runs[mdo];
                    let avail = if carry > 0 { carry } else { md.run };
                    match md.op {
                        MdOp::Match => {
                            let take = runleft.min(avail);
                            extend_run(out, b'=', take);
                            runleft -= take;
                            if take < avail {
                                carry = avail - take;
                            } else {
                                carry = 0;
                                mdo += 1;
                            }
                        }
                        MdOp::Mismatch => {
                            if md.run > runleft {
                                bail!("MD:Z mismatch run extends past CIGAR M run");
                            }
                            extend_run(out, b'X', md.run);
                            runleft -= md.run;
                            mdo += 1;
                        }
                        MdOp::Deletion => {
                            bail!("MD:Z deletion run inside CIGAR M run");
                        }
                    }
                }
            }
            b'I' => extend_run(out, b'I', crun),
            b'D' => {
                if mdo >= mdz.runs.len() {
                    bail!("CIGAR D run with no matching MD:Z deletion");
                }
                let md = mdz.runs[mdo];
                if md.op != MdOp::Deletion || md.run != crun {
                    bail!(
                        "CIGAR D run of {} does not match MD:Z deletion run of {}",
                        crun,
                        md.run
                    );
                }
                mdo += 1;
                extend_run(out, b'D', crun);
            }
            b'N' => extend_run(out, b'N', crun),
            b'S' => extend_run(out, b'S', crun),
            b'H' => {}
            _ => bail!(
                "operator '{}' is invalid alongside MD:Z",
                cop as char
            ),
        }
    }
    if mdo != mdz.runs.len() {
        bail!(
            "{} MD:Z runs left unconsumed after CIGAR walk",
            mdz.runs.len() - mdo
        );
    }
    Ok(())
}

fn extend_run(out: &mut Vec<u8>, op: u8, run: u32) {
    out.resize(out.len() + run as usize, op);
}

/// Number of reference positions the transcript spans.
pub fn len_on_ref(xscript: &[u8]) -> usize {
    xscript
        .iter()
        .filter(|c| matches!(c, b'=' | b'X' | b'D' | b'S' | b'N'))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xscript_plain(cigar: &str, mdz: &str) -> Vec<u8> {
        let mut cig = CigarParse::default();
        parse_cigar(cigar.as_bytes(), &mut cig).unwrap();
        let mut md = MdzParse::default();
        parse_mdz(mdz.as_bytes(), &mut md).unwrap();
        let mut out = Vec::new();
        cigar_and_mdz_to_xscript(&cig, &md, &mut out).unwrap();
        out
    }

    #[test]
    fn insertion_splits_match_run() {
        // 3M1I2M with MD:Z 5: the match run of 5 spans the insertion.
        assert_eq!(xscript_plain("3M1I2M", "5"), b"===I==");
        assert_eq!(len_on_ref(b"===I=="), 5);
    }

    #[test]
    fn mismatch_inside_match() {
        assert_eq!(xscript_plain("4M", "2A1"), b"==X=");
        assert_eq!(len_on_ref(b"==X="), 4);
    }

    #[test]
    fn deletion_run_matches_cigar() {
        assert_eq!(xscript_plain("2M2D3M", "2^AC3"), b"==DD===");
        assert_eq!(len_on_ref(b"==DD==="), 7);
    }

    #[test]
    fn soft_clips_and_skip() {
        assert_eq!(xscript_plain("2S3M1N2M", "5"), b"SS===N==");
        // S counts toward reference span, N does too.
        assert_eq!(len_on_ref(b"SS===N=="), 8);
    }

    #[test]
    fn adjacent_mismatches_with_zero_runs() {
        // MD:Z "0A0C2" is two adjacent mismatches then two matches.
        assert_eq!(xscript_plain("4M", "0A0C2"), b"XX==");
    }

    #[test]
    fn hard_clip_is_discarded() {
        assert_eq!(xscript_plain("2H3M", "3"), b"===");
    }

    #[test]
    fn extended_cigar_expands_directly() {
        let mut cig = CigarParse::default();
        parse_cigar(b"2S3=1X2=1S", &mut cig).unwrap();
        assert!(cig.has_equal_x);
        assert_eq!(cig.left_clip, 2);
        assert_eq!(cig.right_clip, 1);
        let mut out = Vec::new();
        cigar_to_xscript(&cig, &mut out).unwrap();
        assert_eq!(out, b"SS===X==S");
    }

    #[test]
    fn extended_cigar_rejects_m() {
        let mut cig = CigarParse::default();
        parse_cigar(b"3=2M", &mut cig).unwrap();
        let mut out = Vec::new();
        assert!(cigar_to_xscript(&cig, &mut out).is_err());
    }

    #[test]
    fn plain_cigar_rejects_pad() {
        let mut cig = CigarParse::default();
        parse_cigar(b"2M1P2M", &mut cig).unwrap();
        let mut md = MdzParse::default();
        parse_mdz(b"4", &mut md).unwrap();
        let mut out = Vec::new();
        assert!(cigar_and_mdz_to_xscript(&cig, &md, &mut out).is_err());
    }

    #[test]
    fn deletion_length_mismatch_is_fatal() {
        let mut cig = CigarParse::default();
        parse_cigar(b"2M3D2M", &mut cig).unwrap();
        let mut md = MdzParse::default();
        parse_mdz(b"2^AC2", &mut md).unwrap();
        let mut out = Vec::new();
        assert!(cigar_and_mdz_to_xscript(&cig, &md, &mut out).is_err());
    }

    #[test]
    fn leftover_mdz_runs_are_fatal() {
        let mut cig = CigarParse::default();
        parse_cigar(b"2M", &mut cig).unwrap();
        let mut md = MdzParse::default();
        parse_mdz(b"2A1", &mut md).unwrap();
        let mut out = Vec::new();
        assert!(cigar_and_mdz_to_xscript(&cig, &md, &mut out).is_err());
    }

    #[test]
    fn clip_lengths_recorded() {
        let mut cig = CigarParse::default();
        parse_cigar(b"5S10M3S", &mut cig).unwrap();
        assert_eq!(cig.left_clip, 5);
        assert_eq!(cig.right_clip, 3);
        assert!(!cig.has_equal_x);
    }

    #[test]
    fn bad_mdz_character() {
        let mut md = MdzParse::default();
        assert!(parse_mdz(b"3?2", &mut md).is_err());
    }
}
