//! One SAM alignment record, reusable across input lines.
//!
//! The record owns a copy of its line and exposes the mandatory columns as
//! byte slices.  Two records rotate in the scanner so a paired mate can be
//! held back without allocation.

use crate::sim::{SIM_PREFIX, SIM_SEP};
use crate::xscript::{self, CigarParse, MdzParse};
use anyhow::{bail, Result};

pub const FLAG_PAIRED: u16 = 0x1;
pub const FLAG_CONCORDANT: u16 = 0x2;
pub const FLAG_UNMAPPED: u16 = 0x4;
pub const FLAG_REVERSE: u16 = 0x10;
pub const FLAG_MATE1: u16 = 0x40;
pub const FLAG_MATE2: u16 = 0x80;
pub const FLAG_SECONDARY: u16 = 0x800;

const N_MANDATORY: usize = 11;

#[derive(Default)]
pub struct Alignment {
    /// Set when this record is a first-seen mate waiting for its partner.
    pub valid: bool,
    /// 1-based ordinal among non-header, non-secondary records.
    pub line: u64,
    buf: Vec<u8>,
    fields: [(usize, usize); N_MANDATORY],
    opt_start: usize,
    pub flag: u16,
    /// 1-based leftmost reference position.
    pub pos: u64,
    pub mapq: u8,
    typ: Option<(usize, usize)>,
    ztz: Option<(usize, usize)>,
    mdz: Option<(usize, usize)>,
    pub cigar: CigarParse,
    mdz_parse: MdzParse,
    pub edit_xscript: Vec<u8>,
    pub best_score: i32,
    /// 1 correct, 0 incorrect, -1 unknown (name not recognized).
    pub correct: i8,
}

impl Alignment {
    pub fn clear(&mut self) {
        self.valid = false;
        self.line = 0;
        self.buf.clear();
        self.fields = [(0, 0); N_MANDATORY];
        self.opt_start = 0;
        self.flag = 0;
        self.pos = 0;
        self.mapq = 0;
        self.typ = None;
        self.ztz = None;
        self.mdz = None;
        self.cigar.clear();
        self.mdz_parse.clear();
        self.edit_xscript.clear();
        self.best_score = 0;
        self.correct = -1;
    }

    /// Load one SAM line (no trailing newline required) and slice out the
    /// eleven mandatory columns.  `ordinal` is the record's line ordinal.
    pub fn set_line(&mut self, line: &[u8], ordinal: u64) -> Result<()> {
        self.clear();
        let mut end = line.len();
        while end > 0 && (line[end - 1] == b'\n' || line[end - 1] == b'\r') {
            end -= 1;
        }
        self.buf.extend_from_slice(&line[..end]);
        self.line = ordinal;

        let mut start = 0;
        let mut nf = 0;
        for i in 0..=self.buf.len() {
            if i == self.buf.len() || self.buf[i] == b'\t' {
                if nf < N_MANDATORY {
                    self.fields[nf] = (start, i);
                    nf += 1;
                    if nf == N_MANDATORY {
                        self.opt_start = (i + 1).min(self.buf.len());
                        break;
                    }
                }
                start = i + 1;
            }
        }
        if nf < N_MANDATORY {
            bail!("SAM record has {} of {} mandatory fields", nf, N_MANDATORY);
        }

        self.flag = parse_uint(self.field(1))? as u16;
        self.pos = parse_uint(self.field(3))?;
        self.mapq = parse_uint(self.field(4))?.min(255) as u8;

        // Simulated reads advertise their class as the trailing
        // separator-delimited token of the name.
        if self.qname().starts_with(SIM_PREFIX.as_bytes()) {
            let qr = self.fields[0];
            let name = &self.buf[qr.0..qr.1];
            if let Some(p) = name.iter().rposition(|&b| b == SIM_SEP.as_bytes()[0]) {
                self.typ = Some((qr.0 + p + 1, qr.1));
            }
        }
        Ok(())
    }

    fn field(&self, i: usize) -> &[u8] {
        let (s, e) = self.fields[i];
        &self.buf[s..e]
    }

    pub fn qname(&self) -> &[u8] {
        self.field(0)
    }

    pub fn rname(&self) -> &[u8] {
        self.field(2)
    }

    pub fn cigar_str(&self) -> &[u8] {
        self.field(5)
    }

    pub fn seq(&self) -> &[u8] {
        self.field(9)
    }

    pub fn qual(&self) -> &[u8] {
        self.field(10)
    }

    pub fn seq_len(&self) -> usize {
        self.seq().len()
    }

    /// Simulated-read type token (`u`, `b1`, `b2`, `c`, `d`), if the name
    /// carries one.
    pub fn typ(&self) -> Option<&[u8]> {
        self.typ.map(|(s, e)| &self.buf[s..e])
    }

    pub fn ztz(&self) -> Option<&[u8]> {
        self.ztz.map(|(s, e)| &self.buf[s..e])
    }

    pub fn ztz_tokens(&self) -> impl Iterator<Item = &[u8]> {
        self.ztz().unwrap_or(b"").split(|&b| b == b',')
    }

    pub fn is_aligned(&self) -> bool {
        self.flag & FLAG_UNMAPPED == 0
    }

    pub fn is_fw(&self) -> bool {
        self.flag & FLAG_REVERSE == 0
    }

    pub fn is_concordant(&self) -> bool {
        self.flag & FLAG_CONCORDANT != 0
    }

    pub fn is_paired(&self) -> bool {
        self.flag & FLAG_PAIRED != 0
    }

    /// `b'1'`/`b'2'` for a paired mate, `b'0'` for unpaired.
    pub fn mate_flag(&self) -> u8 {
        if self.flag & FLAG_MATE1 != 0 {
            b'1'
        } else if self.flag & FLAG_MATE2 != 0 {
            b'2'
        } else {
            b'0'
        }
    }

    /// Parse CIGAR and auxiliary fields, then synthesize the edit
    /// transcript.  Extended (`=`/`X`) CIGARs win over MD:Z.
    pub fn parse_details(&mut self) -> Result<()> {
        let (cs, ce) = self.fields[5];
        let cigar = self.buf[cs..ce].to_vec();
        xscript::parse_cigar(&cigar, &mut self.cigar)?;

        // Scan aux fields for MD:Z and ZT:Z.
        let mut at = self.opt_start;
        while at < self.buf.len() {
            let end = self.buf[at..]
                .iter()
                .position(|&b| b == b'\t')
                .map(|p| at + p)
                .unwrap_or(self.buf.len());
            let fld = &self.buf[at..end];
            if fld.starts_with(b"ZT:Z:") {
                self.ztz = Some((at + 5, end));
            } else if fld.starts_with(b"MD:Z:") {
                self.mdz = Some((at + 5, end));
            }
            at = end + 1;
        }

        if self.cigar.has_equal_x {
            xscript::cigar_to_xscript(&self.cigar, &mut self.edit_xscript)?;
        } else if let Some((ms, me)) = self.mdz {
            let mdz = self.buf[ms..me].to_vec();
            xscript::parse_mdz(&mdz, &mut self.mdz_parse)?;
            xscript::cigar_and_mdz_to_xscript(
                &self.cigar,
                &self.mdz_parse,
                &mut self.edit_xscript,
            )?;
        }
        if self.edit_xscript.is_empty() {
            bail!(
                "input SAM has neither an extended CIGAR (= and X instead of M) \
                 nor an MD:Z field; one or the other is required"
            );
        }

        let Some((zs, ze)) = self.ztz else {
            bail!(
                "input SAM record lacks the ZT:Z field; run an aligner version \
                 that emits the extra feature string"
            );
        };
        let zend = self.buf[zs..ze]
            .iter()
            .position(|&b| b == b',')
            .map(|p| zs + p)
            .unwrap_or(ze);
        self.best_score = parse_int(&self.buf[zs..zend])? as i32;
        Ok(())
    }

    /// Leftmost reference position involved in the alignment, soft clips
    /// included.
    pub fn lpos(&self) -> u64 {
        self.pos.saturating_sub(self.cigar.left_clip as u64)
    }

    /// Rightmost reference position involved in the alignment, soft clips
    /// included.  Leading clips belong on the left side and are skipped.
    pub fn rpos(&self) -> u64 {
        debug_assert!(!self.edit_xscript.is_empty());
        let xs = &self.edit_xscript;
        let lead = xs.iter().take_while(|&&c| c == b'S').count();
        let mv = xs[lead..]
            .iter()
            .filter(|c| matches!(c, b'S' | b'D' | b'X' | b'='))
            .count();
        self.pos + mv as u64 - 1
    }

    /// Fragment length inferred from positions and edit transcripts; the
    /// SAM TLEN column is ambiguous under soft clipping and is never used.
    pub fn fragment_length(al1: &Alignment, al2: &Alignment) -> u64 {
        let (up, dn) = if al1.pos < al2.pos {
            (al1, al2)
        } else {
            (al2, al1)
        };
        dn.rpos().saturating_sub(up.lpos()) + 1
    }

    /// Decide correctness from the read name: 1 if the reported position is
    /// within `wiggle` of the encoded truth (and strand matches), 0 if the
    /// name is recognized but the alignment is off, -1 if the name encodes
    /// no truth.
    pub fn set_correctness(&mut self, wiggle: u64) {
        debug_assert_eq!(self.correct, -1);
        debug_assert!(self.is_aligned());
        self.correct = self.compute_correctness(wiggle);
    }

    fn compute_correctness(&self, wiggle: u64) -> i8 {
        let qname = self.qname();
        if qname.starts_with(SIM_PREFIX.as_bytes()) {
            self.check_sim_name(wiggle)
        } else {
            self.check_wgsim_name(wiggle)
        }
    }

    /// Truth check for names written by the tandem simulator:
    /// `<prefix><sep><refid><sep>(+|-)<sep><refoff><sep><score><sep>[tuple2<sep>]<typ>`.
    /// Mate 1 (or an unpaired read) validates the first tuple; mate 2 skips
    /// it and validates the second.
    fn check_sim_name(&self, wiggle: u64) -> i8 {
        let sep = SIM_SEP.as_bytes();
        let rname = self.rname();
        let mate2 = self.mate_flag() == b'2';
        let mut cur = &self.qname()[SIM_PREFIX.len()..];

        macro_rules! expect_sep {
            () => {
                if !cur.starts_with(sep) {
                    return 0;
                }
                cur = &cur[sep.len()..];
            };
        }

        expect_sep!();
        // refid
        if !mate2 && !cur.starts_with(rname) {
            return 0;
        }
        cur = match cur.get(rname.len()..) {
            Some(c) => c,
            None => return 0,
        };
        expect_sep!();
        // strand
        let want = if self.is_fw() { b'+' } else { b'-' };
        match cur.first() {
            Some(&c) => {
                if !mate2 && c != want {
                    return 0;
                }
            }
            None => return 0,
        }
        cur = &cur[1..];
        expect_sep!();
        // refoff (0-based truth)
        let (refoff, rest) = take_uint(cur);
        cur = rest;
        if !mate2 && refoff.abs_diff(self.pos.wrapping_sub(1)) >= wiggle {
            return 0;
        }
        expect_sep!();
        // score
        let (_score, rest) = take_int(cur);
        cur = rest;
        expect_sep!();

        if cur == b"u" {
            return 1; // unpaired and correct
        }
        if !mate2 {
            return 1; // mate 1 of a pair, first tuple checked out
        }

        // Mate 2: validate the second tuple.
        if !cur.starts_with(rname) {
            return 0;
        }
        cur = match cur.get(rname.len()..) {
            Some(c) => c,
            None => return 0,
        };
        expect_sep!();
        match cur.first() {
            Some(&c) if c == want => {}
            _ => return 0,
        }
        cur = &cur[1..];
        expect_sep!();
        let (refoff2, rest) = take_uint(cur);
        cur = rest;
        if refoff2.abs_diff(self.pos.wrapping_sub(1)) >= wiggle {
            return 0;
        }
        expect_sep!();
        let (_score2, rest) = take_int(cur);
        cur = rest;
        expect_sep!();
        debug_assert!(matches!(cur.first(), Some(&(b'b' | b'c' | b'd'))));
        1
    }

    /// wgsim-style fallback:
    /// `<refid>_<frag_start>_<frag_end>_..colons.._<len1>_<len2>_<flip>...`.
    /// Correctness uses the left or right fragment end depending on mate
    /// and flip.
    fn check_wgsim_name(&self, wiggle: u64) -> i8 {
        let qname = self.qname();
        let nund = qname.iter().filter(|&&b| b == b'_').count();
        let ncolon = qname.iter().filter(|&&b| b == b':').count();
        if nund < 8 || ncolon != 4 {
            return -1;
        }
        let rname = self.rname();
        if !qname.starts_with(rname) {
            return 0;
        }
        let mut cur = &qname[rname.len()..];
        if cur.first() != Some(&b'_') {
            return 0;
        }
        cur = &cur[1..];
        let (frag_start, rest) = take_uint(cur);
        cur = rest;
        if cur.first() != Some(&b'_') {
            return 0;
        }
        cur = &cur[1..];
        let (frag_end, rest) = take_uint(cur);
        cur = rest;
        if cur.first() != Some(&b'_') {
            return 0;
        }
        cur = &cur[1..];
        // Skip over the colon-delimited error counts.
        let mut colons = 4;
        while colons > 0 {
            match cur.first() {
                Some(&b':') => colons -= 1,
                Some(_) => {}
                None => return 0,
            }
            cur = &cur[1..];
        }
        // Digit run after the last colon plus its trailing underscore.
        while let Some(&c) = cur.first() {
            cur = &cur[1..];
            if !c.is_ascii_digit() {
                break;
            }
        }
        let (len1, rest) = take_uint(cur);
        cur = rest;
        if cur.first() != Some(&b'_') {
            return 0;
        }
        cur = &cur[1..];
        let (len2, rest) = take_uint(cur);
        cur = rest;
        if cur.first() != Some(&b'_') {
            return 0;
        }
        cur = &cur[1..];
        let flip = match cur.first() {
            Some(&b'1') => true,
            Some(&b'0') => false,
            _ => return 0,
        };
        let mate1 = self.mate_flag() != b'2';
        let len = if mate1 { len1 } else { len2 };
        let truth = if !flip == mate1 {
            frag_start // left end of the fragment
        } else {
            frag_end.saturating_sub(len) + 1 // right end
        };
        if self.pos.abs_diff(truth) < wiggle {
            1
        } else {
            0
        }
    }
}

pub(crate) fn parse_uint(s: &[u8]) -> Result<u64> {
    if s.is_empty() || !s.iter().all(|b| b.is_ascii_digit()) {
        bail!("expected unsigned integer, got '{}'", String::from_utf8_lossy(s));
    }
    let mut v: u64 = 0;
    for &b in s {
        v = v.wrapping_mul(10).wrapping_add(u64::from(b - b'0'));
    }
    Ok(v)
}

fn parse_int(s: &[u8]) -> Result<i64> {
    let (neg, digits) = match s.first() {
        Some(&b'-') => (true, &s[1..]),
        _ => (false, s),
    };
    let v = parse_uint(digits)? as i64;
    Ok(if neg { -v } else { v })
}

/// Consume a leading digit run; returns the value and the remainder.
fn take_uint(s: &[u8]) -> (u64, &[u8]) {
    let mut v: u64 = 0;
    let mut i = 0;
    while i < s.len() && s[i].is_ascii_digit() {
        v = v.wrapping_mul(10).wrapping_add(u64::from(s[i] - b'0'));
        i += 1;
    }
    (v, &s[i..])
}

/// Like `take_uint` but allows one leading minus sign.
fn take_int(s: &[u8]) -> (i64, &[u8]) {
    match s.first() {
        Some(&b'-') => {
            let (v, rest) = take_uint(&s[1..]);
            (-(v as i64), rest)
        }
        _ => {
            let (v, rest) = take_uint(s);
            (v as i64, rest)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(line: &str) -> Alignment {
        let mut al = Alignment::default();
        al.set_line(line.as_bytes(), 1).unwrap();
        al
    }

    fn aligned_line(qname: &str, flag: u16, rname: &str, pos: u64) -> String {
        format!(
            "{qname}\t{flag}\t{rname}\t{pos}\t42\t10M\t*\t0\t0\tACGTACGTAC\tIIIIIIIIII\tMD:Z:10\tZT:Z:-10,1,2"
        )
    }

    #[test]
    fn mandatory_fields_sliced() {
        let al = record(&aligned_line("rd1", 0, "chr1", 100));
        assert_eq!(al.qname(), b"rd1");
        assert_eq!(al.rname(), b"chr1");
        assert_eq!(al.pos, 100);
        assert_eq!(al.mapq, 42);
        assert_eq!(al.cigar_str(), b"10M");
        assert_eq!(al.seq_len(), 10);
        assert_eq!(al.qual(), b"IIIIIIIIII");
    }

    #[test]
    fn flag_helpers() {
        let al = record(&aligned_line("rd1", 0x63, "chr1", 100));
        assert!(al.is_paired());
        assert!(al.is_concordant());
        assert!(al.is_aligned());
        assert_eq!(al.mate_flag(), b'1');
        let al = record(&aligned_line("rd1", 0x94, "chr1", 100));
        assert!(!al.is_aligned());
        assert!(!al.is_fw());
        assert_eq!(al.mate_flag(), b'2');
    }

    #[test]
    fn details_extract_ztz_and_xscript() {
        let mut al = record(&aligned_line("rd1", 0, "chr1", 100));
        al.parse_details().unwrap();
        assert_eq!(al.edit_xscript, b"==========");
        assert_eq!(al.best_score, -10);
        let toks: Vec<&[u8]> = al.ztz_tokens().collect();
        assert_eq!(toks, vec![&b"-10"[..], b"1", b"2"]);
    }

    #[test]
    fn missing_ztz_is_fatal() {
        let mut al = record("rd1\t0\tchr1\t100\t42\t4M\t*\t0\t0\tACGT\tIIII\tMD:Z:4");
        assert!(al.parse_details().is_err());
    }

    #[test]
    fn missing_mdz_and_plain_cigar_is_fatal() {
        let mut al = record("rd1\t0\tchr1\t100\t42\t4M\t*\t0\t0\tACGT\tIIII\tZT:Z:1");
        assert!(al.parse_details().is_err());
    }

    #[test]
    fn extended_cigar_skips_mdz() {
        let mut al =
            record("rd1\t0\tchr1\t100\t42\t2=1X1=\t*\t0\t0\tACGT\tIIII\tZT:Z:5,1");
        al.parse_details().unwrap();
        assert_eq!(al.edit_xscript, b"==X=");
        assert_eq!(al.best_score, 5);
    }

    #[test]
    fn geometry_with_soft_clips() {
        let mut al =
            record("rd1\t0\tchr1\t100\t42\t2S6M2S\t*\t0\t0\tACGTACGTAC\tIIIIIIIIII\tMD:Z:6\tZT:Z:0");
        al.parse_details().unwrap();
        assert_eq!(al.cigar.left_clip, 2);
        assert_eq!(al.cigar.right_clip, 2);
        assert_eq!(al.lpos(), 98);
        // 6 aligned + 2 right-clip bases beyond pos.
        assert_eq!(al.rpos(), 107);
        assert_eq!(xscript::len_on_ref(&al.edit_xscript), (al.rpos() - al.lpos() + 1) as usize);
    }

    #[test]
    fn fragment_length_ignores_tlen() {
        let mut a1 =
            record("rd\t99\tchr1\t100\t42\t5M\t=\t140\t999\tACGTA\tIIIII\tMD:Z:5\tZT:Z:0");
        let mut a2 =
            record("rd\t147\tchr1\t140\t42\t5M\t=\t100\t-999\tACGTA\tIIIII\tMD:Z:5\tZT:Z:0");
        a1.parse_details().unwrap();
        a2.parse_details().unwrap();
        assert_eq!(Alignment::fragment_length(&a1, &a2), 45);
        assert_eq!(Alignment::fragment_length(&a2, &a1), 45);
    }

    #[test]
    fn sim_name_correct_within_wiggle() {
        // Truth refoff 1000, observed pos 1001 (0-based 1000).
        let mut al = record(&aligned_line("qsim!:chr3:+:1000:-12:u", 0, "chr3", 1001));
        al.set_correctness(30);
        assert_eq!(al.correct, 1);
    }

    #[test]
    fn sim_name_incorrect_outside_wiggle() {
        let mut al = record(&aligned_line("qsim!:chr3:+:1000:-12:u", 0, "chr3", 1500));
        al.set_correctness(30);
        assert_eq!(al.correct, 0);
    }

    #[test]
    fn sim_name_wrong_strand() {
        let mut al = record(&aligned_line("qsim!:chr3:-:1000:-12:u", 0, "chr3", 1001));
        al.set_correctness(30);
        assert_eq!(al.correct, 0);
    }

    #[test]
    fn sim_name_wrong_reference() {
        let mut al = record(&aligned_line("qsim!:chr4:+:1000:-12:u", 0, "chr3", 1001));
        al.set_correctness(30);
        assert_eq!(al.correct, 0);
    }

    #[test]
    fn sim_name_paired_mates_check_own_tuple() {
        let name = "qsim!:chr1:+:500:-4:chr1:-:700:-8:c";
        // Mate 1 validates the first tuple.
        let mut m1 = record(&aligned_line(name, 0x43, "chr1", 501));
        m1.set_correctness(30);
        assert_eq!(m1.correct, 1);
        // Mate 2 validates the second tuple (reverse strand).
        let mut m2 = record(&aligned_line(name, 0x93, "chr1", 701));
        m2.set_correctness(30);
        assert_eq!(m2.correct, 1);
        // Mate 2 at the mate-1 coordinates is wrong.
        let mut m2_wrong = record(&aligned_line(name, 0x93, "chr1", 501));
        m2_wrong.set_correctness(30);
        assert_eq!(m2_wrong.correct, 0);
    }

    #[test]
    fn unrecognized_name_is_unknown() {
        let mut al = record(&aligned_line("SRR1234.567", 0, "chr1", 100));
        al.set_correctness(30);
        assert_eq!(al.correct, -1);
    }

    #[test]
    fn wgsim_name_left_end() {
        // Mate 1, not flipped: left end of the fragment.
        let name = "chr2_25006153_25006410_0:0:0_0:0:0_100_100_0_1";
        let mut al = record(&aligned_line(name, 0x43, "chr2", 25006153));
        al.set_correctness(30);
        assert_eq!(al.correct, 1);
    }

    #[test]
    fn wgsim_name_right_end() {
        // Mate 2, not flipped: right end, pos = frag_end - len2 + 1.
        let name = "chr2_25006153_25006410_0:0:0_0:0:0_100_100_0_1";
        let mut al = record(&aligned_line(name, 0x83, "chr2", 25006311));
        al.set_correctness(30);
        assert_eq!(al.correct, 1);
        let mut far = record(&aligned_line(name, 0x83, "chr2", 25006153));
        far.set_correctness(30);
        assert_eq!(far.correct, 0);
    }

    #[test]
    fn short_line_rejected() {
        let mut al = Alignment::default();
        assert!(al.set_line(b"only\tfour\tfields\there", 1).is_err());
    }
}
