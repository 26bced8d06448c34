//! Template library: reservoir-sampled collections of observed alignment
//! shapes, and the input models the simulator draws from.

use crate::rng::RngSource;
use crate::xscript;

/// Unpaired (or bad-end) alignment template.  Owns deep copies of the
/// quality string and edit transcript; the scanner's line buffers are
/// transient.
#[derive(Debug, Clone, Default)]
pub struct TemplateUnpaired {
    pub best_score: i32,
    pub fw: bool,
    pub len: u32,
    /// `b'0'` for unpaired, `b'1'`/`b'2'` for the aligned end of a bad-end
    /// pair.
    pub mate: u8,
    /// Read length of the (unaligned) opposite mate; 0 when unpaired.
    pub opp_len: u32,
    pub qual: Vec<u8>,
    pub xscript: Vec<u8>,
}

impl TemplateUnpaired {
    /// Reference positions spanned by the template's transcript.
    pub fn reflen(&self) -> usize {
        xscript::len_on_ref(&self.xscript)
    }
}

/// Concordant or discordant pair template.
#[derive(Debug, Clone, Default)]
pub struct TemplatePaired {
    pub score_12: i32,
    pub score_1: i32,
    pub len_1: u32,
    pub fw_1: bool,
    pub qual_1: Vec<u8>,
    pub xscript_1: Vec<u8>,
    pub score_2: i32,
    pub len_2: u32,
    pub fw_2: bool,
    pub qual_2: Vec<u8>,
    pub xscript_2: Vec<u8>,
    /// True when mate 1 is the upstream (leftmost) end of the fragment.
    pub upstream_1: bool,
    pub fraglen: u32,
}

impl TemplatePaired {
    pub fn reflen_1(&self) -> usize {
        xscript::len_on_ref(&self.xscript_1)
    }

    pub fn reflen_2(&self) -> usize {
        xscript::len_on_ref(&self.xscript_2)
    }
}

/// Fixed-capacity uniform sample over a stream of unknown length
/// (Vitter's algorithm R).
///
/// The two-phase protocol lets the caller format a template directly into
/// the accepted slot instead of building it speculatively: `add_part1`
/// accounts for the item and either hands back a slot index to fill or
/// rejects it.
pub struct ReservoirSample<T> {
    k: usize,
    n: u64,
    items: Vec<T>,
}

impl<T: Default> ReservoirSample<T> {
    pub fn new(k: usize) -> Self {
        ReservoirSample {
            k,
            n: 0,
            items: Vec::new(),
        }
    }

    /// Account for one incoming item.  Returns the slot index to write
    /// into, or `None` if the item is rejected.  `n` advances either way.
    pub fn add_part1(&mut self, rng: &mut dyn RngSource) -> Option<usize> {
        self.n += 1;
        if self.items.len() < self.k {
            self.items.push(T::default());
            Some(self.items.len() - 1)
        } else {
            let j = (rng.uniform_01() * self.n as f64) as u64;
            if (j as usize) < self.k {
                Some(j as usize)
            } else {
                None
            }
        }
    }

    pub fn slot(&mut self, i: usize) -> &mut T {
        &mut self.items[i]
    }

    /// Number of items offered, not all of which were retained.
    pub fn n_added(&self) -> u64 {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }
}

/// All four template classes: unpaired `u`, bad-end `b`, concordant `c`,
/// discordant `d`.
pub struct TemplateStore {
    pub u: ReservoirSample<TemplateUnpaired>,
    pub b: ReservoirSample<TemplateUnpaired>,
    pub c: ReservoirSample<TemplatePaired>,
    pub d: ReservoirSample<TemplatePaired>,
}

impl TemplateStore {
    pub fn new(k: usize) -> Self {
        TemplateStore {
            u: ReservoirSample::new(k),
            b: ReservoirSample::new(k),
            c: ReservoirSample::new(k),
            d: ReservoirSample::new(k),
        }
    }
}

/// Read-only view over one unpaired template class, with the aggregate
/// lengths the simulator needs.
pub struct InputModelUnpaired<'a> {
    ts: &'a [TemplateUnpaired],
    n_added: u64,
    avg_len: f64,
    max_reflen: usize,
}

impl<'a> InputModelUnpaired<'a> {
    pub fn new(sample: &'a ReservoirSample<TemplateUnpaired>) -> Self {
        let ts = sample.items();
        let mut avg_len = 0.0;
        let mut max_reflen = 0;
        for t in ts {
            avg_len += t.len as f64 / ts.len() as f64;
            max_reflen = max_reflen.max(t.reflen());
        }
        InputModelUnpaired {
            ts,
            n_added: sample.n_added(),
            avg_len,
            max_reflen,
        }
    }

    pub fn draw(&self, rng: &mut dyn RngSource) -> &'a TemplateUnpaired {
        debug_assert!(!self.is_empty());
        &self.ts[rng.below(self.ts.len())]
    }

    pub fn is_empty(&self) -> bool {
        self.ts.is_empty()
    }

    /// Templates offered to the reservoir, retained or not.
    pub fn n_added(&self) -> u64 {
        self.n_added
    }

    pub fn avg_len(&self) -> f64 {
        self.avg_len
    }

    /// Longest reference footprint of any retained template.
    pub fn max_reflen(&self) -> usize {
        self.max_reflen
    }
}

/// Read-only view over one paired template class.
pub struct InputModelPaired<'a> {
    ts: &'a [TemplatePaired],
    n_added: u64,
    avg_len: f64,
    max_fraglen: usize,
}

impl<'a> InputModelPaired<'a> {
    pub fn new(sample: &'a ReservoirSample<TemplatePaired>) -> Self {
        let ts = sample.items();
        let mut avg_len = 0.0;
        let mut max_fraglen = 0;
        for t in ts {
            avg_len += t.fraglen as f64 / ts.len() as f64;
            max_fraglen = max_fraglen.max(t.fraglen as usize);
        }
        InputModelPaired {
            ts,
            n_added: sample.n_added(),
            avg_len,
            max_fraglen,
        }
    }

    pub fn draw(&self, rng: &mut dyn RngSource) -> &'a TemplatePaired {
        debug_assert!(!self.is_empty());
        &self.ts[rng.below(self.ts.len())]
    }

    pub fn is_empty(&self) -> bool {
        self.ts.is_empty()
    }

    pub fn n_added(&self) -> u64 {
        self.n_added
    }

    pub fn avg_len(&self) -> f64 {
        self.avg_len
    }

    pub fn max_fraglen(&self) -> usize {
        self.max_fraglen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::{RngSource, SimRng};

    #[test]
    fn fills_in_order_up_to_capacity() {
        let mut rng = SimRng::seeded(1);
        let mut rs: ReservoirSample<u64> = ReservoirSample::new(4);
        for i in 0..4 {
            let slot = rs.add_part1(&mut rng);
            assert_eq!(slot, Some(i));
            *rs.slot(i) = i as u64;
        }
        assert_eq!(rs.n_added(), 4);
        assert_eq!(rs.items().len(), 4);
    }

    #[test]
    fn n_advances_on_rejection() {
        let mut rng = SimRng::seeded(2);
        let mut rs: ReservoirSample<u64> = ReservoirSample::new(1);
        for i in 0..100 {
            if let Some(slot) = rs.add_part1(&mut rng) {
                *rs.slot(slot) = i;
            }
        }
        assert_eq!(rs.n_added(), 100);
        assert_eq!(rs.items().len(), 1);
    }

    #[test]
    fn rejection_boundary_follows_uniform_draw() {
        use crate::rng::testing::ScriptedRng;
        let mut rng = ScriptedRng::new(vec![0.9, 0.1], vec![]);
        let mut rs: ReservoirSample<u64> = ReservoirSample::new(2);
        assert_eq!(rs.add_part1(&mut rng), Some(0));
        assert_eq!(rs.add_part1(&mut rng), Some(1));
        // n = 3, draw 0.9: slot 2 is outside the reservoir, rejected.
        assert_eq!(rs.add_part1(&mut rng), None);
        // n = 4, draw 0.1: slot 0 is replaced.
        assert_eq!(rs.add_part1(&mut rng), Some(0));
    }

    #[test]
    fn reservoir_is_approximately_uniform() {
        // Feed N >> K items under many seeds; each item should be retained
        // with frequency near K/N.
        const N: u64 = 200;
        const K: usize = 10;
        const TRIALS: u64 = 400;
        let mut kept = vec![0u32; N as usize];
        for seed in 0..TRIALS {
            let mut rng = SimRng::seeded(seed);
            let mut rs: ReservoirSample<u64> = ReservoirSample::new(K);
            for i in 0..N {
                if let Some(slot) = rs.add_part1(&mut rng) {
                    *rs.slot(slot) = i;
                }
            }
            for &item in rs.items() {
                kept[item as usize] += 1;
            }
        }
        let expect = TRIALS as f64 * K as f64 / N as f64; // 20 per item
        for (i, &count) in kept.iter().enumerate() {
            let dev = (count as f64 - expect).abs();
            // Loose 5-sigma-ish band; a biased sampler blows well past it.
            assert!(
                dev < 25.0,
                "item {} retained {} times, expected about {}",
                i,
                count,
                expect
            );
        }
    }

    #[test]
    fn unpaired_model_aggregates() {
        let mut rng = SimRng::seeded(3);
        let mut rs: ReservoirSample<TemplateUnpaired> = ReservoirSample::new(8);
        for (len, xs) in [(4u32, &b"===="[..]), (6, b"==D==="), (2, b"==")] {
            let slot = rs.add_part1(&mut rng).unwrap();
            let t = rs.slot(slot);
            t.len = len;
            t.xscript = xs.to_vec();
        }
        let m = InputModelUnpaired::new(&rs);
        assert_eq!(m.n_added(), 3);
        assert!((m.avg_len() - 4.0).abs() < 1e-9);
        // 6-base transcript with a deletion spans 6 reference positions.
        assert_eq!(m.max_reflen(), 6);
    }

    #[test]
    fn paired_model_aggregates() {
        let mut rng = SimRng::seeded(4);
        let mut rs: ReservoirSample<TemplatePaired> = ReservoirSample::new(8);
        for fraglen in [100u32, 300, 200] {
            let slot = rs.add_part1(&mut rng).unwrap();
            rs.slot(slot).fraglen = fraglen;
        }
        let m = InputModelPaired::new(&rs);
        assert!((m.avg_len() - 200.0).abs() < 1e-9);
        assert_eq!(m.max_fraglen(), 300);
    }

    #[test]
    fn draw_covers_all_slots() {
        let mut rng = SimRng::seeded(5);
        let mut rs: ReservoirSample<TemplateUnpaired> = ReservoirSample::new(3);
        for score in [1, 2, 3] {
            let slot = rs.add_part1(&mut rng).unwrap();
            rs.slot(slot).best_score = score;
        }
        let m = InputModelUnpaired::new(&rs);
        let mut seen = [false; 3];
        for _ in 0..200 {
            seen[(m.draw(&mut rng).best_score - 1) as usize] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }
}
