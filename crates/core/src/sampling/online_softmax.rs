//! Single-pass max/normalizer tracking and bounded top-k accumulation.
//!
//! A row is scanned once: every element updates the running `(m, d)` pair
//! (max and sum of `exp(x - m)`) and a sorted top-k buffer. Partial results
//! from independent chunks combine with [`Md::merge`] and
//! [`TopKAccumulator::merge`], so rows can be reduced in parallel.

use rayon::prelude::*;

/// Running maximum `m` and normalizer `d = Σ exp(x - m)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Md {
    pub m: f32,
    pub d: f32,
}

impl Md {
    pub const IDENTITY: Md = Md {
        m: -f32::MAX,
        d: 0.0,
    };

    pub fn from_value(x: f32) -> Self {
        Self { m: x, d: 1.0 }
    }

    /// `d = d_big + d_small * exp(m_small - m_big)`.
    pub fn merge(self, other: Md) -> Md {
        let (big, small) = if self.m >= other.m {
            (self, other)
        } else {
            (other, self)
        };
        if small.d == 0.0 || small.m == f32::NEG_INFINITY {
            return big;
        }
        Md {
            m: big.m,
            d: big.d + small.d * (small.m - big.m).exp(),
        }
    }

    /// `log Σ exp(x)` over the reduced elements.
    pub fn log_sum_exp(&self) -> f32 {
        self.m + self.d.ln()
    }
}

/// Sorted (descending) buffer of the `k` best `(id, value)` pairs.
///
/// Ties are ordered by ascending id, so merging partial buffers in any
/// grouping yields the same result as a sequential scan.
#[derive(Debug, Clone)]
pub struct TopKAccumulator {
    k: usize,
    entries: Vec<(u32, f32)>,
}

impl TopKAccumulator {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            entries: Vec::with_capacity(k + 1),
        }
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[(u32, f32)] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<(u32, f32)> {
        self.entries
    }

    fn ranks_before(a: (u32, f32), b: (u32, f32)) -> bool {
        a.1 > b.1 || (a.1 == b.1 && a.0 < b.0)
    }

    pub fn insert(&mut self, id: u32, value: f32) {
        if self.k == 0 {
            return;
        }
        if self.entries.len() == self.k {
            match self.entries.last() {
                Some(&last) if !Self::ranks_before((id, value), last) => return,
                _ => {}
            }
        }
        let pos = self
            .entries
            .partition_point(|&e| Self::ranks_before(e, (id, value)));
        self.entries.insert(pos, (id, value));
        self.entries.truncate(self.k);
    }

    pub fn merge(mut self, other: TopKAccumulator) -> TopKAccumulator {
        for (id, value) in other.entries {
            self.insert(id, value);
        }
        self
    }
}

/// Reduce one row: `(m, d)` over every element and its top-`k`.
///
/// `bias` is added element-wise when present. Ids are `id_offset + index`.
pub fn reduce_md_top_k(
    values: &[f32],
    bias: Option<&[f32]>,
    id_offset: u32,
    k: usize,
) -> (Md, TopKAccumulator) {
    let mut md = Md::IDENTITY;
    let mut top = TopKAccumulator::new(k);
    for (i, &x) in values.iter().enumerate() {
        let x = match bias {
            Some(b) => x + b.get(i).copied().unwrap_or(0.0),
            None => x,
        };
        md = md.merge(Md::from_value(x));
        top.insert(id_offset + i as u32, x);
    }
    (md, top)
}

/// Parallel version of [`reduce_md_top_k`] over `chunks` vocabulary partitions.
pub fn par_reduce_md_top_k(
    values: &[f32],
    bias: Option<&[f32]>,
    k: usize,
    chunks: usize,
) -> (Md, TopKAccumulator) {
    let chunk_len = values.len().div_ceil(chunks.max(1)).max(1);
    values
        .par_chunks(chunk_len)
        .enumerate()
        .map(|(c, chunk)| {
            let start = c * chunk_len;
            let chunk_bias = bias.map(|b| &b[start.min(b.len())..(start + chunk.len()).min(b.len())]);
            reduce_md_top_k(chunk, chunk_bias, start as u32, k)
        })
        .reduce(
            || (Md::IDENTITY, TopKAccumulator::new(k)),
            |(md_a, top_a), (md_b, top_b)| (md_a.merge(md_b), top_a.merge(top_b)),
        )
}

/// Iterative arg-max with masking: picks `k` indices of `values` in
/// descending order, lowest index first among equal values.
pub fn select_and_mask(values: &[f32], k: usize) -> Vec<usize> {
    let rounds = k.min(values.len());
    let mut taken = vec![false; values.len()];
    let mut picked = Vec::with_capacity(rounds);
    for _ in 0..rounds {
        let mut best: Option<usize> = None;
        for (i, &v) in values.iter().enumerate() {
            if taken[i] {
                continue;
            }
            match best {
                Some(b) if v <= values[b] => {}
                _ => best = Some(i),
            }
        }
        if let Some(b) = best {
            taken[b] = true;
            picked.push(b);
        }
    }
    picked
}
