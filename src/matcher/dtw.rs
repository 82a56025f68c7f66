//! Dynamic time warping over row-major frame sequences: exact alignment and a
//! multi-resolution approximation constrained to a band around the projected
//! low-resolution path.

/// Accumulated alignment cost plus the warping path from (0, 0) to (n-1, m-1).
#[derive(Debug, Clone)]
pub struct Alignment {
    pub cost: f64,
    pub path: Vec<(usize, usize)>,
}

impl Alignment {
    /// No alignment exists: one side is empty.
    fn unreachable() -> Self {
        Self {
            cost: f64::INFINITY,
            path: Vec::new(),
        }
    }
}

#[inline]
fn frames(data: &[f32], dim: usize) -> usize {
    if dim == 0 {
        0
    } else {
        data.len() / dim
    }
}

/// Per-row inclusive column range `[lo, hi]` of cells the DP may visit.
#[derive(Debug, Clone)]
struct Band {
    lo: Vec<usize>,
    hi: Vec<usize>,
}

impl Band {
    fn full(n: usize, m: usize) -> Self {
        Self {
            lo: vec![0; n],
            hi: vec![m - 1; n],
        }
    }

    /// Force the band to contain both corners and to admit at least one
    /// monotone path. Cells dropped by raising `lo` are unreachable anyway.
    fn repair(&mut self, m: usize) {
        let n = self.lo.len();
        self.lo[0] = 0;
        self.hi[0] = self.hi[0].min(m - 1);
        for i in 1..n {
            let ceiling = (self.hi[i - 1] + 1).min(m - 1);
            self.lo[i] = self.lo[i].clamp(self.lo[i - 1], ceiling);
            self.hi[i] = self.hi[i].min(m - 1).max(self.lo[i]);
        }
        self.hi[n - 1] = m - 1;
    }
}

#[inline]
fn frame(data: &[f32], dim: usize, i: usize) -> &[f32] {
    &data[i * dim..(i + 1) * dim]
}

#[inline]
fn euclidean(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(&x, &y)| {
            let d = x as f64 - y as f64;
            d * d
        })
        .sum::<f64>()
        .sqrt()
}

const UP: u8 = 0;
const LEFT: u8 = 1;
const DIAG: u8 = 2;
const ORIGIN: u8 = 3;

fn align_in_band(x: &[f32], y: &[f32], dim: usize, band: &Band) -> Alignment {
    let n = x.len() / dim;
    let m = y.len() / dim;
    let mut cost: Vec<Vec<f64>> = Vec::with_capacity(n);
    let mut step: Vec<Vec<u8>> = Vec::with_capacity(n);

    for i in 0..n {
        let (lo, hi) = (band.lo[i], band.hi[i]);
        let mut row_cost = vec![f64::INFINITY; hi - lo + 1];
        let mut row_step = vec![ORIGIN; hi - lo + 1];
        let xi = frame(x, dim, i);

        for j in lo..=hi {
            let local = euclidean(xi, frame(y, dim, j));
            if i == 0 && j == 0 {
                row_cost[0] = local;
                continue;
            }
            let prev_row = |col: usize| -> f64 {
                if i == 0 {
                    return f64::INFINITY;
                }
                let (plo, phi) = (band.lo[i - 1], band.hi[i - 1]);
                if col < plo || col > phi {
                    f64::INFINITY
                } else {
                    cost[i - 1][col - plo]
                }
            };
            let up = prev_row(j);
            let left = if j > lo { row_cost[j - 1 - lo] } else { f64::INFINITY };
            let diag = if j > 0 { prev_row(j - 1) } else { f64::INFINITY };

            let (best, dir) = if up <= left && up <= diag {
                (up, UP)
            } else if left <= diag {
                (left, LEFT)
            } else {
                (diag, DIAG)
            };
            row_cost[j - lo] = best + local;
            row_step[j - lo] = dir;
        }
        cost.push(row_cost);
        step.push(row_step);
    }

    let total = cost[n - 1][m - 1 - band.lo[n - 1]];
    let mut path = Vec::with_capacity(n + m);
    let (mut i, mut j) = (n - 1, m - 1);
    loop {
        path.push((i, j));
        match step[i][j - band.lo[i]] {
            UP if i > 0 => i -= 1,
            LEFT if j > 0 => j -= 1,
            DIAG if i > 0 && j > 0 => {
                i -= 1;
                j -= 1;
            }
            _ => break,
        }
    }
    path.reverse();

    Alignment { cost: total, path }
}

/// Exact DTW over every cell of the `n x m` grid. Infinite cost when either
/// sequence has no frames.
pub fn exact(x: &[f32], y: &[f32], dim: usize) -> Alignment {
    let (n, m) = (frames(x, dim), frames(y, dim));
    if n == 0 || m == 0 {
        return Alignment::unreachable();
    }
    align_in_band(x, y, dim, &Band::full(n, m))
}

/// Average consecutive frame pairs; an odd trailing frame is dropped.
fn coarsen(data: &[f32], dim: usize) -> Vec<f32> {
    let pairs = data.len() / dim / 2;
    let mut out = Vec::with_capacity(pairs * dim);
    for p in 0..pairs {
        let a = frame(data, dim, 2 * p);
        let b = frame(data, dim, 2 * p + 1);
        out.extend(a.iter().zip(b).map(|(u, v)| (u + v) / 2.0));
    }
    out
}

/// Project a low-resolution path onto the full grid, widened by `radius`.
fn expand_band(path: &[(usize, usize)], n: usize, m: usize, radius: usize) -> Band {
    let mut lo = vec![usize::MAX; n];
    let mut hi = vec![0usize; n];
    let r = radius as isize;
    for &(ci, cj) in path {
        for a in -r..=r {
            let row = ci as isize + a;
            if row < 0 {
                continue;
            }
            let col_lo = (cj as isize - r).max(0) as usize * 2;
            let col_hi = (cj as isize + r) as usize * 2 + 1;
            for fine in [row as usize * 2, row as usize * 2 + 1] {
                if fine >= n {
                    continue;
                }
                lo[fine] = lo[fine].min(col_lo);
                hi[fine] = hi[fine].max(col_hi);
            }
        }
    }
    let mut band = Band { lo, hi };
    band.repair(m);
    band
}

/// Multi-resolution approximate DTW. Never cheaper than [`exact`].
pub fn fast(x: &[f32], y: &[f32], dim: usize, radius: usize) -> Alignment {
    let (n, m) = (frames(x, dim), frames(y, dim));
    if n == 0 || m == 0 {
        return Alignment::unreachable();
    }
    let min_size = radius + 2;
    if n < min_size || m < min_size {
        return exact(x, y, dim);
    }
    let coarse = fast(&coarsen(x, dim), &coarsen(y, dim), dim, radius);
    let band = expand_band(&coarse.path, n, m, radius);
    align_in_band(x, y, dim, &band)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(values: &[f32]) -> Vec<f32> {
        values.to_vec()
    }

    #[test]
    fn identical_sequences_cost_zero() {
        let a = seq(&[0.0, 1.0, 2.0, 3.0, 2.0, 1.0, 0.0, 1.0, 3.0, 5.0]);
        let e = exact(&a, &a, 1);
        assert_eq!(e.cost, 0.0);
        assert_eq!(e.path.first(), Some(&(0, 0)));
        assert_eq!(e.path.last(), Some(&(9, 9)));
        assert_eq!(fast(&a, &a, 1, 1).cost, 0.0);
    }

    #[test]
    fn time_stretch_is_absorbed() {
        let a = seq(&[0.0, 1.0, 2.0, 3.0]);
        let b = seq(&[0.0, 0.0, 1.0, 1.0, 2.0, 2.0, 3.0, 3.0]);
        assert_eq!(exact(&a, &b, 1).cost, 0.0);
    }

    #[test]
    fn path_is_monotone_and_connected() {
        let a: Vec<f32> = (0..40).map(|i| (i as f32 * 0.3).sin()).collect();
        let b: Vec<f32> = (0..55).map(|i| (i as f32 * 0.22).sin()).collect();
        for alignment in [exact(&a, &b, 1), fast(&a, &b, 1, 1)] {
            assert_eq!(alignment.path.first(), Some(&(0, 0)));
            assert_eq!(alignment.path.last(), Some(&(39, 54)));
            for w in alignment.path.windows(2) {
                let (di, dj) = (w[1].0 - w[0].0, w[1].1 - w[0].1);
                assert!(di <= 1 && dj <= 1 && di + dj >= 1);
            }
            assert!(alignment.cost.is_finite());
        }
    }

    #[test]
    fn fast_never_beats_exact() {
        for shift in 0..6 {
            let a: Vec<f32> = (0..64)
                .flat_map(|i| {
                    let t = i as f32 * 0.17;
                    [t.sin(), (t * 1.7).cos()]
                })
                .collect();
            let b: Vec<f32> = (0..48)
                .flat_map(|i| {
                    let t = (i + shift) as f32 * 0.21;
                    [t.sin(), (t * 1.3).cos()]
                })
                .collect();
            let e = exact(&a, &b, 2).cost;
            let f = fast(&a, &b, 2, 1).cost;
            assert!(f + 1e-9 >= e, "shift={shift} fast={f} exact={e}");
        }
    }

    #[test]
    fn coarsen_drops_odd_tail() {
        let c = coarsen(&[1.0, 3.0, 5.0, 7.0, 9.0], 1);
        assert_eq!(c, vec![2.0, 6.0]);
    }

    #[test]
    fn empty_side_has_no_alignment() {
        let a = seq(&[1.0, 2.0, 3.0]);
        for alignment in [
            exact(&[], &a, 1),
            exact(&a, &[], 1),
            fast(&[], &a, 1, 1),
            fast(&a, &[], 1, 2),
            exact(&a, &a, 0),
        ] {
            assert_eq!(alignment.cost, f64::INFINITY);
            assert!(alignment.path.is_empty());
        }
    }

    #[test]
    fn single_frame_inputs_align() {
        let e = exact(&[1.0], &[4.0, 2.0], 1);
        assert_eq!(e.cost, 4.0);
        assert_eq!(e.path, vec![(0, 0), (0, 1)]);
    }
}
