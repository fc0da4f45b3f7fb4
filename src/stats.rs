//! Correlation coefficients between two numeric columns.
//!
//! Each coefficient is reported together with its square. Rows where either
//! value is NaN are dropped pairwise before computing.

use serde::Serialize;

/// `(r, r²)` for one method.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Coefficient(pub f64, pub f64);

impl Coefficient {
    fn of(r: Option<f64>) -> Self {
        match r {
            Some(r) if r.is_finite() => Coefficient(r, r * r),
            _ => Coefficient(0.0, 0.0),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Correlations {
    pub pearson: Coefficient,
    pub kendall: Coefficient,
    pub spearman: Coefficient,
}

impl Correlations {
    /// Correlation of a column with itself.
    pub fn identity() -> Self {
        Correlations {
            pearson: Coefficient(1.0, 1.0),
            kendall: Coefficient(1.0, 1.0),
            spearman: Coefficient(1.0, 1.0),
        }
    }
}

/// All three coefficients over the rows in `rows`.
pub fn correlations(x: &[f64], y: &[f64], rows: impl Iterator<Item = usize>) -> Correlations {
    let (xs, ys): (Vec<f64>, Vec<f64>) = rows
        .filter(|&r| !x[r].is_nan() && !y[r].is_nan())
        .map(|r| (x[r], y[r]))
        .unzip();
    Correlations {
        pearson: Coefficient::of(pearson(&xs, &ys)),
        kendall: Coefficient::of(kendall(&xs, &ys)),
        spearman: Coefficient::of(spearman(&xs, &ys)),
    }
}

/// Pearson's r; `None` with fewer than two points or zero variance.
pub fn pearson(x: &[f64], y: &[f64]) -> Option<f64> {
    let n = x.len();
    if n < 2 {
        return None;
    }
    let mx = x.iter().sum::<f64>() / n as f64;
    let my = y.iter().sum::<f64>() / n as f64;
    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    for (a, b) in x.iter().zip(y) {
        let (dx, dy) = (a - mx, b - my);
        sxy += dx * dy;
        sxx += dx * dx;
        syy += dy * dy;
    }
    if sxx == 0.0 || syy == 0.0 {
        return None;
    }
    Some((sxy / (sxx * syy).sqrt()).clamp(-1.0, 1.0))
}

/// Kendall's tau-b, which corrects for ties in either variable.
///
/// Knight's method: sort by `(x, y)`, then count discordant pairs as the
/// inversions a merge sort on `y` has to undo. O(n log n).
pub fn kendall(x: &[f64], y: &[f64]) -> Option<f64> {
    let n = x.len();
    if n < 2 {
        return None;
    }
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| x[a].total_cmp(&x[b]).then(y[a].total_cmp(&y[b])));

    let tied_x = tied_pairs(order.iter().map(|&i| x[i]));
    let tied_xy = tied_pairs(order.iter().map(|&i| (x[i], y[i])));
    let mut ys: Vec<f64> = order.iter().map(|&i| y[i]).collect();
    let mut scratch = vec![0.0; n];
    let discordant = sort_counting_inversions(&mut ys, &mut scratch);
    let tied_y = tied_pairs(ys.iter().copied());

    let pairs = (n as u64 * (n as u64 - 1) / 2) as f64;
    let (tied_x, tied_y, tied_xy) = (tied_x as f64, tied_y as f64, tied_xy as f64);
    let n0 = pairs - tied_x;
    let n1 = pairs - tied_y;
    if n0 == 0.0 || n1 == 0.0 {
        return None;
    }
    let score = pairs - tied_x - tied_y + tied_xy - 2.0 * discordant as f64;
    Some((score / (n0 * n1).sqrt()).clamp(-1.0, 1.0))
}

/// Number of equal pairs in sorted input.
fn tied_pairs<T: PartialEq>(sorted: impl Iterator<Item = T>) -> u64 {
    let mut total = 0;
    let mut run = 0u64;
    let mut prev: Option<T> = None;
    for v in sorted {
        if prev.as_ref() == Some(&v) {
            run += 1;
        } else {
            total += run * run.saturating_sub(1) / 2;
            run = 1;
            prev = Some(v);
        }
    }
    total + run * run.saturating_sub(1) / 2
}

/// Merge sort `v` ascending and return how many out-of-order pairs it held.
fn sort_counting_inversions(v: &mut [f64], scratch: &mut [f64]) -> u64 {
    let n = v.len();
    if n < 2 {
        return 0;
    }
    let mid = n / 2;
    let mut swaps = sort_counting_inversions(&mut v[..mid], &mut scratch[..mid])
        + sort_counting_inversions(&mut v[mid..], &mut scratch[mid..]);

    let (mut i, mut j, mut k) = (0, mid, 0);
    while i < mid && j < n {
        if v[i] <= v[j] {
            scratch[k] = v[i];
            i += 1;
        } else {
            scratch[k] = v[j];
            j += 1;
            swaps += (mid - i) as u64;
        }
        k += 1;
    }
    scratch[k..k + mid - i].copy_from_slice(&v[i..mid]);
    k += mid - i;
    scratch[k..n].copy_from_slice(&v[j..n]);
    v.copy_from_slice(&scratch[..n]);
    swaps
}

/// Spearman's rho: Pearson's r over average ranks.
pub fn spearman(x: &[f64], y: &[f64]) -> Option<f64> {
    pearson(&average_ranks(x), &average_ranks(y))
}

/// 1-based ranks; tied values share the mean of their positions.
pub fn average_ranks(values: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));

    let mut ranks = vec![0.0; values.len()];
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && values[order[end]] == values[order[start]] {
            end += 1;
        }
        let rank = (start + end + 1) as f64 / 2.0;
        for &i in &order[start..end] {
            ranks[i] = rank;
        }
        start = end;
    }
    ranks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    // Direct O(n^2) tau-b over every pair.
    fn kendall_by_pairs(x: &[f64], y: &[f64]) -> Option<f64> {
        let n = x.len();
        let (mut concordant, mut discordant) = (0i64, 0i64);
        let (mut tied_x, mut tied_y) = (0i64, 0i64);
        for i in 0..n {
            for j in (i + 1)..n {
                let dx = x[i] - x[j];
                let dy = y[i] - y[j];
                match (dx == 0.0, dy == 0.0) {
                    (true, true) => {}
                    (true, false) => tied_x += 1,
                    (false, true) => tied_y += 1,
                    (false, false) if (dx > 0.0) == (dy > 0.0) => concordant += 1,
                    (false, false) => discordant += 1,
                }
            }
        }
        let n0 = (concordant + discordant + tied_x) as f64;
        let n1 = (concordant + discordant + tied_y) as f64;
        if n0 == 0.0 || n1 == 0.0 {
            return None;
        }
        Some((concordant - discordant) as f64 / (n0 * n1).sqrt())
    }

    // xorshift64, enough to scatter test values.
    fn noise(seed: &mut u64) -> u64 {
        *seed ^= *seed << 13;
        *seed ^= *seed >> 7;
        *seed ^= *seed << 17;
        *seed
    }

    #[test]
    fn merge_count_matches_pairwise_tau() {
        let mut seed = 0x9e37_79b9_7f4a_7c15;
        for &(n, levels) in &[(2usize, 2u64), (7, 3), (50, 5), (300, 11), (1000, 1000)] {
            let x: Vec<f64> = (0..n).map(|_| (noise(&mut seed) % levels) as f64).collect();
            let y: Vec<f64> = (0..n).map(|_| (noise(&mut seed) % levels) as f64 - 2.5).collect();
            match (kendall(&x, &y), kendall_by_pairs(&x, &y)) {
                (Some(fast), Some(slow)) => assert!(close(fast, slow), "n={}: {} vs {}", n, fast, slow),
                (fast, slow) => assert_eq!(fast, slow, "n={}", n),
            }
        }
    }

    #[test]
    fn inversion_count_sorts() {
        let mut v = [3.0, 1.0, 2.0, 1.0];
        let mut scratch = [0.0; 4];
        assert_eq!(sort_counting_inversions(&mut v, &mut scratch), 4);
        assert_eq!(v, [1.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn perfect_and_inverse_relationships() {
        let x = [1.0, 2.0, 3.0, 4.0];
        let y = [10.0, 20.0, 30.0, 40.0];
        assert!(close(pearson(&x, &y).unwrap(), 1.0));
        assert!(close(kendall(&x, &y).unwrap(), 1.0));

        let inv = [4.0, 3.0, 2.0, 1.0];
        assert!(close(spearman(&x, &inv).unwrap(), -1.0));
        assert!(close(kendall(&x, &inv).unwrap(), -1.0));
    }

    #[test]
    fn ties_use_tau_b_and_average_ranks() {
        assert_eq!(average_ranks(&[3.0, 1.0, 3.0, 2.0]), vec![3.5, 1.0, 3.5, 2.0]);

        // Pairs: 2 concordant, 3 discordant, 1 tied in x.
        let x = [1.0, 1.0, 2.0, 3.0];
        let y = [1.0, 2.0, 3.0, 0.0];
        let tau = kendall(&x, &y).unwrap();
        assert!(close(tau, -1.0 / (5.0f64 * 6.0).sqrt()));
    }

    #[test]
    fn nan_rows_are_dropped_and_degenerate_input_is_zero() {
        let x = [1.0, f64::NAN, 2.0, 3.0];
        let y = [2.0, 5.0, 4.0, f64::NAN];
        let c = correlations(&x, &y, 0..4);
        assert!(close(c.pearson.0, 1.0));
        assert!(close(c.pearson.1, 1.0));

        let c = correlations(&[1.0, 1.0], &[2.0, 3.0], 0..2);
        assert_eq!(c.pearson, Coefficient(0.0, 0.0));
        assert_eq!(c.kendall, Coefficient(0.0, 0.0));

        let c = correlations(&x, &y, std::iter::empty());
        assert_eq!(c.spearman, Coefficient(0.0, 0.0));
    }
}
