//! Fixed-range histograms and automatic bin selection.

/// Bin counts plus the `bins + 1` edges they were computed over.
#[derive(Clone, Debug, PartialEq)]
pub struct Histogram {
    pub counts: Vec<f64>,
    pub edges: Vec<f64>,
}

impl Histogram {
    pub fn bins(&self) -> usize {
        self.counts.len()
    }

    pub fn width(&self) -> f64 {
        if self.edges.len() < 2 {
            return 0.0;
        }
        self.edges[1] - self.edges[0]
    }

    pub fn total(&self) -> f64 {
        self.counts.iter().sum()
    }

    pub fn max(&self) -> f64 {
        self.counts.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }
}

/// A degenerate range is widened by half a unit on each side.
fn outer_edges(range: (f64, f64)) -> (f64, f64) {
    let (lo, hi) = range;
    if lo == hi { (lo - 0.5, hi + 0.5) } else { (lo, hi) }
}

/// Histogram of `values` over `range` with `bins` equal-width bins.
///
/// Values outside the range (and NaN) are ignored; the last bin is closed
/// on the right so `range.1` is counted.
pub fn histogram(values: &[f64], bins: usize, range: (f64, f64)) -> Histogram {
    let bins = bins.max(1);
    let (lo, hi) = outer_edges(range);
    let step = (hi - lo) / bins as f64;
    let edges: Vec<f64> = (0..=bins)
        .map(|i| if i == bins { hi } else { lo + step * i as f64 })
        .collect();

    let mut counts = vec![0.0; bins];
    let norm = bins as f64 / (hi - lo);
    for &v in values {
        if !(v >= lo && v <= hi) {
            continue;
        }
        let mut i = (((v - lo) * norm) as usize).min(bins - 1);
        // Float error in the scaled index can land one bin off an edge.
        if v < edges[i] && i > 0 {
            i -= 1;
        } else if i + 1 < bins && v >= edges[i + 1] {
            i += 1;
        }
        counts[i] += 1.0;
    }
    Histogram { counts, edges }
}

/// Linear-interpolated percentile of sorted data, `q` in `[0, 1]`.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let below = pos.floor() as usize;
    let above = pos.ceil() as usize;
    let frac = pos - below as f64;
    sorted[below] + (sorted[above] - sorted[below]) * frac
}

/// Automatic bin count: the narrower of the Sturges and Freedman-Diaconis
/// widths, applied to `range` and capped at `max_bins`.
///
/// Empty input yields a single bin.
pub fn auto_bin_count(values: &[f64], range: (f64, f64), max_bins: usize) -> usize {
    let (lo, hi) = outer_edges(range);
    let mut data: Vec<f64> = values
        .iter()
        .copied()
        .filter(|v| *v >= lo && *v <= hi)
        .collect();
    if data.is_empty() {
        return 1;
    }
    data.sort_by(f64::total_cmp);

    let n = data.len() as f64;
    let ptp = data[data.len() - 1] - data[0];
    let sturges = ptp / (n.log2() + 1.0);
    let iqr = percentile(&data, 0.75) - percentile(&data, 0.25);
    let fd = 2.0 * iqr * n.powf(-1.0 / 3.0);
    let width = if fd > 0.0 { fd.min(sturges) } else { sturges };

    if width <= 0.0 {
        return 1;
    }
    let bins = ((hi - lo) / width).ceil();
    if bins >= max_bins as f64 {
        max_bins.max(1)
    } else {
        (bins as usize).max(1)
    }
}

/// One axis of the NaN marginal view.
#[derive(Clone, Debug, Default)]
pub struct Marginal {
    /// Finite values on this axis whose other coordinate is missing.
    pub lost: Vec<f64>,
    /// Every finite value on this axis.
    pub valid: Vec<f64>,
}

impl Marginal {
    /// Min/max of the finite values, `None` when there are none.
    pub fn range(&self) -> Option<(f64, f64)> {
        finite_range(&self.valid)
    }
}

pub fn finite_range(values: &[f64]) -> Option<(f64, f64)> {
    let mut it = values.iter().copied().filter(|v| v.is_finite());
    let first = it.next()?;
    Some(it.fold((first, first), |(lo, hi), v| (lo.min(v), hi.max(v))))
}

/// Pick one bin count for all four marginal histograms and the shared
/// fractional peak height they should be scaled to.
///
/// Returns `(10, 0.0)` when neither axis has finite data.
pub fn shared_marginal_bins(x: &Marginal, y: &Marginal, max_bins: usize) -> (usize, f64) {
    let axes: Vec<(&Marginal, (f64, f64))> = [x, y]
        .into_iter()
        .filter_map(|m| m.range().map(|r| (m, r)))
        .collect();

    let mut picks = Vec::with_capacity(4);
    for (m, range) in &axes {
        for d in [&m.lost, &m.valid] {
            picks.push(auto_bin_count(d, *range, max_bins));
        }
    }
    if picks.is_empty() {
        return (10, 0.0);
    }

    let mean = picks.iter().sum::<usize>() as f64 / picks.len() as f64;
    let bins = (mean.round_ties_even() as usize).clamp(1, max_bins.max(1));

    let mut peak = f64::NEG_INFINITY;
    for (m, range) in &axes {
        let finite = m.valid.len() as f64;
        for d in [&m.lost, &m.valid] {
            peak = peak.max(histogram(d, bins, *range).max() / finite);
        }
    }
    if peak == f64::NEG_INFINITY {
        peak = 0.0;
    }
    (bins, peak)
}

/// Axis ranges covering `x` and `y` with a 10% margin split across both ends.
pub fn autorange(x: &[f64], y: &[f64]) -> ((f64, f64), (f64, f64)) {
    fn padded(v: &[f64]) -> (f64, f64) {
        let (lo, hi) = v
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &x| {
                (lo.min(x), hi.max(x))
            });
        let margin = (hi - lo) * 0.10;
        (lo - margin / 2.0, hi + margin / 2.0)
    }
    (padded(x), padded(y))
}

pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Autorange for a bar histogram. When one bin towers over the median
/// (ratio above 10) the tallest bins are left out of the y range.
pub fn histogram_autorange(hist: &Histogram) -> ((f64, f64), (f64, f64)) {
    let med = median(&hist.counts);
    let peak = hist.max();
    if med.abs() > 1e-6 && peak / med > 10.0 {
        let rest: Vec<f64> = hist.counts.iter().copied().filter(|c| *c < peak).collect();
        return autorange(&hist.edges, &rest);
    }
    autorange(&hist.edges, &hist.counts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_includes_right_edge() {
        let h = histogram(&[0.0, 0.5, 1.0, 2.0, f64::NAN], 2, (0.0, 1.0));
        assert_eq!(h.counts, vec![1.0, 2.0]);
        assert_eq!(h.edges, vec![0.0, 0.5, 1.0]);
    }

    #[test]
    fn degenerate_range_is_widened() {
        let h = histogram(&[3.0, 3.0], 1, (3.0, 3.0));
        assert_eq!(h.edges, vec![2.5, 3.5]);
        assert_eq!(h.counts, vec![2.0]);
    }

    #[test]
    fn auto_bins_stay_in_bounds() {
        assert_eq!(auto_bin_count(&[], (0.0, 1.0), 200), 1);
        assert_eq!(auto_bin_count(&[5.0], (5.0, 5.0), 200), 1);

        let uniform: Vec<f64> = (0..1000).map(|i| i as f64).collect();
        let n = auto_bin_count(&uniform, (0.0, 999.0), 200);
        assert!((1..=200).contains(&n));
        // Sturges gives ~11 bins for 1000 points; FD is wider here.
        assert_eq!(n, 11);

        // A huge range with tightly packed data saturates at the cap.
        let mut packed = vec![0.0; 500];
        packed.extend((0..500).map(|i| i as f64 * 1e-9));
        packed.push(1e9);
        assert_eq!(auto_bin_count(&packed, (0.0, 1e9), 200), 200);
    }

    #[test]
    fn shared_bins_default_without_data() {
        let empty = Marginal::default();
        assert_eq!(shared_marginal_bins(&empty, &empty, 200), (10, 0.0));
    }

    #[test]
    fn shared_peak_is_fraction_of_finite_rows() {
        let x = Marginal {
            lost: vec![1.0],
            valid: vec![1.0, 2.0],
        };
        let (bins, peak) = shared_marginal_bins(&x, &Marginal::default(), 200);
        assert!((1..=200).contains(&bins));
        assert!(peak > 0.0 && peak <= 1.0);
    }

    #[test]
    fn spike_is_left_out_of_autorange() {
        let h = Histogram {
            counts: vec![1.0, 1.0, 100.0, 1.0, 1.0],
            edges: vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0],
        };
        let (x, y) = histogram_autorange(&h);
        assert_eq!(x, (-0.25, 5.25));
        assert_eq!(y, (1.0, 1.0));

        let flat = Histogram {
            counts: vec![2.0, 4.0],
            edges: vec![0.0, 1.0, 2.0],
        };
        assert_eq!(histogram_autorange(&flat).1, (1.9, 4.1));
    }
}
