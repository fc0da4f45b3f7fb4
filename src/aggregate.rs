//! Fixed-resolution density canvas for point clouds too large to ship as
//! individual markers.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AxisScale {
    Linear,
    Log,
}

impl AxisScale {
    fn forward(self, v: f64) -> f64 {
        match self {
            AxisScale::Linear => v,
            AxisScale::Log => v.log10(),
        }
    }

    fn inverse(self, v: f64) -> f64 {
        match self {
            AxisScale::Linear => v,
            AxisScale::Log => 10f64.powf(v),
        }
    }
}

/// Smallest coordinate a log axis may start at.
pub const LOG_FLOOR: f64 = 1e-100;

#[derive(Clone, Copy, Debug)]
pub struct CanvasAxis {
    pub bins: usize,
    pub scale: AxisScale,
    /// Explicit data range; `None` spans the aggregated points.
    pub range: Option<(f64, f64)>,
}

/// Aggregated grid. `cells[row][col]` is the cell at `ys[row]`, `xs[col]`;
/// `None` marks a cell with no points.
#[derive(Clone, Debug)]
pub struct DensityGrid {
    pub xs: Vec<f64>,
    pub ys: Vec<f64>,
    pub cells: Vec<Vec<Option<f64>>>,
}

struct Binner {
    scale: AxisScale,
    lo: f64,
    hi: f64,
    bins: usize,
}

impl Binner {
    fn new(axis: &CanvasAxis, data: impl Iterator<Item = f64>) -> Self {
        let (lo, hi) = match axis.range {
            Some((lo, hi)) => (axis.scale.forward(lo), axis.scale.forward(hi)),
            None => data
                .map(|v| axis.scale.forward(v))
                .filter(|v| v.is_finite())
                .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
                    (lo.min(v), hi.max(v))
                }),
        };
        let (lo, hi) = if !lo.is_finite() || !hi.is_finite() {
            (0.0, 1.0)
        } else if lo == hi {
            (lo - 0.5, hi + 0.5)
        } else {
            (lo, hi)
        };
        Binner {
            scale: axis.scale,
            lo,
            hi,
            bins: axis.bins.max(1),
        }
    }

    fn index(&self, v: f64) -> Option<usize> {
        let t = self.scale.forward(v);
        if !(t >= self.lo && t <= self.hi) {
            return None;
        }
        let i = ((t - self.lo) / (self.hi - self.lo) * self.bins as f64) as usize;
        Some(i.min(self.bins - 1))
    }

    fn centres(&self) -> Vec<f64> {
        let step = (self.hi - self.lo) / self.bins as f64;
        (0..self.bins)
            .map(|i| self.scale.inverse(self.lo + step * (i as f64 + 0.5)))
            .collect()
    }
}

/// Bin the points `(x[i], y[i])` for `rows` into the canvas.
///
/// With `z` each cell holds the mean of `z` over its points, otherwise the
/// point count. Points that fall off a log axis are dropped.
pub fn aggregate(
    x: &[f64],
    y: &[f64],
    z: Option<&[f64]>,
    rows: &[usize],
    x_axis: CanvasAxis,
    y_axis: CanvasAxis,
) -> DensityGrid {
    let bx = Binner::new(&x_axis, rows.iter().map(|&r| x[r]));
    let by = Binner::new(&y_axis, rows.iter().map(|&r| y[r]));

    let mut sums = vec![vec![0.0; bx.bins]; by.bins];
    let mut counts = vec![vec![0usize; bx.bins]; by.bins];
    for &r in rows {
        let (Some(cx), Some(cy)) = (bx.index(x[r]), by.index(y[r])) else {
            continue;
        };
        counts[cy][cx] += 1;
        if let Some(z) = z {
            sums[cy][cx] += z[r];
        }
    }

    let cells = counts
        .iter()
        .zip(&sums)
        .map(|(count_row, sum_row)| {
            count_row
                .iter()
                .zip(sum_row)
                .map(|(&n, &s)| match (n, z) {
                    (0, _) => None,
                    (n, Some(_)) => Some(s / n as f64),
                    (n, None) => Some(n as f64),
                })
                .collect()
        })
        .collect();

    DensityGrid {
        xs: bx.centres(),
        ys: by.centres(),
        cells,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear(bins: usize) -> CanvasAxis {
        CanvasAxis {
            bins,
            scale: AxisScale::Linear,
            range: None,
        }
    }

    #[test]
    fn counts_land_in_cells_and_empty_cells_are_absent() {
        let x = [0.0, 0.1, 1.0, 1.0];
        let y = [0.0, 0.1, 1.0, 1.0];
        let grid = aggregate(&x, &y, None, &[0, 1, 2, 3], linear(2), linear(2));
        assert_eq!(grid.cells[0][0], Some(2.0));
        assert_eq!(grid.cells[1][1], Some(2.0));
        assert_eq!(grid.cells[0][1], None);
        assert_eq!(grid.xs, vec![0.25, 0.75]);
    }

    #[test]
    fn color_channel_is_averaged() {
        let x = [0.0, 0.0, 1.0];
        let y = [0.0, 0.0, 1.0];
        let z = [2.0, 4.0, 10.0];
        let grid = aggregate(&x, &y, Some(&z), &[0, 1, 2], linear(2), linear(2));
        assert_eq!(grid.cells[0][0], Some(3.0));
        assert_eq!(grid.cells[1][1], Some(10.0));
    }

    #[test]
    fn log_axis_drops_non_positive_points() {
        let x = [-1.0, 1.0, 100.0];
        let y = [1.0, 1.0, 1.0];
        let log_x = CanvasAxis {
            bins: 2,
            scale: AxisScale::Log,
            range: Some((LOG_FLOOR.max(1.0), 100.0)),
        };
        let grid = aggregate(&x, &y, None, &[0, 1, 2], log_x, linear(1));
        let total: f64 = grid.cells.iter().flatten().flatten().sum();
        assert_eq!(total, 2.0);
        assert!((grid.xs[0] - 10f64.powf(0.5)).abs() < 1e-9);
    }
}
