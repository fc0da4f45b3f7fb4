//! Lasso/box selection of plotted points into a new subset.

use crate::args;
use crate::dataset::Dataset;
use crate::error::{PlotError, Result};
use crate::render::{PlotType, rank_descending};
use crate::subset::{Mask, SubsetStore};
use serde::Deserialize;
use std::borrow::Cow;

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct SelectRequest {
    #[serde(deserialize_with = "args::opt_string")]
    pub colx: Option<String>,
    #[serde(deserialize_with = "args::opt_string")]
    pub coly: Option<String>,
    #[serde(deserialize_with = "args::opt_string")]
    pub colz: Option<String>,
    #[serde(deserialize_with = "args::or_default")]
    pub plot_type: PlotType,
    pub subset_ids: Option<Vec<u32>>,
    /// Open polygons in data coordinates; each is closed before testing.
    pub polygons: Vec<Vec<[f64; 2]>>,
    /// `[top_xmin, top_xmax, right_ymin, right_ymax]` windows drawn on the
    /// NaN marginals.
    #[serde(rename = "nanSelection")]
    pub nan_selection: Option<Vec<f64>>,
    #[serde(rename = "bothNanSelected", deserialize_with = "args::flag")]
    pub both_nan_selected: bool,
    #[serde(rename = "colorSliderValuesFinal")]
    pub color_slider: Option<Vec<Option<f64>>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Containment {
    Outside,
    Inside,
    OnEdge,
}

/// Ray-casting point-in-polygon test. `polygon` must be closed (first point
/// repeated at the end).
pub fn point_in_polygon(polygon: &[(f64, f64)], (px, py): (f64, f64)) -> Containment {
    if polygon.len() < 2 {
        return Containment::Outside;
    }
    let mut dy2 = py - polygon[0].1;
    let mut crossings = 0u32;

    for w in polygon.windows(2) {
        let (a, b) = (w[0], w[1]);
        let dy = dy2;
        dy2 = py - b.1;

        // Skip edges entirely above, below or right of the point.
        if dy * dy2 <= 0.0 && (px >= a.0 || px >= b.0) {
            if dy < 0.0 || dy2 < 0.0 {
                let f = dy * (b.0 - a.0) / (dy - dy2) + a.0;
                if px > f {
                    crossings += 1;
                } else if px == f {
                    return Containment::OnEdge;
                }
            } else if dy2 == 0.0
                && (px == b.0 || (dy == 0.0 && (px - a.0) * (px - b.0) <= 0.0))
            {
                // Upper vertex or horizontal edge through the point.
                return Containment::OnEdge;
            }
        }
    }

    if crossings % 2 == 1 {
        Containment::Inside
    } else {
        Containment::Outside
    }
}

fn input_null() -> PlotError {
    PlotError::invalid_request("Input data null.")
}

/// Rows picked by the request, restricted to the union of its subsets.
pub fn select_mask(ds: &Dataset, store: &SubsetStore, req: &SelectRequest) -> Result<Mask> {
    let subset_ids = req.subset_ids.as_ref().ok_or_else(input_null)?;
    let coly = req.coly.as_deref().ok_or_else(input_null)?;
    let rank = req.plot_type == PlotType::Rank;
    if !rank && req.colx.is_none() {
        return Err(input_null());
    }
    store.check_all(subset_ids)?;

    let y = ds.numeric(coly)?;
    let x: Cow<[f64]> = match (&req.colx, rank) {
        (_, true) => Cow::Owned(rank_descending(y)),
        (Some(colx), false) => Cow::Borrowed(ds.numeric(colx)?),
        (None, false) => return Err(input_null()),
    };
    let rows = ds.row_count();

    let slider = match (&req.colz, req.color_slider.as_deref()) {
        (Some(colz), Some([Some(a), Some(b)])) => Some((colz.as_str(), a.min(*b), a.max(*b))),
        _ => None,
    };

    let mut picked = if req.polygons.is_empty() {
        if slider.is_none() {
            return Err(PlotError::invalid_request(
                "No polygons and no 3rd variable data.",
            ));
        }
        Mask::full(rows)
    } else {
        let closed: Vec<Vec<(f64, f64)>> = req
            .polygons
            .iter()
            .filter(|p| !p.is_empty())
            .map(|p| {
                let mut poly: Vec<(f64, f64)> = p.iter().map(|&[a, b]| (a, b)).collect();
                poly.push(poly[0]);
                poly
            })
            .collect();

        let mut m = Mask::from_fn(rows, |r| {
            closed
                .iter()
                .any(|poly| point_in_polygon(poly, (x[r], y[r])) != Containment::Outside)
        });

        if let Some(sel) = &req.nan_selection {
            let &[top_min, top_max, right_min, right_max] = sel.as_slice() else {
                return Err(PlotError::invalid_request(
                    "nanSelection must have four values.",
                ));
            };
            m.or_assign(&Mask::from_fn(rows, |r| {
                let (xf, yf) = (x[r].is_finite(), y[r].is_finite());
                (xf && !yf && x[r] > top_min && x[r] < top_max)
                    || (yf && !xf && y[r] > right_min && y[r] < right_max)
            }));
        }
        if req.both_nan_selected {
            m.or_assign(&Mask::from_fn(rows, |r| {
                !x[r].is_finite() && !y[r].is_finite()
            }));
        }
        m
    };

    if let Some((colz, lo, hi)) = slider {
        let z = ds.numeric(colz)?;
        picked.and_assign(&Mask::from_fn(rows, |r| z[r] >= lo && z[r] <= hi));
    }

    picked.and_assign(&store.union(subset_ids)?);
    Ok(picked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Column;
    use std::collections::BTreeMap;

    fn square() -> Vec<(f64, f64)> {
        vec![(0.0, 0.0), (2.0, 0.0), (2.0, 2.0), (0.0, 2.0), (0.0, 0.0)]
    }

    #[test]
    fn ray_casting_classifies_points() {
        let sq = square();
        assert_eq!(point_in_polygon(&sq, (1.0, 1.0)), Containment::Inside);
        assert_eq!(point_in_polygon(&sq, (3.0, 1.0)), Containment::Outside);
        assert_eq!(point_in_polygon(&sq, (2.0, 1.0)), Containment::OnEdge);
        assert_eq!(point_in_polygon(&sq, (1.0, 2.0)), Containment::OnEdge);
        assert_eq!(point_in_polygon(&sq, (f64::NAN, 1.0)), Containment::Outside);
    }

    fn dataset() -> Dataset {
        Dataset::from_columns(vec![
            ("x".into(), Column::numeric(vec![1.0, 5.0, 1.0, f64::NAN, f64::NAN, 2.0])),
            ("y".into(), Column::numeric(vec![1.0, 5.0, f64::NAN, 1.5, f64::NAN, 2.0])),
            ("c".into(), Column::numeric(vec![0.0, 1.0, 2.0, 3.0, 4.0, 10.0])),
        ])
        .unwrap()
    }

    fn request() -> SelectRequest {
        SelectRequest {
            colx: Some("x".into()),
            coly: Some("y".into()),
            subset_ids: Some(vec![0]),
            polygons: vec![vec![[0.0, 0.0], [2.0, 0.0], [2.0, 2.0], [0.0, 2.0]]],
            ..Default::default()
        }
    }

    #[test]
    fn polygon_nan_windows_and_slider_compose() {
        let ds = dataset();
        let store = SubsetStore::new("s", ds.row_count(), BTreeMap::new());

        let m = select_mask(&ds, &store, &request()).unwrap();
        assert_eq!(m.iter_ones().collect::<Vec<_>>(), vec![0, 5]);

        let mut req = request();
        req.nan_selection = Some(vec![0.5, 1.5, 1.0, 2.0]);
        req.both_nan_selected = true;
        let m = select_mask(&ds, &store, &req).unwrap();
        assert_eq!(m.iter_ones().collect::<Vec<_>>(), vec![0, 2, 3, 4, 5]);

        req.colz = Some("c".into());
        req.color_slider = Some(vec![Some(3.0), Some(0.0)]);
        let m = select_mask(&ds, &store, &req).unwrap();
        assert_eq!(m.iter_ones().collect::<Vec<_>>(), vec![0, 2, 3]);
    }

    #[test]
    fn slider_alone_needs_a_color_column() {
        let ds = dataset();
        let store = SubsetStore::new("s", ds.row_count(), BTreeMap::new());
        let mut req = request();
        req.polygons.clear();
        assert!(select_mask(&ds, &store, &req).is_err());

        req.colz = Some("c".into());
        req.color_slider = Some(vec![Some(1.0), Some(4.0)]);
        let m = select_mask(&ds, &store, &req).unwrap();
        assert_eq!(m.iter_ones().collect::<Vec<_>>(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn selection_is_limited_to_subsets() {
        let ds = dataset();
        let mut store = SubsetStore::new("s", ds.row_count(), BTreeMap::new());
        let (id, _) = store.create(Mask::from_fn(6, |r| r >= 3)).unwrap();
        let mut req = request();
        req.subset_ids = Some(vec![id]);
        let m = select_mask(&ds, &store, &req).unwrap();
        assert_eq!(m.iter_ones().collect::<Vec<_>>(), vec![5]);

        req.subset_ids = Some(vec![id, 99]);
        assert!(matches!(
            select_mask(&ds, &store, &req),
            Err(PlotError::UnknownSubset(99))
        ));
    }

    #[test]
    fn rank_selection_uses_rank_as_x() {
        let ds = dataset();
        let store = SubsetStore::new("s", ds.row_count(), BTreeMap::new());
        let req = SelectRequest {
            coly: Some("c".into()),
            plot_type: PlotType::Rank,
            subset_ids: Some(vec![0]),
            // Ranks 1 and 2 belong to c=10 and c=4.
            polygons: vec![vec![[0.5, 3.0], [2.5, 3.0], [2.5, 11.0], [0.5, 11.0]]],
            ..Default::default()
        };
        let m = select_mask(&ds, &store, &req).unwrap();
        assert_eq!(m.iter_ones().collect::<Vec<_>>(), vec![4, 5]);
    }
}
