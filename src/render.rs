//! Plot construction.
//!
//! Every plot request resolves to one of three shapes: a scatter (optionally
//! with NaN marginal histograms), a per-subset histogram, or a rank plot.
//! Scatter traces switch to an aggregated density grid once a subset holds
//! more rows than [`RenderOptions::heatmap_threshold`]. Output is a
//! plotly-shaped figure plus a metadata object the client uses for axis
//! ranges and hover support.

use crate::aggregate::{self, AxisScale, CanvasAxis, LOG_FLOOR};
use crate::args;
use crate::dataset::{Column, Dataset};
use crate::error::{PlotError, Result};
use crate::format::{hover_value, truncate_middle};
use crate::histogram::{self, Histogram, Marginal};
use crate::subset::{ALL_ROWS, Mask, SubsetInfo, SubsetStore};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;

/// Available plot types
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlotType {
    /// Points at (x, y), optionally coloured by a third column
    #[default]
    Scatter,

    /// One bar histogram of x per subset on shared bin edges
    Histogram,

    /// y against its descending rank
    Rank,
}

/// How rows with a missing coordinate are shown
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NanMode {
    /// Scatter only
    Hide,
    /// Always add the marginal NaN histograms
    Show,
    /// Add the marginals when too few rows are finite in both axes
    #[default]
    Auto,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistType {
    #[default]
    Count,
    Proportion,
}

/// Histogram bin request: a fixed count or `"auto"`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Bins {
    Count(usize),
    #[default]
    Auto,
}

impl<'de> Deserialize<'de> for Bins {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let v = Value::deserialize(d)?;
        Ok(match v {
            Value::Number(n) => n.as_u64().map_or(Bins::Auto, |n| Bins::Count(n as usize)),
            Value::String(s) => s.trim().parse::<usize>().map_or(Bins::Auto, Bins::Count),
            _ => Bins::Auto,
        })
    }
}

/// Thresholds that steer how much data a plot ships to the client
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderOptions {
    /// Subsets with more rows than this are drawn as a density grid
    pub heatmap_threshold: usize,

    /// Density grid resolution
    pub canvas_width: usize,
    pub canvas_height: usize,

    /// Exact scatters below this size carry hover text
    pub hover_point_limit: usize,

    /// Fraction of fully finite rows under which `auto` shows NaN marginals
    pub nan_valid_cutoff: f64,

    /// The visible-area filter only applies to datasets at least this long
    pub bbox_min_rows: usize,

    /// Upper bound on automatically chosen histogram bins
    pub max_auto_bins: usize,

    /// Largest bin count a client may ask for
    pub max_bins: usize,

    /// Column names in hover labels are cut to this width
    pub hover_col_width: usize,

    /// Text values in hover labels are cut to this width
    pub hover_value_width: usize,
}

impl Default for RenderOptions {
    /// Creates the default thresholds
    ///
    /// # Returns
    /// * `RenderOptions` - 100 000 row density threshold on a 200x200 canvas,
    ///   hover text below 20 000 points, NaN marginals under 90% valid rows
    fn default() -> Self {
        Self {
            heatmap_threshold: 100_000,
            canvas_width: 200,
            canvas_height: 200,
            hover_point_limit: 20_000,
            nan_valid_cutoff: 0.90,
            bbox_min_rows: 100_000,
            max_auto_bins: 200,
            max_bins: 10_000,
            hover_col_width: 45,
            hover_value_width: 50,
        }
    }
}

/// A plot request as sent by the client.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct PlotRequest {
    #[serde(deserialize_with = "args::opt_string")]
    pub x: Option<String>,
    #[serde(deserialize_with = "args::opt_string")]
    pub y: Option<String>,
    #[serde(deserialize_with = "args::opt_string")]
    pub z: Option<String>,
    #[serde(deserialize_with = "args::flag")]
    pub xlog: bool,
    #[serde(deserialize_with = "args::flag")]
    pub ylog: bool,
    pub subsets: Option<Vec<u32>>,
    #[serde(deserialize_with = "args::opt_f64")]
    pub xmin: Option<f64>,
    #[serde(deserialize_with = "args::opt_f64")]
    pub xmax: Option<f64>,
    #[serde(deserialize_with = "args::opt_f64")]
    pub ymin: Option<f64>,
    #[serde(deserialize_with = "args::opt_f64")]
    pub ymax: Option<f64>,
    #[serde(deserialize_with = "args::opt_f64")]
    pub xmargin: Option<f64>,
    #[serde(deserialize_with = "args::opt_f64")]
    pub ymargin: Option<f64>,
    #[serde(deserialize_with = "args::or_default")]
    pub hist_type: HistType,
    #[serde(deserialize_with = "args::or_default")]
    pub nans_request: NanMode,
    pub hoverlist: Vec<String>,
    #[serde(deserialize_with = "args::or_default")]
    pub plot_type: PlotType,
    pub nbins: Bins,
    /// Identifies the plot panel; a newer queued request with the same key
    /// preempts this one.
    pub key: Option<Value>,
}

/// Finite-aware min/max of one axis.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Extent {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl Extent {
    pub fn new(min: f64, max: f64) -> Self {
        Extent {
            min: Some(min).filter(|v| v.is_finite()),
            max: Some(max).filter(|v| v.is_finite()),
        }
    }

    /// Extent of the finite values; empty when there are none.
    pub fn of(values: impl IntoIterator<Item = f64>) -> Self {
        let mut out = Extent::default();
        for v in values.into_iter().filter(|v| v.is_finite()) {
            out.min = Some(out.min.map_or(v, |m| m.min(v)));
            out.max = Some(out.max.map_or(v, |m| m.max(v)));
        }
        out
    }

    /// Cover both extents; a side with no finite value contributes nothing.
    pub fn merge(self, other: Extent) -> Extent {
        Extent {
            min: min_finite(self.min, other.min),
            max: max_finite(self.max, other.max),
        }
    }

    pub fn range(&self) -> Option<(f64, f64)> {
        Some((self.min?, self.max?))
    }
}

fn min_finite(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

fn max_finite(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

/// Axis extents reported back to the client. `c` is present for scatter and
/// rank plots.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MinMax {
    pub x: Extent,
    pub y: Extent,
    pub c: Option<Extent>,
}

impl MinMax {
    pub fn merge(self, other: MinMax) -> MinMax {
        MinMax {
            x: self.x.merge(other.x),
            y: self.y.merge(other.y),
            c: match (self.c, other.c) {
                (Some(a), Some(b)) => Some(a.merge(b)),
                (a, b) => a.or(b),
            },
        }
    }
}

impl Serialize for MinMax {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        let mut m = Map::new();
        m.insert("xmin".into(), json!(self.x.min));
        m.insert("xmax".into(), json!(self.x.max));
        m.insert("ymin".into(), json!(self.y.min));
        m.insert("ymax".into(), json!(self.y.max));
        if let Some(c) = self.c {
            m.insert("cmin".into(), json!(c.min));
            m.insert("cmax".into(), json!(c.max));
        }
        m.serialize(s)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct ValidRanges {
    pub xmin: Option<f64>,
    pub xmax: Option<f64>,
    pub ymin: Option<f64>,
    pub ymax: Option<f64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct PlotMetadata {
    #[serde(rename = "validRanges")]
    pub valid_ranges: ValidRanges,
    pub plot_supports_hovering: bool,
    pub subsets: BTreeMap<u32, SubsetInfo>,
    pub plot_type: PlotType,
    pub is_heatmap: bool,
    pub both_nan: usize,
    pub num_nan: usize,
    pub hoverbox_longest_col_name_len: usize,
    pub minmax: MinMax,
}

#[derive(Debug)]
pub struct Plot {
    pub figure: Value,
    pub metadata: PlotMetadata,
}

impl Plot {
    /// `[figure, metadata]`, the shape the client expects.
    pub fn to_json(&self) -> Value {
        json!([self.figure, self.metadata])
    }
}

/// Which panel of the figure a trace belongs to. The NaN view is a 2x2 grid:
/// top marginal, main scatter, right marginal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Panel {
    Single,
    Top,
    Main,
    Right,
}

impl Panel {
    fn axes(self) -> (&'static str, &'static str) {
        match self {
            Panel::Single | Panel::Top => ("x", "y"),
            Panel::Main => ("x3", "y3"),
            Panel::Right => ("x4", "y4"),
        }
    }
}

/// Minimal plotly figure builder.
struct Figure {
    data: Vec<Value>,
    layout: Map<String, Value>,
    shapes: Vec<Value>,
}

impl Figure {
    fn new() -> Self {
        let mut layout = Map::new();
        layout.insert("hovermode".into(), json!(false));
        Figure {
            data: Vec::new(),
            layout,
            shapes: Vec::new(),
        }
    }

    fn add_trace(&mut self, mut trace: Value, panel: Panel) {
        if matches!(panel, Panel::Main | Panel::Right) {
            let (x, y) = panel.axes();
            trace["xaxis"] = json!(x);
            trace["yaxis"] = json!(y);
        }
        self.data.push(trace);
    }

    fn add_shape(&mut self, mut shape: Value, panel: Panel) {
        let (x, y) = panel.axes();
        shape["xref"] = json!(x);
        shape["yref"] = json!(y);
        self.shapes.push(shape);
    }

    fn set(&mut self, key: &str, value: Value) {
        self.layout.insert(key.to_string(), value);
    }

    /// Merge `props` into the layout entry `axis` (e.g. `"xaxis3"`).
    fn axis(&mut self, axis: &str, props: Value) {
        let entry = self
            .layout
            .entry(axis.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let (Value::Object(dst), Value::Object(src)) = (entry, props) {
            dst.extend(src);
        }
    }

    fn axis_names(&self) -> Vec<String> {
        self.layout
            .keys()
            .filter(|k| k.starts_with("xaxis") || k.starts_with("yaxis"))
            .cloned()
            .collect()
    }

    fn into_json(mut self) -> Value {
        if !self.shapes.is_empty() {
            self.layout.insert("shapes".into(), Value::Array(self.shapes));
        }
        json!({ "data": self.data, "layout": self.layout })
    }
}

/// Visible rectangle, already widened by the request margins.
#[derive(Clone, Copy, Debug)]
struct Bbox {
    xmin: f64,
    xmax: f64,
    ymin: f64,
    ymax: f64,
}

impl Bbox {
    fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.xmin && x <= self.xmax && y >= self.ymin && y <= self.ymax
    }

    /// Grey rectangles over everything outside the loaded region.
    fn shade(&self, fig: &mut Figure, panel: Panel) {
        let huge = 1e4f64.max((self.xmax - self.xmin).max(self.ymax - self.ymin));
        let rects = [
            ("left", self.xmin - huge, self.ymin - huge, self.xmin, huge),
            ("top", self.xmin - huge, self.ymax, self.xmax + huge, self.ymax + huge),
            ("right", self.xmax, self.ymin - huge, self.xmax + huge, self.ymax + huge),
            ("bottom", self.xmin - huge, self.ymin - huge, self.xmax + huge, self.ymin),
        ];
        for (side, x0, y0, x1, y1) in rects {
            fig.add_shape(
                json!({
                    "type": "rect",
                    "x0": x0, "y0": y0, "x1": x1, "y1": y1,
                    "fillcolor": "#cccccc",
                    "line": {"color": "rgba(0,0,0,0)"},
                    "name": format!("data-not-loaded-{}", side),
                }),
                panel,
            );
        }
    }
}

/// Columns feeding a scatter.
struct Points<'a> {
    x: &'a [f64],
    y: &'a [f64],
    z: Option<&'a [f64]>,
    hover: Vec<(&'a str, &'a Column)>,
}

#[derive(Default)]
struct ScatterOutcome {
    minmax: Option<MinMax>,
    num_nan: usize,
    is_heatmap: bool,
    supports_hover: bool,
    longest_name: usize,
}

/// Build a plot for `req` over the dataset.
pub fn render(
    ds: &Dataset,
    store: &SubsetStore,
    opts: &RenderOptions,
    req: &PlotRequest,
) -> Result<Plot> {
    let subset_ids = req.subsets.clone().unwrap_or_else(|| vec![ALL_ROWS]);
    store.check_all(&subset_ids)?;
    let masks: Vec<&Mask> = subset_ids
        .iter()
        .map(|id| store.mask(*id))
        .collect::<Result<_>>()?;

    let mut hover = Vec::with_capacity(req.hoverlist.len());
    for name in &req.hoverlist {
        hover.push((name.as_str(), ds.column(name)?));
    }
    let z = match &req.z {
        Some(z) => Some(ds.numeric(z)?),
        None => None,
    };

    let bbox = match (req.xmin, req.xmax, req.ymin, req.ymax) {
        (Some(xmin), Some(xmax), Some(ymin), Some(ymax)) => {
            let xm = req.xmargin.unwrap_or(0.0);
            let ym = req.ymargin.unwrap_or(0.0);
            Some(Bbox {
                xmin: xmin - xm,
                xmax: xmax + xm,
                ymin: ymin - ym,
                ymax: ymax + ym,
            })
        }
        _ => None,
    };
    let cull = bbox.filter(|_| ds.row_count() >= opts.bbox_min_rows);

    let mut fig = Figure::new();
    let mut outcome = ScatterOutcome::default();
    let mut both_nan = 0;
    let mut showing_nans = false;
    let mut plot_type = req.plot_type;
    let x_title: String;
    let y_title: String;

    match (req.plot_type, &req.x, &req.y) {
        (PlotType::Histogram, Some(x), _) => {
            if let Bins::Count(n) = req.nbins {
                if n == 0 || n > opts.max_bins {
                    return Err(PlotError::invalid_request(format!(
                        "nbins must be between 1 and {}.",
                        opts.max_bins
                    )));
                }
            }
            let values = ds.numeric(x)?;
            outcome.minmax =
                histogram_plot(&mut fig, values, &masks, req.nbins, req.hist_type, opts);
            x_title = x.clone();
            y_title = match req.hist_type {
                HistType::Count => "Count".to_string(),
                HistType::Proportion => "Proportion".to_string(),
            };
        }
        (PlotType::Rank, _, Some(y)) => {
            let yv = ds.numeric(y)?;
            let rank = rank_descending(yv);
            let pts = Points {
                x: &rank,
                y: yv,
                z,
                hover,
            };
            outcome = scatter(&mut fig, Panel::Single, &pts, &masks, cull, req, opts);
            x_title = "Rank".to_string();
            y_title = y.clone();
        }
        (_, Some(x), Some(y)) => {
            plot_type = PlotType::Scatter;
            let xv = ds.numeric(x)?;
            let yv = ds.numeric(y)?;
            let pts = Points { x: xv, y: yv, z, hover };

            let show_nans = match req.nans_request {
                NanMode::Hide => false,
                NanMode::Show => true,
                NanMode::Auto => min_valid_fraction(xv, yv, &masks) <= opts.nan_valid_cutoff,
            };
            if show_nans {
                let (o, both) = scatter_with_nans(&mut fig, &pts, &masks, cull, req, opts, x, y);
                outcome = o;
                both_nan = both;
                showing_nans = true;
                fig.set("bargap", json!(0.0));
            } else {
                outcome = scatter(&mut fig, Panel::Single, &pts, &masks, cull, req, opts);
            }
            x_title = x.clone();
            y_title = y.clone();
        }
        (_, x, y) => {
            fig.add_trace(
                json!({"type": "scattergl", "x": [], "y": [], "mode": "markers"}),
                Panel::Single,
            );
            x_title = x.clone().unwrap_or_else(|| "Drop a variable".to_string());
            y_title = y.clone().unwrap_or_else(|| "Drop a variable".to_string());
            outcome.minmax = Some(MinMax {
                x: Extent::new(-1.0, 5.0),
                y: Extent::new(-1.0, 5.0),
                c: None,
            });
        }
    }

    fig.set("dragmode", json!("pan"));
    fig.set("font", json!({"size": 16}));
    if !showing_nans {
        let mut yaxis = json!({
            "title": {"text": y_title},
            "type": "linear",
            "autorange": false,
            "automargin": false,
        });
        if plot_type != PlotType::Histogram {
            yaxis["scaleanchor"] = json!("x");
            yaxis["scaleratio"] = json!(1);
        }
        fig.axis("yaxis", yaxis);
        fig.axis(
            "xaxis",
            json!({
                "title": {"text": x_title},
                "type": "linear",
                "autorange": false,
                "automargin": false,
            }),
        );
    }

    let valid_ranges = match bbox {
        Some(b) => ValidRanges {
            xmin: Some(b.xmin),
            xmax: Some(b.xmax),
            ymin: Some(b.ymin),
            ymax: Some(b.ymax),
        },
        None => ValidRanges::default(),
    };
    let mut subsets = BTreeMap::new();
    for id in &subset_ids {
        subsets.insert(*id, store.export(*id)?);
    }

    let metadata = PlotMetadata {
        valid_ranges,
        plot_supports_hovering: outcome.supports_hover,
        subsets,
        plot_type,
        is_heatmap: outcome.is_heatmap,
        both_nan,
        num_nan: outcome.num_nan,
        hoverbox_longest_col_name_len: outcome.longest_name,
        minmax: outcome.minmax.unwrap_or_default(),
    };
    debug!(
        "Plot {:?}: heatmap={} num_nan={} both_nan={}",
        plot_type, metadata.is_heatmap, metadata.num_nan, metadata.both_nan
    );
    Ok(Plot {
        figure: fig.into_json(),
        metadata,
    })
}

/// Smallest per-subset fraction of rows finite in both axes. Empty subsets
/// are ignored.
fn min_valid_fraction(x: &[f64], y: &[f64], masks: &[&Mask]) -> f64 {
    let mut min = 1.0f64;
    for mask in masks {
        let total = mask.count();
        if total == 0 {
            continue;
        }
        let valid = mask
            .iter_ones()
            .filter(|&r| x[r].is_finite() && y[r].is_finite())
            .count();
        min = min.min(valid as f64 / total as f64);
    }
    min
}

/// 1-based descending rank of each value; ties keep row order and NaN stays
/// unranked.
pub fn rank_descending(values: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..values.len()).filter(|&i| !values[i].is_nan()).collect();
    order.sort_by(|&a, &b| values[b].total_cmp(&values[a]));
    let mut rank = vec![f64::NAN; values.len()];
    for (r, i) in order.into_iter().enumerate() {
        rank[i] = (r + 1) as f64;
    }
    rank
}

fn scatter(
    fig: &mut Figure,
    panel: Panel,
    pts: &Points,
    masks: &[&Mask],
    cull: Option<Bbox>,
    req: &PlotRequest,
    opts: &RenderOptions,
) -> ScatterOutcome {
    let mut out = ScatterOutcome::default();
    let finite = |r: usize| {
        pts.x[r].is_finite()
            && pts.y[r].is_finite()
            && pts.z.is_none_or(|z| z[r].is_finite())
    };

    if let Some(b) = cull {
        b.shade(fig, panel);
    }

    for mask in masks {
        let all: Vec<usize> = mask.iter_ones().collect();
        out.num_nan += all.iter().filter(|&&r| !finite(r)).count();

        let rows: Vec<usize> = match cull {
            Some(b) => all
                .into_iter()
                .filter(|&r| b.contains(pts.x[r], pts.y[r]))
                .collect(),
            None => all,
        };

        let minmax = if rows.len() > opts.heatmap_threshold {
            out.is_heatmap = true;
            density_trace(fig, panel, pts, &rows, &finite, req, opts)
        } else {
            if rows.len() < opts.hover_point_limit {
                out.supports_hover = true;
            }
            let (mm, longest) = marker_trace(fig, panel, pts, &rows, opts);
            out.longest_name = out.longest_name.max(longest);
            mm
        };
        out.minmax = Some(match out.minmax {
            Some(prev) => prev.merge(minmax),
            None => minmax,
        });
    }
    out
}

fn density_trace(
    fig: &mut Figure,
    panel: Panel,
    pts: &Points,
    rows: &[usize],
    finite: &dyn Fn(usize) -> bool,
    req: &PlotRequest,
    opts: &RenderOptions,
) -> MinMax {
    // A log canvas needs explicit, strictly positive bounds.
    let (x_range, y_range) = if req.xlog || req.ylog {
        let clamp = |e: Extent, log: bool| {
            e.range()
                .map(|(lo, hi)| if log { (lo.max(LOG_FLOOR), hi.max(LOG_FLOOR)) } else { (lo, hi) })
        };
        (
            clamp(Extent::of(rows.iter().map(|&r| pts.x[r])), req.xlog),
            clamp(Extent::of(rows.iter().map(|&r| pts.y[r])), req.ylog),
        )
    } else {
        (None, None)
    };
    let scale = |log: bool| if log { AxisScale::Log } else { AxisScale::Linear };

    let agg_rows: Vec<usize> = rows.iter().copied().filter(|&r| finite(r)).collect();
    let grid = aggregate::aggregate(
        pts.x,
        pts.y,
        pts.z,
        &agg_rows,
        CanvasAxis {
            bins: opts.canvas_width,
            scale: scale(req.xlog),
            range: x_range,
        },
        CanvasAxis {
            bins: opts.canvas_height,
            scale: scale(req.ylog),
            range: y_range,
        },
    );

    // Colour limits come from the raw values so the legend spans the data,
    // not the per-cell means.
    let c = pts
        .z
        .map(|z| Extent::of(rows.iter().map(|&r| z[r])))
        .unwrap_or_default();

    let minmax = MinMax {
        x: Extent::of(grid.xs.iter().copied()),
        y: Extent::of(grid.ys.iter().copied()),
        c: Some(c),
    };
    fig.add_trace(
        json!({
            "type": "heatmap",
            "z": grid.cells,
            "x": grid.xs,
            "y": grid.ys,
            "connectgaps": false,
            "showscale": true,
            "hoverinfo": "skip",
            "hovertemplate": null,
        }),
        panel,
    );
    minmax
}

/// Exact markers. Returns the extents and the padded hover-name width.
fn marker_trace(
    fig: &mut Figure,
    panel: Panel,
    pts: &Points,
    rows: &[usize],
    opts: &RenderOptions,
) -> (MinMax, usize) {
    let xs: Vec<f64> = rows.iter().map(|&r| pts.x[r]).collect();
    let ys: Vec<f64> = rows.iter().map(|&r| pts.y[r]).collect();

    let mut marker = json!({"size": 3});
    let mut c = Extent::default();
    if let Some(z) = pts.z {
        let zs: Vec<f64> = rows.iter().map(|&r| z[r]).collect();
        c = Extent::of(zs.iter().copied());
        marker = json!({"size": 3, "color": zs, "colorscale": "Viridis"});
    }

    let mut trace = json!({
        "type": "scattergl",
        "x": xs,
        "y": ys,
        "mode": "markers",
        "marker": marker,
        "showlegend": false,
    });

    let mut longest = 0;
    if rows.len() >= opts.hover_point_limit || pts.hover.is_empty() {
        trace["hoverinfo"] = json!("skip");
    } else {
        let names: Vec<String> = pts
            .hover
            .iter()
            .map(|(name, _)| truncate_middle(name, opts.hover_col_width))
            .collect();
        longest = names.iter().map(|n| n.chars().count()).max().unwrap_or(0);

        // The "Subset:" line is filled in by the client.
        let mut template = String::from("<b>Subset:</b><br>");
        for (i, name) in names.iter().enumerate() {
            template.push_str(&format!(
                "<b>{:<width$}</b>: %{{customdata[{}]}}<br>",
                name,
                i,
                width = longest
            ));
        }
        template.push_str("<extra></extra>");

        let customdata: Vec<Vec<String>> = rows
            .iter()
            .map(|&r| {
                pts.hover
                    .iter()
                    .map(|(_, col)| hover_value(col, r, opts.hover_value_width))
                    .collect()
            })
            .collect();

        trace["hoverinfo"] = json!("text");
        trace["customdata"] = json!(customdata);
        trace["hovertemplate"] = json!(template);
        fig.set(
            "hoverlabel",
            json!({"bgcolor": "white", "font": {"size": 14, "family": "monospace"}}),
        );
        fig.set("hovermode", json!("closest"));
    }
    fig.add_trace(trace, panel);

    let minmax = MinMax {
        x: Extent::of(xs.iter().copied()),
        y: Extent::of(ys.iter().copied()),
        c: Some(c),
    };
    (minmax, longest)
}

const NAN_COLOR: &str = "#C44E52";
const DATA_COLOR: &str = "#808080";

/// Scatter in the main panel plus NaN marginal histograms on the top (x)
/// and right (y). Returns the scatter outcome and the count of rows missing
/// both coordinates.
#[allow(clippy::too_many_arguments)]
fn scatter_with_nans(
    fig: &mut Figure,
    pts: &Points,
    masks: &[&Mask],
    cull: Option<Bbox>,
    req: &PlotRequest,
    opts: &RenderOptions,
    x_name: &str,
    y_name: &str,
) -> (ScatterOutcome, usize) {
    subplot_grid(fig);
    let outcome = scatter(fig, Panel::Main, pts, masks, cull, req, opts);

    let mut union = match masks.first() {
        Some(m) => Mask::empty(m.len()),
        None => Mask::empty(pts.x.len()),
    };
    for m in masks {
        union.or_assign(m);
    }

    let mut top = Marginal::default();
    let mut right = Marginal::default();
    let mut both_nan = 0;
    for r in union.iter_ones() {
        let (x, y) = (pts.x[r], pts.y[r]);
        match (x.is_finite(), y.is_finite()) {
            (true, true) => {
                top.valid.push(x);
                right.valid.push(y);
            }
            (true, false) => {
                top.valid.push(x);
                top.lost.push(x);
            }
            (false, true) => {
                right.valid.push(y);
                right.lost.push(y);
            }
            (false, false) => both_nan += 1,
        }
    }

    let (bins, peak) = histogram::shared_marginal_bins(&top, &right, opts.max_auto_bins);
    let peak = peak * 1.1;
    debug!("NaN marginals: {} bins, peak {}", bins, peak);

    for (marginal, panel) in [(&top, Panel::Top), (&right, Panel::Right)] {
        let Some(range) = marginal.range() else {
            continue;
        };
        let finite = marginal.valid.len() as f64;
        let lost = histogram::histogram(&marginal.lost, bins, range);
        fig.add_trace(nan_bars(&lost, finite, panel), panel);
        let valid = histogram::histogram(&marginal.valid, bins, range);
        fig.add_trace(valid_steps(&valid, finite, panel), panel);
    }

    for axis in fig.axis_names() {
        fig.axis(
            &axis,
            json!({"type": "linear", "autorange": false, "automargin": false}),
        );
    }
    for axis in ["xaxis", "xaxis2", "xaxis4", "yaxis", "yaxis2", "yaxis4"] {
        fig.axis(axis, json!({"title": {"text": ""}}));
    }
    fig.axis("xaxis3", json!({"title": {"text": x_name}}));
    fig.axis("yaxis3", json!({"title": {"text": y_name}, "scaleanchor": "x3"}));
    fig.axis("yaxis", json!({"range": [-0.0005, peak], "tickformat": ",.0%"}));
    fig.axis("xaxis4", json!({"range": [-0.0005, peak], "tickformat": ",.0%"}));

    (outcome, both_nan)
}

/// 2x2 grid: 85/15 column widths, 15/85 row heights, shared axes along the
/// main scatter.
fn subplot_grid(fig: &mut Figure) {
    let spacing = 0.025;
    let wide = (1.0 - spacing) * 0.85;
    let narrow_start = wide + spacing;

    let left = json!([0.0, wide]);
    let right = json!([narrow_start, 1.0]);
    let top = json!([narrow_start, 1.0]);
    let bottom = json!([0.0, wide]);

    fig.axis("xaxis", json!({"anchor": "y", "domain": left, "matches": "x3", "showticklabels": false}));
    fig.axis("yaxis", json!({"anchor": "x", "domain": top}));
    fig.axis("xaxis2", json!({"anchor": "y2", "domain": right, "matches": "x4", "showticklabels": false}));
    fig.axis("yaxis2", json!({"anchor": "x2", "domain": top, "matches": "y", "showticklabels": false}));
    fig.axis("xaxis3", json!({"anchor": "y3", "domain": left}));
    fig.axis("yaxis3", json!({"anchor": "x3", "domain": bottom}));
    fig.axis("xaxis4", json!({"anchor": "y4", "domain": right}));
    fig.axis("yaxis4", json!({"anchor": "x4", "domain": bottom, "matches": "y3", "showticklabels": false}));
}

fn fractions(h: &Histogram, finite: f64) -> Vec<f64> {
    h.counts.iter().map(|c| c / finite).collect()
}

fn nan_bars(h: &Histogram, finite: f64, panel: Panel) -> Value {
    let frac = fractions(h, finite);
    let marker = json!({"line": {"width": 0}, "color": NAN_COLOR});
    if panel == Panel::Right {
        json!({
            "type": "bar",
            "x": frac,
            "y": &h.edges[..h.edges.len() - 1],
            "marker": marker,
            "orientation": "h",
            "showlegend": false,
        })
    } else {
        json!({
            "type": "bar",
            "x": h.edges,
            "y": frac,
            "marker": marker,
            "orientation": "v",
            "showlegend": false,
        })
    }
}

/// Step outline of the finite distribution, closed down to zero at both ends.
fn valid_steps(h: &Histogram, finite: f64, panel: Panel) -> Value {
    let frac = fractions(h, finite);
    let mut heights = Vec::with_capacity(frac.len() + 3);
    heights.push(0.0);
    heights.extend_from_slice(&frac);
    heights.push(frac.last().copied().unwrap_or(0.0));
    heights.push(0.0);

    let first = h.edges[0];
    let last = h.edges[h.edges.len() - 1];
    let mut edges = Vec::with_capacity(h.edges.len() + 2);
    edges.push(first - h.width());
    edges.extend_from_slice(&h.edges);
    edges.push(last);

    let line = json!({"color": DATA_COLOR});
    if panel == Panel::Right {
        json!({
            "type": "scattergl",
            "x": heights,
            "y": edges,
            "line_shape": "vhv",
            "line": line,
            "mode": "lines",
            "showlegend": false,
        })
    } else {
        json!({
            "type": "scattergl",
            "x": edges,
            "y": heights,
            "line_shape": "hvh",
            "line": line,
            "mode": "lines",
            "showlegend": false,
        })
    }
}

/// Bar histograms of `values`, one per subset, on edges spanning every
/// subset's finite range.
fn histogram_plot(
    fig: &mut Figure,
    values: &[f64],
    masks: &[&Mask],
    bins: Bins,
    hist_type: HistType,
    opts: &RenderOptions,
) -> Option<MinMax> {
    let per_subset: Vec<Vec<f64>> = masks
        .iter()
        .map(|m| {
            m.iter_ones()
                .map(|r| values[r])
                .filter(|v| v.is_finite())
                .collect::<Vec<f64>>()
        })
        .filter(|d| !d.is_empty())
        .collect();

    let range = per_subset
        .iter()
        .fold(Extent::default(), |acc, d| acc.merge(Extent::of(d.iter().copied())))
        .range()?;

    let mut all: Option<((f64, f64), (f64, f64))> = None;
    for data in &per_subset {
        let n = match bins {
            Bins::Count(n) => n,
            Bins::Auto => histogram::auto_bin_count(data, range, opts.max_auto_bins),
        };
        let mut h = histogram::histogram(data, n, range);
        if hist_type == HistType::Proportion {
            let total = h.total();
            if total > 0.0 {
                h.counts.iter_mut().for_each(|c| *c /= total);
            }
        }

        let (xr, yr) = histogram::histogram_autorange(&h);
        all = Some(match all {
            None => (xr, yr),
            Some((ax, ay)) => (
                (ax.0.min(xr.0), ax.1.max(xr.1)),
                (ay.0.min(yr.0), ay.1.max(yr.1)),
            ),
        });

        let widths: Vec<f64> = h.edges.windows(2).map(|w| w[1] - w[0] + 0.0001).collect();
        fig.add_trace(
            json!({
                "type": "bar",
                "x": h.edges,
                "y": h.counts,
                "offset": 0,
                "width": widths,
                "marker": {"line": {"width": 0}},
            }),
            Panel::Single,
        );
    }

    let (xr, yr) = all?;
    fig.axis("xaxis", json!({"range": [xr.0, xr.1]}));
    fig.axis("yaxis", json!({"range": [yr.0, yr.1]}));
    fig.set("showlegend", json!(false));
    Some(MinMax {
        x: Extent::new(xr.0, xr.1),
        y: Extent::new(yr.0, yr.1),
        c: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(x: &str, y: &str) -> PlotRequest {
        PlotRequest {
            x: Some(x.to_string()),
            y: Some(y.to_string()),
            ..Default::default()
        }
    }

    fn store_for(ds: &Dataset) -> SubsetStore {
        SubsetStore::new("s", ds.row_count(), BTreeMap::new())
    }

    #[test]
    fn empty_subset_does_not_poison_extents() {
        let a = Extent::of([f64::NAN, f64::INFINITY]);
        let b = Extent::of([1.0, 5.0, 3.0]);
        assert_eq!(a, Extent::default());
        assert_eq!(a.merge(b).range(), Some((1.0, 5.0)));
        assert_eq!(b.merge(a).range(), Some((1.0, 5.0)));
    }

    #[test]
    fn rank_is_descending_with_stable_ties() {
        let r = rank_descending(&[1.0, 3.0, f64::NAN, 3.0]);
        assert_eq!(&r[..2], &[3.0, 1.0]);
        assert!(r[2].is_nan());
        assert_eq!(r[3], 2.0);
    }

    #[test]
    fn threshold_is_inclusive_on_the_exact_side() {
        let n = 50;
        let xs: Vec<f64> = (0..n).map(|i| i as f64).collect();
        let ds = Dataset::from_columns(vec![
            ("x".into(), Column::numeric(xs.clone())),
            ("y".into(), Column::numeric(xs)),
        ])
        .unwrap();
        let mut store = store_for(&ds);
        let (one_more, _) = store.create(Mask::from_fn(n, |i| i <= 10)).unwrap();
        let (exact, _) = store.create(Mask::from_fn(n, |i| i < 10)).unwrap();

        let opts = RenderOptions {
            heatmap_threshold: 10,
            ..Default::default()
        };
        let mut req = request("x", "y");

        req.subsets = Some(vec![exact]);
        let plot = render(&ds, &store, &opts, &req).unwrap();
        assert!(!plot.metadata.is_heatmap);
        assert_eq!(plot.figure["data"][0]["type"], "scattergl");

        req.subsets = Some(vec![one_more]);
        let plot = render(&ds, &store, &opts, &req).unwrap();
        assert!(plot.metadata.is_heatmap);
        assert_eq!(plot.figure["data"][0]["type"], "heatmap");
    }

    #[test]
    fn auto_nan_mode_adds_marginals() {
        let ds = Dataset::from_columns(vec![
            ("x".into(), Column::numeric(vec![1.0, 2.0, f64::NAN, f64::NAN])),
            ("y".into(), Column::numeric(vec![f64::NAN, 4.0, 5.0, f64::NAN])),
        ])
        .unwrap();
        let store = store_for(&ds);
        let plot = render(&ds, &store, &RenderOptions::default(), &request("x", "y")).unwrap();

        assert_eq!(plot.metadata.both_nan, 1);
        assert_eq!(plot.metadata.num_nan, 3);
        assert_eq!(plot.figure["layout"]["xaxis3"]["title"]["text"], "x");
        assert_eq!(plot.figure["layout"]["yaxis"]["tickformat"], ",.0%");
        // Scatter plus two traces per marginal.
        assert_eq!(plot.figure["data"].as_array().unwrap().len(), 5);

        let mut hide = request("x", "y");
        hide.nans_request = NanMode::Hide;
        let plot = render(&ds, &store, &RenderOptions::default(), &hide).unwrap();
        assert_eq!(plot.metadata.both_nan, 0);
        assert!(plot.figure["layout"].get("xaxis3").is_none());
    }

    #[test]
    fn missing_axis_gives_placeholder_plot() {
        let ds = Dataset::from_columns(vec![("x".into(), Column::numeric(vec![1.0]))]).unwrap();
        let store = store_for(&ds);
        let req = PlotRequest {
            x: Some("x".into()),
            ..Default::default()
        };
        let plot = render(&ds, &store, &RenderOptions::default(), &req).unwrap();
        assert_eq!(plot.figure["layout"]["yaxis"]["title"]["text"], "Drop a variable");
        let mm = serde_json::to_value(plot.metadata.minmax).unwrap();
        assert_eq!(mm, json!({"xmin": -1.0, "xmax": 5.0, "ymin": -1.0, "ymax": 5.0}));
    }

    #[test]
    fn hover_template_pads_names() {
        let ds = Dataset::from_columns(vec![
            ("x".into(), Column::numeric(vec![1.0, 2.0])),
            ("y".into(), Column::numeric(vec![3.0, 4.0])),
            ("gene".into(), Column::Text(vec![Some("A".into()), None])),
        ])
        .unwrap();
        let store = store_for(&ds);
        let mut req = request("x", "y");
        req.hoverlist = vec!["gene".into(), "x".into()];
        let plot = render(&ds, &store, &RenderOptions::default(), &req).unwrap();

        let trace = &plot.figure["data"][0];
        assert_eq!(
            trace["hovertemplate"],
            "<b>Subset:</b><br><b>gene</b>: %{customdata[0]}<br><b>x   </b>: %{customdata[1]}<br><extra></extra>"
        );
        assert_eq!(trace["customdata"][0], json!([" A", " 1"]));
        assert!(plot.metadata.plot_supports_hovering);
        assert_eq!(plot.metadata.hoverbox_longest_col_name_len, 4);
    }

    #[test]
    fn histogram_ranges_cover_all_subsets() {
        let ds = Dataset::from_columns(vec![(
            "v".into(),
            Column::numeric(vec![0.0, 1.0, 2.0, 3.0, 4.0, f64::NAN]),
        )])
        .unwrap();
        let store = store_for(&ds);
        let req = PlotRequest {
            x: Some("v".into()),
            plot_type: PlotType::Histogram,
            nbins: Bins::Count(4),
            hist_type: HistType::Proportion,
            ..Default::default()
        };
        let plot = render(&ds, &store, &RenderOptions::default(), &req).unwrap();
        assert_eq!(plot.metadata.plot_type, PlotType::Histogram);
        let counts: Vec<f64> = serde_json::from_value(plot.figure["data"][0]["y"].clone()).unwrap();
        assert!((counts.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert_eq!(plot.figure["layout"]["yaxis"]["title"]["text"], "Proportion");
        assert!(plot.metadata.minmax.c.is_none());
    }

    #[test]
    fn visible_box_culls_large_datasets() {
        let xs: Vec<f64> = (0..20).map(|i| i as f64).collect();
        let ds = Dataset::from_columns(vec![
            ("x".into(), Column::numeric(xs.clone())),
            ("y".into(), Column::numeric(xs)),
        ])
        .unwrap();
        let store = store_for(&ds);
        let mut req = request("x", "y");
        req.xmin = Some(5.0);
        req.xmax = Some(9.0);
        req.ymin = Some(5.0);
        req.ymax = Some(9.0);
        req.xmargin = Some(1.0);
        req.ymargin = Some(1.0);

        let opts = RenderOptions {
            bbox_min_rows: 10,
            ..Default::default()
        };
        let plot = render(&ds, &store, &opts, &req).unwrap();
        let xs: Vec<f64> = serde_json::from_value(plot.figure["data"][0]["x"].clone()).unwrap();
        assert_eq!(xs, vec![4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0]);
        assert_eq!(plot.figure["layout"]["shapes"].as_array().unwrap().len(), 4);
        assert_eq!(plot.metadata.valid_ranges.xmin, Some(4.0));
        assert_eq!(plot.metadata.valid_ranges.ymax, Some(10.0));

        // Below the row gate every point ships and nothing is shaded.
        let opts = RenderOptions {
            bbox_min_rows: 21,
            ..Default::default()
        };
        let plot = render(&ds, &store, &opts, &req).unwrap();
        assert_eq!(plot.figure["data"][0]["x"].as_array().unwrap().len(), 20);
        assert!(plot.figure["layout"].get("shapes").is_none());
    }

    #[test]
    fn log_density_grid_starts_above_zero() {
        let ds = Dataset::from_columns(vec![
            ("x".into(), Column::numeric(vec![-5.0, 0.0, 1.0, 10.0, 100.0])),
            ("y".into(), Column::numeric(vec![1.0, 2.0, 3.0, 4.0, 5.0])),
        ])
        .unwrap();
        let store = store_for(&ds);
        let mut req = request("x", "y");
        req.xlog = true;
        let opts = RenderOptions {
            heatmap_threshold: 2,
            ..Default::default()
        };
        let plot = render(&ds, &store, &opts, &req).unwrap();
        let trace = &plot.figure["data"][0];
        assert_eq!(trace["type"], "heatmap");

        let xs: Vec<f64> = serde_json::from_value(trace["x"].clone()).unwrap();
        assert!(xs.iter().all(|v| v.is_finite() && *v >= LOG_FLOOR));
        // The grid reaches up to the largest positive value.
        assert!(*xs.last().unwrap() > 10.0);
        let (lo, _) = plot.metadata.minmax.x.range().unwrap();
        assert!(lo > 0.0);

        // Only the three positive x values land on the canvas.
        let total: f64 = trace["z"]
            .as_array()
            .unwrap()
            .iter()
            .flat_map(|row| row.as_array().unwrap().iter().filter_map(Value::as_f64))
            .sum();
        assert_eq!(total, 3.0);
    }

    #[test]
    fn oversized_bin_counts_are_rejected() {
        let ds = Dataset::from_columns(vec![("v".into(), Column::numeric(vec![1.0, 2.0, 3.0]))])
            .unwrap();
        let store = store_for(&ds);
        let mut req = PlotRequest {
            x: Some("v".into()),
            plot_type: PlotType::Histogram,
            nbins: Bins::Count(5_000_000),
            ..Default::default()
        };
        let opts = RenderOptions::default();
        let err = render(&ds, &store, &opts, &req).unwrap_err();
        assert_eq!(err.to_string(), "nbins must be between 1 and 10000.");

        req.nbins = Bins::Count(0);
        assert!(render(&ds, &store, &opts, &req).is_err());

        req.nbins = Bins::Count(opts.max_bins);
        let plot = render(&ds, &store, &opts, &req).unwrap();
        assert_eq!(plot.figure["data"][0]["y"].as_array().unwrap().len(), opts.max_bins);
    }

    #[test]
    fn unknown_column_is_an_error() {
        let ds = Dataset::from_columns(vec![("x".into(), Column::numeric(vec![1.0]))]).unwrap();
        let store = store_for(&ds);
        assert!(render(&ds, &store, &RenderOptions::default(), &request("x", "nope")).is_err());
    }
}
