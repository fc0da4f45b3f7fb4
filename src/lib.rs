/*!
# Plotplot

An engine for exploring large tables interactively, built in Rust.

## Overview

Each browser session gets a worker that holds one dataset in memory and
answers plot, selection, filter and math requests against it. The worker
picks per request between drawing exact points and a binned density image,
so a plot stays fast whatever the row count.

## Architecture

### Session Layer
- **dispatch**: Registry of live workers. Forwards calls, reports expired or
  unknown sessions and persists the writes a worker hands back.
- **worker**: One thread per session. Drains its queue, preempts superseded
  plots, catches handler panics and shuts itself down when idle.
- **loader** / **remote**: Read a CSV (optionally fetched from remote storage
  first) on a background thread while publishing progress.

### Data Layer
- **dataset**: Columnar table of numeric and text columns.
- **subset**: Bit-vector row subsets keyed by small ids; subset 0 is every row.
- **expr**: Math variables, a restricted arithmetic grammar over columns.
- **filter**: Glob, exact, edit-distance and bulk text filters.
- **stats**: Pearson, Kendall and Spearman correlation.

### Rendering Layer
- **render**: Scatter, rank and histogram figures with NaN marginals.
- **aggregate** / **histogram**: Density grids, bin selection and ranges.
- **select**: Polygon, NaN-window and colour-range selection.
- **format**: Number and hover-text formatting.

### Persistence Layer
- **persistence**: Write descriptors, the `Store` trait and an in-memory store.
- **saving**: Gzip + bincode encoding of subset masks.
- **downloader**: CSV export and notebook export.

## Worker Functions

`processing_progress`, `cloud_progress`, `get_subsets`, `get_columns`,
`get_non_numeric_columns`, `plot_json`, `select_data`, `delete_subset`,
`do_math`, `download_subset`, `download_file`, `filter`,
`levenshtein_filter`, `bulk_import`, `get_unique_strings`,
`calc_correlation`.
*/

pub mod aggregate;
pub mod args;
pub mod config;
pub mod dataset;
pub mod dispatch;
pub mod downloader;
pub mod error;
pub mod expr;
pub mod filter;
pub mod format;
pub mod histogram;
pub mod loader;
pub mod persistence;
pub mod remote;
pub mod render;
pub mod saving;
pub mod select;
pub mod stats;
pub mod subset;
pub mod worker;

/// Re-export the types most callers need
pub use config::Config;
pub use dataset::{Column, Dataset};
pub use dispatch::Dispatch;
pub use error::{PlotError, Result};
pub use loader::{CsvLoader, DatasetLoader, Progress};
pub use persistence::{DbValue, DbWrite, Effects, MemoryStore, Store};
pub use remote::{DirectoryFetcher, RemoteFetcher, RemoteFile};
pub use subset::{ALL_ROWS, Mask, SubsetStore};
pub use worker::{Body, Request, Response, Seed, Services, Source, WorkerHandle};
