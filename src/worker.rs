//! The per-session worker.
//!
//! One thread owns one dataset. Requests arrive over a channel and run one at
//! a time; loading happens on a second thread that publishes progress until
//! the dataset is ready. Handlers never write to storage: they return
//! [`Effects`] for the caller to persist.

use crate::args;
use crate::config::Config;
use crate::dataset::Dataset;
use crate::downloader::{self, ExportRequest};
use crate::error::{PlotError, Result};
use crate::expr::{self, MathVar};
use crate::filter::{self, FilterSpec, MatchMode};
use crate::loader::{DatasetLoader, Progress};
use crate::persistence::{self, Effects};
use crate::remote::{self, CloudProgress, RemoteFetcher, RemoteFile};
use crate::render::{self, PlotRequest};
use crate::select::{self, SelectRequest};
use crate::stats::{self, Correlations};
use crate::subset::{ALL_ROWS, Mask, SubsetStore};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use std::backtrace::Backtrace;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use uuid::Uuid;

/// Every function name a worker answers.
pub const FUNCTIONS: &[&str] = &[
    "processing_progress",
    "get_subsets",
    "get_columns",
    "get_non_numeric_columns",
    "plot_json",
    "select_data",
    "delete_subset",
    "do_math",
    "download_subset",
    "download_file",
    "filter",
    "get_unique_strings",
    "cloud_progress",
    "calc_correlation",
    "bulk_import",
    "levenshtein_filter",
];

/// A call into the worker.
#[derive(Clone, Debug)]
pub struct Request {
    pub function_name: String,
    pub args: Value,
}

impl Request {
    pub fn new(function_name: &str, args: Value) -> Self {
        Request {
            function_name: function_name.to_string(),
            args,
        }
    }
}

/// Response payload. Only `download_file` answers with raw text.
#[derive(Clone, Debug, PartialEq)]
pub enum Body {
    Json(Value),
    Text(String),
}

impl Body {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Body::Json(v) => Some(v),
            Body::Text(_) => None,
        }
    }

    /// The body as JSON; text becomes a JSON string.
    pub fn into_json(self) -> Value {
        match self {
            Body::Json(v) => v,
            Body::Text(s) => Value::String(s),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Response {
    pub body: Body,
    pub effects: Effects,
}

impl Response {
    pub fn json(value: Value) -> Self {
        Response {
            body: Body::Json(value),
            effects: Effects::None,
        }
    }

    pub fn with_effects(value: Value, effects: Effects) -> Self {
        Response {
            body: Body::Json(value),
            effects,
        }
    }

    pub fn error(err: &PlotError) -> Self {
        Response::json(err.to_json())
    }
}

/// Where a session's data comes from.
#[derive(Clone, Debug)]
pub enum Source {
    Local(PathBuf),
    Remote(RemoteFile),
}

/// State restored from a previous run of the session.
#[derive(Clone, Debug, Default)]
pub struct Seed {
    pub subsets: BTreeMap<u32, Mask>,
    pub math_vars: Vec<MathVar>,
}

/// Collaborators shared by every worker.
#[derive(Clone)]
pub struct Services {
    pub config: Arc<Config>,
    pub loader: Arc<dyn DatasetLoader>,
    pub fetcher: Option<Arc<dyn RemoteFetcher>>,
}

/// Everything a loaded session holds.
struct SessionData {
    ds: Dataset,
    subsets: SubsetStore,
    math_vars: Vec<MathVar>,
}

/// State the load thread publishes and request handlers read.
struct Shared {
    data: Mutex<Option<SessionData>>,
    progress: Mutex<Progress>,
    cloud: Mutex<CloudProgress>,
}

struct Envelope {
    request: Request,
    reply: Sender<Response>,
}

/// Owner's side of a running worker.
pub struct WorkerHandle {
    session_id: String,
    requests: Sender<Envelope>,
    shutdown: Receiver<()>,
    thread: JoinHandle<()>,
}

impl WorkerHandle {
    /// Start a worker thread for `session_id` and begin loading `source`.
    pub fn spawn(session_id: &str, source: Source, seed: Seed, services: Services) -> Result<Self> {
        let (requests, inbox) = unbounded();
        let (shutdown_tx, shutdown) = bounded(1);
        let shared = Arc::new(Shared {
            data: Mutex::new(None),
            progress: Mutex::new(Progress::opening()),
            cloud: Mutex::new(CloudProgress::started(0)),
        });

        spawn_loader(session_id, source, seed, services.clone(), Arc::clone(&shared))?;

        let worker = Worker {
            session_id: session_id.to_string(),
            config: Arc::clone(&services.config),
            shared,
            inbox,
            shutdown: shutdown_tx,
            pending_files: HashMap::new(),
        };
        let thread = thread::Builder::new()
            .name(format!("session-{}", session_id))
            .spawn(move || worker.run())?;

        Ok(WorkerHandle {
            session_id: session_id.to_string(),
            requests,
            shutdown,
            thread,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// `true` once the worker has signalled shutdown or its thread has ended.
    pub fn is_shut_down(&self) -> bool {
        !self.shutdown.is_empty() || self.thread.is_finished()
    }

    /// Queue a request without waiting for the answer.
    pub fn submit(&self, request: Request) -> Result<Receiver<Response>> {
        if self.is_shut_down() {
            return Err(PlotError::SessionExpired);
        }
        let (reply, answer) = bounded(1);
        self.requests
            .send(Envelope { request, reply })
            .map_err(|_| PlotError::SessionExpired)?;
        Ok(answer)
    }

    /// Send a request and block until the worker answers.
    pub fn call(&self, request: Request) -> Result<Response> {
        self.submit(request)?
            .recv()
            .map_err(|_| PlotError::SessionExpired)
    }
}

fn spawn_loader(
    session_id: &str,
    source: Source,
    seed: Seed,
    services: Services,
    shared: Arc<Shared>,
) -> Result<()> {
    let session_id = session_id.to_string();
    thread::Builder::new()
        .name(format!("load-{}", session_id))
        .spawn(move || {
            if let Err(e) = load_session(&session_id, source, seed, &services, &shared) {
                error!("Session {}: load failed: {}", session_id, e);
                *shared.progress.lock() = Progress::failed(e.to_string());
            }
        })?;
    Ok(())
}

fn load_session(
    session_id: &str,
    source: Source,
    seed: Seed,
    services: &Services,
    shared: &Shared,
) -> Result<()> {
    let path = match source {
        Source::Local(path) => path,
        Source::Remote(file) => fetch_remote(&file, services, shared)?,
    };

    let loaded = services
        .loader
        .load(&path, &mut |p| *shared.progress.lock() = p)?;
    let mut ds = loaded.dataset;
    ds.set_col_labels(loaded.col_labels);
    let subsets = SubsetStore::new(session_id, ds.row_count(), seed.subsets);

    let total = seed.math_vars.len();
    if total > 0 {
        *shared.progress.lock() = Progress::math_vars(0, total);
    }
    let math_vars = expr::replay(&mut ds, &seed.math_vars, |done, total| {
        *shared.progress.lock() = Progress::math_vars(done, total)
    });

    info!(
        "Session {}: loaded {} rows, {} subsets, {}/{} math variables",
        session_id,
        ds.row_count(),
        subsets.export_all().len(),
        math_vars.len(),
        total
    );
    *shared.data.lock() = Some(SessionData {
        ds,
        subsets,
        math_vars,
    });
    Ok(())
}

fn fetch_remote(file: &RemoteFile, services: &Services, shared: &Shared) -> Result<PathBuf> {
    let fetcher = services
        .fetcher
        .as_ref()
        .filter(|_| services.config.remote_fetch_enabled)
        .ok_or_else(|| PlotError::RemoteFetch("remote fetch is not enabled".to_string()))?;

    remote::fetch(
        fetcher.as_ref(),
        file,
        &services.config.remote_cache_dir,
        &mut |p| *shared.cloud.lock() = p,
    )
    .map_err(|e| {
        let e = match e {
            PlotError::RemoteFetch(_) => e,
            other => PlotError::RemoteFetch(other.to_string()),
        };
        shared.cloud.lock().error = Some(e.to_string());
        e
    })
}

/// `true` when a newer `plot_json` for the same plot key is already queued.
fn superseded<'a>(request: &Request, pending: impl IntoIterator<Item = &'a Request>) -> bool {
    if request.function_name != "plot_json" {
        return false;
    }
    let key = request.args.get("key");
    pending
        .into_iter()
        .any(|r| r.function_name == "plot_json" && r.args.get("key") == key)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

struct Worker {
    session_id: String,
    config: Arc<Config>,
    shared: Arc<Shared>,
    inbox: Receiver<Envelope>,
    shutdown: Sender<()>,
    /// CSV exports waiting for `download_file`, keyed by file id.
    pending_files: HashMap<String, String>,
}

impl Worker {
    fn run(mut self) {
        info!("Session {} worker started", self.session_id);
        let idle = Duration::from_secs(self.config.idle_timeout_secs);
        let mut pending: VecDeque<Envelope> = VecDeque::new();

        loop {
            if pending.is_empty() {
                match self.inbox.recv_timeout(idle) {
                    Ok(envelope) => pending.push_back(envelope),
                    Err(RecvTimeoutError::Timeout) => {
                        info!("Session {} queue timeout, shutting down.", self.session_id);
                        break;
                    }
                    Err(RecvTimeoutError::Disconnected) => {
                        debug!("Session {}: owner went away", self.session_id);
                        break;
                    }
                }
            }
            pending.extend(self.inbox.try_iter());

            let Some(envelope) = pending.pop_front() else {
                continue;
            };
            let response = if superseded(&envelope.request, pending.iter().map(|e| &e.request)) {
                info!("Session {}: plot preempted", self.session_id);
                Response::json(json!({ "preempt": "Plot preempted by another request." }))
            } else {
                self.execute(&envelope.request)
            };
            // The caller may have stopped waiting.
            envelope.reply.send(response).ok();
        }

        self.shutdown.send(()).ok();
        info!("Session {} worker stopped", self.session_id);
    }

    fn execute(&mut self, request: &Request) -> Response {
        let name = request.function_name.as_str();
        if !FUNCTIONS.contains(&name) {
            return Response::json(json!({
                "error": format!("Requested function: {} not in list of functions.", name)
            }));
        }
        debug!("Session {}: {}", self.session_id, name);

        match panic::catch_unwind(AssertUnwindSafe(|| self.handle(request))) {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!("Session {}: {} failed: {}", self.session_id, name, e);
                Response::error(&e)
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                let trace = Backtrace::force_capture();
                error!("Session {}: {} panicked: {}", self.session_id, name, message);
                Response::json(json!({ "error": format!("{}\n\n{}", message, trace) }))
            }
        }
    }

    fn handle(&mut self, request: &Request) -> Result<Response> {
        let args = &request.args;
        match request.function_name.as_str() {
            "processing_progress" => self.processing_progress(),
            "cloud_progress" => Ok(Response::json(serde_json::to_value(
                &*self.shared.cloud.lock(),
            )?)),
            "download_file" => self.download_file(args),
            name => {
                let mut guard = self.shared.data.lock();
                let data = guard.as_mut().ok_or(PlotError::DataNotLoaded)?;
                let ctx = Context {
                    session_id: &self.session_id,
                    config: &self.config,
                    pending_files: &mut self.pending_files,
                };
                ctx.dispatch(name, args, data)
            }
        }
    }

    fn processing_progress(&self) -> Result<Response> {
        if self.shared.data.lock().is_some() {
            return Ok(Response::json(json!({
                "progress": 1,
                "rows_loaded": null,
                "total_rows": null,
                "data_id": self.session_id,
                "done": true,
            })));
        }
        let mut out = serde_json::to_value(&*self.shared.progress.lock())?;
        out["data_id"] = json!(self.session_id);
        out["done"] = json!(false);
        Ok(Response::json(out))
    }

    fn download_file(&mut self, args: &Value) -> Result<Response> {
        let a: FileArgs = parse(args)?;
        let csv = a
            .file_id
            .and_then(|id| self.pending_files.remove(&id))
            .ok_or_else(|| {
                PlotError::invalid_request(
                    "File not found, you may need to call download_subset first.",
                )
            })?;
        Ok(Response {
            body: Body::Text(csv),
            effects: Effects::None,
        })
    }
}

fn parse<T: DeserializeOwned>(args: &Value) -> Result<T> {
    let value = if args.is_null() {
        Value::Object(Map::new())
    } else {
        args.clone()
    };
    serde_json::from_value(value)
        .map_err(|e| PlotError::invalid_request(format!("Invalid arguments: {}", e)))
}

fn require_subset(id: Option<u32>) -> Result<u32> {
    id.ok_or_else(|| PlotError::invalid_request("subset_id is invalid."))
}

fn require_var(var: Option<&str>) -> Result<&str> {
    var.ok_or_else(|| PlotError::invalid_request("filter_var is invalid."))
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct FileArgs {
    #[serde(deserialize_with = "args::opt_string")]
    file_id: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct SubsetArgs {
    #[serde(deserialize_with = "args::opt_id")]
    subset_id: Option<u32>,
    #[serde(deserialize_with = "args::opt_string")]
    filter_var: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct MathArgs {
    #[serde(deserialize_with = "args::opt_string")]
    expr: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct FilterArgs {
    #[serde(deserialize_with = "args::opt_id")]
    subset_id: Option<u32>,
    #[serde(deserialize_with = "args::opt_string")]
    filter_var: Option<String>,
    filters: Option<Vec<FilterSpec>>,
    #[serde(deserialize_with = "args::flag")]
    add_subset: bool,
    #[serde(deserialize_with = "args::flag")]
    exact_match: bool,
    #[serde(deserialize_with = "args::flag")]
    add_multiple_subsets: bool,
    #[serde(deserialize_with = "args::flag")]
    use_contains: bool,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct LevenshteinArgs {
    #[serde(deserialize_with = "args::opt_id")]
    subset_id: Option<u32>,
    #[serde(deserialize_with = "args::opt_string")]
    filter_var: Option<String>,
    #[serde(deserialize_with = "args::opt_string")]
    levenshtein_seq: Option<String>,
    #[serde(deserialize_with = "args::opt_f64")]
    levenshtein_n: Option<f64>,
    #[serde(deserialize_with = "args::flag")]
    add_subset: bool,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct BulkArgs {
    #[serde(rename = "bulkImport", deserialize_with = "args::opt_string")]
    bulk_import: Option<String>,
    #[serde(rename = "filterColumn", deserialize_with = "args::opt_string")]
    filter_column: Option<String>,
    #[serde(deserialize_with = "args::opt_id")]
    subset_id: Option<u32>,
    #[serde(deserialize_with = "args::flag")]
    use_contains: bool,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct CorrelationArgs {
    #[serde(deserialize_with = "args::opt_string")]
    x: Option<String>,
    #[serde(deserialize_with = "args::opt_string")]
    y: Option<String>,
    subset_ids: Option<Vec<u32>>,
}

/// Borrowed worker state for one dataset request.
struct Context<'a> {
    session_id: &'a str,
    config: &'a Config,
    pending_files: &'a mut HashMap<String, String>,
}

impl Context<'_> {
    fn dispatch(mut self, name: &str, args: &Value, data: &mut SessionData) -> Result<Response> {
        match name {
            "get_subsets" => Ok(Response::json(subsets_json(&data.subsets)?)),
            "get_columns" => Ok(Response::json(json!({
                "numeric": data.ds.numeric_columns(),
                "non_numeric": data.ds.non_numeric_columns(),
                "col_labels": data.ds.col_labels(),
            }))),
            "get_non_numeric_columns" => Ok(Response::json(json!(data.ds.non_numeric_columns()))),
            "plot_json" => {
                let req: PlotRequest = parse(args)?;
                let plot = render::render(&data.ds, &data.subsets, &self.config.render, &req)?;
                Ok(Response::json(plot.to_json()))
            }
            "select_data" => select_data(args, data),
            "delete_subset" => delete_subset(args, data),
            "do_math" => self.do_math(args, data),
            "download_subset" => self.download_subset(args, data),
            "filter" => filter_rows(args, data),
            "levenshtein_filter" => levenshtein_filter(args, data),
            "bulk_import" => bulk_import(args, data),
            "get_unique_strings" => unique_strings(args, data),
            "calc_correlation" => calc_correlation(args, data),
            other => Err(PlotError::invalid_request(format!(
                "Requested function: {} not in list of functions.",
                other
            ))),
        }
    }

    fn do_math(&self, args: &Value, data: &mut SessionData) -> Result<Response> {
        let a: MathArgs = parse(args)?;
        let raw = a
            .expr
            .ok_or_else(|| PlotError::Expression("expr is invalid.".to_string()))?;
        let out = expr::evaluate(&data.ds, &data.math_vars, &raw)?;
        let write = persistence::update_math_vars(self.session_id, &out.vars)?;
        data.ds.set_column(&out.name, out.column)?;
        data.math_vars = out.vars;
        info!("Session {}: added math variable {}", self.session_id, out.name);

        Ok(Response::with_effects(
            json!({
                "col_labels": data.ds.col_labels(),
                "cols": data.ds.numeric_columns(),
                "new_var": out.name,
            }),
            Effects::Single(write),
        ))
    }

    fn download_subset(&mut self, args: &Value, data: &mut SessionData) -> Result<Response> {
        let req: ExportRequest = parse(args)?;
        let subset_id = require_subset(req.subset_id)?;
        let mask = data.subsets.mask(subset_id)?;

        if let (Some(filename), true) = (&req.jupyter_filename, self.config.jupyter_export_enabled) {
            let path = downloader::write_jupyter(
                &data.ds,
                &data.subsets,
                &req,
                subset_id,
                filename,
                &self.config.jupyter_export_path,
            )?;
            info!("Session {}: wrote {}", self.session_id, path.display());
            return Ok(Response::json(json!({ "file_written": path.display().to_string() })));
        }

        let csv = downloader::to_csv(&data.ds, mask, &req.columns(&data.ds), &[])?;
        let file_id = Uuid::new_v4().to_string();
        self.pending_files.insert(file_id.clone(), csv);
        Ok(Response::json(json!({ "file_id": file_id })))
    }
}

fn subsets_json(store: &SubsetStore) -> Result<Value> {
    Ok(serde_json::to_value(store.export_all())?)
}

fn select_data(args: &Value, data: &mut SessionData) -> Result<Response> {
    let req: SelectRequest = parse(args)?;
    let mask = select::select_mask(&data.ds, &data.subsets, &req)?;
    let (id, write) = data.subsets.create(mask)?;
    Ok(Response::with_effects(
        json!([id, subsets_json(&data.subsets)?]),
        Effects::Single(write),
    ))
}

fn delete_subset(args: &Value, data: &mut SessionData) -> Result<Response> {
    let a: SubsetArgs = parse(args)?;
    let write = data.subsets.delete(require_subset(a.subset_id)?)?;
    Ok(Response::with_effects(
        subsets_json(&data.subsets)?,
        Effects::Single(write),
    ))
}

/// Adds `new_subset_id` and `subsets` to `body` when a subset is created.
fn maybe_add_subset(
    add: bool,
    mask: Mask,
    data: &mut SessionData,
    mut body: Value,
) -> Result<Response> {
    if !add {
        return Ok(Response::json(body));
    }
    let (id, write) = data.subsets.create(mask)?;
    body["new_subset_id"] = json!(id);
    body["subsets"] = subsets_json(&data.subsets)?;
    Ok(Response::with_effects(body, Effects::Single(write)))
}

fn filter_rows(args: &Value, data: &mut SessionData) -> Result<Response> {
    let a: FilterArgs = parse(args)?;
    let mode = MatchMode::from_flags(a.exact_match, a.use_contains)?;
    let within = data.subsets.mask(require_subset(a.subset_id)?)?.clone();
    let var = require_var(a.filter_var.as_deref())?;
    let filters = a
        .filters
        .as_deref()
        .ok_or_else(|| PlotError::filter_config("filters is invalid."))?;

    let out = filter::glob_filter(&data.ds, &within, var, filters, mode)?;

    if a.add_multiple_subsets {
        let mut writes = Vec::with_capacity(out.matches.len());
        let mut new_subsets = Vec::with_capacity(out.matches.len());
        for (pattern, mask) in out.matches {
            let count = mask.count();
            let (id, write) = data.subsets.create(mask)?;
            writes.push(write);
            new_subsets.push(json!({
                "name": format!("{}: {}", var, pattern),
                "count": count,
                "id": id,
                "size": null,
                "color": null,
            }));
        }
        return Ok(Response::with_effects(
            json!({
                "new_subsets": new_subsets,
                "all_subsets": subsets_json(&data.subsets)?,
            }),
            Effects::Batch(writes),
        ));
    }

    let body = json!({
        "filter_results": out.results,
        "total_rows": out.combined.count(),
    });
    maybe_add_subset(a.add_subset, out.combined, data, body)
}

fn levenshtein_filter(args: &Value, data: &mut SessionData) -> Result<Response> {
    let a: LevenshteinArgs = parse(args)?;
    let within = data.subsets.mask(require_subset(a.subset_id)?)?.clone();
    let var = require_var(a.filter_var.as_deref())?;
    let target = a
        .levenshtein_seq
        .as_deref()
        .ok_or_else(|| PlotError::filter_config("levenshtein_seq is invalid."))?;
    let n = match a.levenshtein_n {
        Some(n) if n.is_finite() && n >= 1.0 => n.trunc() as usize,
        _ => return Err(PlotError::filter_config("levenshtein_n is invalid.")),
    };

    let matched = filter::edit_distance_filter(&data.ds, &within, var, target, n)?;
    let body = json!({
        "matching_levenshtein_rows": matched.count(),
        "levenshtein_n": n,
    });
    maybe_add_subset(a.add_subset, matched, data, body)
}

fn bulk_import(args: &Value, data: &mut SessionData) -> Result<Response> {
    let a: BulkArgs = parse(args)?;
    let within = data.subsets.mask(require_subset(a.subset_id)?)?.clone();
    let column = a
        .filter_column
        .as_deref()
        .filter(|c| data.ds.has_column(c))
        .ok_or_else(|| PlotError::filter_config("Unknown filter column."))?;
    let rows = filter::parse_bulk(a.bulk_import.as_deref().unwrap_or(""))?;
    let mode = if a.use_contains {
        MatchMode::Contains
    } else {
        MatchMode::FullMatch
    };

    // Every group is validated before any subset is created.
    let groups = filter::bulk_filter(&data.ds, &within, column, &rows, mode)?;

    let mut writes = Vec::with_capacity(groups.len());
    let mut new_subsets = Vec::with_capacity(groups.len());
    for group in groups {
        let count = group.mask.count();
        let (id, write) = data.subsets.create(group.mask)?;
        writes.push(write);
        new_subsets.push(json!({
            "name": group.name,
            "count": count,
            "id": id,
            "size": group.size,
            "color": group.color,
        }));
    }
    Ok(Response::with_effects(
        json!({
            "new_subsets": new_subsets,
            "all_subsets": subsets_json(&data.subsets)?,
        }),
        Effects::Batch(writes),
    ))
}

fn unique_strings(args: &Value, data: &mut SessionData) -> Result<Response> {
    let a: SubsetArgs = parse(args)?;
    let within = data.subsets.mask(require_subset(a.subset_id)?)?;
    let var = require_var(a.filter_var.as_deref())?;
    let (num_unique, listed) = filter::unique_strings(&data.ds, within, var)?;
    Ok(Response::json(match listed {
        None => json!({ "num_unique": num_unique }),
        Some(counts) => {
            let unique: Map<String, Value> =
                counts.into_iter().map(|(v, n)| (v, json!(n))).collect();
            json!({ "unique": unique, "num_unique": num_unique })
        }
    }))
}

fn calc_correlation(args: &Value, data: &mut SessionData) -> Result<Response> {
    let a: CorrelationArgs = parse(args)?;
    let correlations = match (a.x.as_deref(), a.y.as_deref()) {
        (Some(x), Some(y)) => {
            let ids = a.subset_ids.unwrap_or_else(|| vec![ALL_ROWS]);
            let rows = data.subsets.union(&ids)?;
            let xs = data.ds.numeric(x)?;
            let ys = data.ds.numeric(y)?;
            if x == y {
                Correlations::identity()
            } else {
                stats::correlations(xs, ys, rows.iter_ones())
            }
        }
        _ => stats::correlations(&[], &[], std::iter::empty()),
    };
    Ok(Response::json(serde_json::to_value(correlations)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Column;

    fn plot(key: i64) -> Request {
        Request::new("plot_json", json!({ "key": key, "x": "a", "y": "b" }))
    }

    #[test]
    fn newer_plot_with_same_key_supersedes() {
        let queued = [Request::new("get_subsets", json!({})), plot(2), plot(1)];
        assert!(superseded(&plot(1), &queued));
        assert!(!superseded(&plot(3), &queued));
        assert!(!superseded(&Request::new("get_subsets", json!({})), &queued));
    }

    fn send(requests: &Sender<Envelope>, request: Request) -> Receiver<Response> {
        let (reply, answer) = bounded(1);
        requests.send(Envelope { request, reply }).unwrap();
        answer
    }

    #[test]
    fn queued_plot_with_same_key_preempts_the_older_one() {
        let ds = Dataset::from_columns(vec![
            ("a".into(), Column::numeric(vec![1.0, 2.0, 3.0])),
            ("b".into(), Column::numeric(vec![4.0, 5.0, 6.0])),
        ])
        .unwrap();
        let shared = Arc::new(Shared {
            data: Mutex::new(Some(SessionData {
                ds,
                subsets: SubsetStore::new("s", 3, BTreeMap::new()),
                math_vars: Vec::new(),
            })),
            progress: Mutex::new(Progress::opening()),
            cloud: Mutex::new(CloudProgress::started(0)),
        });
        let (requests, inbox) = unbounded();
        let (shutdown_tx, shutdown) = bounded(1);
        let worker = Worker {
            session_id: "s".to_string(),
            config: Arc::new(Config::default()),
            shared: Arc::clone(&shared),
            inbox,
            shutdown: shutdown_tx,
            pending_files: HashMap::new(),
        };
        let handle = thread::spawn(move || worker.run());

        // Holding the data lock keeps the worker busy on the first request
        // while both plots queue up behind it.
        let guard = shared.data.lock();
        let busy = send(&requests, Request::new("get_subsets", json!({})));
        let older = send(&requests, plot(1));
        let newer = send(&requests, plot(1));
        drop(guard);

        assert!(busy.recv().unwrap().body.as_json().unwrap().get("0").is_some());
        assert_eq!(
            older.recv().unwrap().body,
            Body::Json(json!({ "preempt": "Plot preempted by another request." }))
        );
        let figure = newer.recv().unwrap().body.into_json();
        assert!(figure[0]["data"].is_array());

        drop(requests);
        handle.join().unwrap();
        assert!(shutdown.try_recv().is_ok());
    }

    #[test]
    fn panic_payloads_become_messages() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
    }

    #[test]
    fn null_args_parse_as_empty() {
        let a: SubsetArgs = parse(&Value::Null).unwrap();
        assert_eq!(a.subset_id, None);
        assert!(matches!(
            parse::<SubsetArgs>(&json!({ "subset_id": [1] })),
            Ok(SubsetArgs { subset_id: None, .. })
        ));
        assert!(parse::<FilterArgs>(&json!({ "filters": 3 })).is_err());
    }
}
