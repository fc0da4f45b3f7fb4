//! Routes calls to session workers and persists what they return.

use crate::error::{PlotError, Result};
use crate::persistence::{self, Store};
use crate::worker::{Body, Request, Seed, Services, Source, WorkerHandle};
use log::{debug, error, info};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Registry of live session workers.
pub struct Dispatch {
    services: Services,
    store: Arc<dyn Store>,
    workers: Mutex<HashMap<String, Arc<WorkerHandle>>>,
}

impl Dispatch {
    pub fn new(services: Services, store: Arc<dyn Store>) -> Self {
        Dispatch {
            services,
            store,
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    /// Start a worker and register it
    ///
    /// # Arguments
    /// * `session_id` - Id to register under; a new UUID when `None`
    /// * `source` - Local path or remote file to load
    /// * `seed` - Subsets and math variables restored from storage
    ///
    /// # Returns
    /// * `Result<String>` - The session id
    pub fn launch(&self, session_id: Option<String>, source: Source, seed: Seed) -> Result<String> {
        let id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let handle = WorkerHandle::spawn(&id, source, seed, self.services.clone())?;
        if self
            .workers
            .lock()
            .insert(id.clone(), Arc::new(handle))
            .is_some()
        {
            info!("Session {}: replaced running worker", id);
        }
        info!("Session {}: launched", id);
        Ok(id)
    }

    /// Relaunch a saved session with its stored subsets and math variables.
    pub fn resume(&self, session_id: &str, source: Source) -> Result<String> {
        let seed = load_seed(self.store.as_ref(), session_id)?;
        debug!(
            "Session {}: resuming with {} subsets, {} math variables",
            session_id,
            seed.subsets.len(),
            seed.math_vars.len()
        );
        self.launch(Some(session_id.to_string()), source, seed)
    }

    /// `true` while the session has a registered worker that has not shut down.
    pub fn is_live(&self, session_id: &str) -> bool {
        self.workers
            .lock()
            .get(session_id)
            .is_some_and(|w| !w.is_shut_down())
    }

    /// Call a worker function; every failure comes back as an error body.
    pub fn call(&self, session_id: &str, function_name: &str, args: Value) -> Body {
        match self.try_call(session_id, function_name, args) {
            Ok(body) => body,
            Err(e) => Body::Json(e.to_json()),
        }
    }

    /// Call a worker function and persist its effects.
    ///
    /// Fails with `InvalidSession` for an unknown id and `SessionExpired`
    /// when the worker has shut down, in which case it is deregistered.
    /// A store failure gives `Persist`, carrying the worker's result and how
    /// many writes were stored before it.
    pub fn try_call(&self, session_id: &str, function_name: &str, args: Value) -> Result<Body> {
        let worker = self
            .workers
            .lock()
            .get(session_id)
            .cloned()
            .ok_or(PlotError::InvalidSession)?;

        let response = match worker.call(Request::new(function_name, args)) {
            Ok(r) => r,
            Err(e @ PlotError::SessionExpired) => {
                info!("Session {}: worker has shut down, deregistering", session_id);
                self.workers.lock().remove(session_id);
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let writes = response.effects.writes();
        for (applied, write) in writes.iter().enumerate() {
            debug!("Session {}: {}", session_id, write.sql);
            if let Err(e) = self.store.insert(&write.sql, &write.params) {
                error!(
                    "Session {}: {} failed after {} of {} writes were stored: {}",
                    session_id,
                    function_name,
                    applied,
                    writes.len(),
                    e
                );
                return Err(PlotError::Persist {
                    applied,
                    total: writes.len(),
                    reason: e.to_string(),
                    result: response.body.into_json(),
                });
            }
        }
        Ok(response.body)
    }

    /// Persist the client's UI state for a session.
    pub fn save_state(
        &self,
        session_id: &str,
        filename: &str,
        owner: &str,
        json_state: &str,
    ) -> Result<()> {
        let write = persistence::save_state(session_id, filename, owner, json_state);
        self.store.insert(&write.sql, &write.params)
    }
}

/// Subsets and math variables stored for `session_id`.
pub fn load_seed(store: &dyn Store, session_id: &str) -> Result<Seed> {
    Ok(Seed {
        subsets: persistence::load_subsets(store, session_id)?,
        math_vars: persistence::load_math_vars(store, session_id)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::loader::CsvLoader;
    use crate::persistence::{DbValue, MemoryStore, Row};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    /// Accepts `limit` writes, then fails every later one.
    struct FlakyStore {
        inner: MemoryStore,
        limit: usize,
        seen: AtomicUsize,
    }

    impl Store for FlakyStore {
        fn insert(&self, sql: &str, params: &[DbValue]) -> Result<()> {
            if self.seen.fetch_add(1, Ordering::SeqCst) >= self.limit {
                return Err(PlotError::Io(std::io::Error::other("disk full")));
            }
            self.inner.insert(sql, params)
        }

        fn query(&self, sql: &str, params: &[DbValue]) -> Result<Vec<Row>> {
            self.inner.query(sql, params)
        }
    }

    fn dispatch() -> Dispatch {
        let services = Services {
            config: Arc::new(Config::default()),
            loader: Arc::new(CsvLoader),
            fetcher: None,
        };
        Dispatch::new(services, Arc::new(MemoryStore::new()))
    }

    #[test]
    fn unknown_session_is_invalid() {
        let d = dispatch();
        assert!(!d.is_live("nope"));
        let body = d.call("nope", "get_subsets", json!({}));
        assert!(
            body.as_json().unwrap()["error"]
                .as_str()
                .unwrap()
                .starts_with("Invalid session ID")
        );
    }

    #[test]
    fn partial_persistence_keeps_the_result() {
        let dir = tempfile::tempdir().unwrap();
        let csv = dir.path().join("pets.csv");
        std::fs::write(&csv, "name\ncat\ndog\n").unwrap();
        let services = Services {
            config: Arc::new(Config::default()),
            loader: Arc::new(CsvLoader),
            fetcher: None,
        };
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            limit: 1,
            seen: AtomicUsize::new(0),
        });
        let d = Dispatch::new(services, store.clone());
        let id = d.launch(None, Source::Local(csv), Seed::default()).unwrap();
        for _ in 0..500 {
            if d.call(&id, "processing_progress", json!({})).into_json()["done"] == json!(true) {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }

        let body = d
            .call(
                &id,
                "bulk_import",
                json!({ "bulkImport": "a\tcat\nb\tdog", "filterColumn": "name", "subset_id": 0 }),
            )
            .into_json();
        assert!(body["error"].as_str().unwrap().contains("after 1 of 2 writes"));
        assert_eq!(body["writes_applied"], json!(1));
        assert_eq!(body["result"]["new_subsets"].as_array().unwrap().len(), 2);
        assert_eq!(store.inner.subset_count(&id), 1);
    }

    #[test]
    fn load_failure_is_reported_through_progress() {
        let d = dispatch();
        let id = d
            .launch(None, Source::Local("/nonexistent/data.csv".into()), Seed::default())
            .unwrap();
        assert!(d.is_live(&id));

        let body = d.call(&id, "get_subsets", json!({}));
        assert_eq!(
            body.as_json().unwrap()["error"],
            json!("Data not yet loaded.")
        );
    }
}
