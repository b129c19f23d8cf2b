// 📥 Data Loader - Line items for one parent, push or pull
//
// Push: `subscribe(parent_id)` returns a stream of every completed load.
// Pull: `refresh()` reloads the current parent and returns the result.
// Both publish through the same watch channel, so a host can mix them.

use crate::backend::{bounded, LineItemBackend};
use crate::error::LoadError;
use crate::line_item::LedgerSnapshot;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{error, info};

pub type LoadResult = Result<Arc<LedgerSnapshot>, LoadError>;

/// Completed loads, newest last
pub type LoadStream = Pin<Box<dyn Stream<Item = LoadResult> + Send>>;

#[derive(Debug, Clone, PartialEq)]
pub enum LoadState {
    Idle,
    Loading,
    Ready(Arc<LedgerSnapshot>),
    Failed(LoadError),
}

impl LoadState {
    pub fn is_loading(&self) -> bool {
        matches!(self, LoadState::Loading)
    }

    pub fn snapshot(&self) -> Option<Arc<LedgerSnapshot>> {
        match self {
            LoadState::Ready(snapshot) => Some(snapshot.clone()),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&LoadError> {
        match self {
            LoadState::Failed(e) => Some(e),
            _ => None,
        }
    }

    /// Completed loads only; `Idle` and `Loading` are not results
    fn into_result(self) -> Option<LoadResult> {
        match self {
            LoadState::Ready(snapshot) => Some(Ok(snapshot)),
            LoadState::Failed(e) => Some(Err(e)),
            LoadState::Idle | LoadState::Loading => None,
        }
    }
}

pub struct DataLoader {
    backend: Arc<dyn LineItemBackend>,
    timeout: Option<Duration>,
    parent_id: Mutex<Option<String>>,
    /// Bumped on every load; only the newest load may publish
    generation: AtomicU64,
    state: watch::Sender<LoadState>,
}

impl DataLoader {
    pub fn new(backend: Arc<dyn LineItemBackend>, timeout: Option<Duration>) -> Self {
        let (state, _) = watch::channel(LoadState::Idle);
        Self {
            backend,
            timeout,
            parent_id: Mutex::new(None),
            generation: AtomicU64::new(0),
            state,
        }
    }

    pub fn backend(&self) -> &Arc<dyn LineItemBackend> {
        &self.backend
    }

    pub fn parent_id(&self) -> Option<String> {
        self.parent_id.lock().ok().and_then(|p| p.clone())
    }

    pub fn state(&self) -> LoadState {
        self.state.borrow().clone()
    }

    pub fn snapshot(&self) -> Option<Arc<LedgerSnapshot>> {
        self.state.borrow().snapshot()
    }

    /// Raw state channel, including `Loading` transitions
    pub fn watch(&self) -> watch::Receiver<LoadState> {
        self.state.subscribe()
    }

    /// Switch to `parent_id` (loading it if it is new, never loaded or last
    /// failed) and stream every completed load from now on, starting with the
    /// current one.
    pub async fn subscribe(&self, parent_id: &str) -> LoadStream {
        let needs_load = self.parent_id().as_deref() != Some(parent_id.trim())
            || matches!(self.state(), LoadState::Idle | LoadState::Failed(_));

        if needs_load {
            // The outcome is published on the channel the stream reads from
            let _ = self.load(parent_id).await;
        }

        Box::pin(WatchStream::new(self.state.subscribe()).filter_map(LoadState::into_result))
    }

    /// Reload the current parent
    pub async fn refresh(&self) -> LoadResult {
        let parent_id = self.parent_id().unwrap_or_default();
        self.load(&parent_id).await
    }

    /// Load `parent_id`, making it the current parent
    pub async fn load(&self, parent_id: &str) -> LoadResult {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let parent_id = parent_id.trim();

        if parent_id.is_empty() {
            self.publish(generation, LoadState::Failed(LoadError::InvalidParent));
            return Err(LoadError::InvalidParent);
        }

        if let Ok(mut current) = self.parent_id.lock() {
            *current = Some(parent_id.to_string());
        }
        self.publish(generation, LoadState::Loading);

        let result = match bounded(self.timeout, self.backend.load_line_items(parent_id)).await {
            Ok(Ok(snapshot)) => Ok(Arc::new(snapshot)),
            Ok(Err(e)) => Err(LoadError::Backend(e)),
            Err(limit) => Err(LoadError::Timeout(limit)),
        };

        match &result {
            Ok(snapshot) => {
                info!(parent_id, rows = snapshot.items.len(), "line items loaded");
                self.publish(generation, LoadState::Ready(snapshot.clone()));
            }
            Err(e) => {
                error!(parent_id, error = %e, "failed to load line items");
                self.publish(generation, LoadState::Failed(e.clone()));
            }
        }

        result
    }

    /// Drop results from loads that a newer load has superseded
    fn publish(&self, generation: u64, state: LoadState) {
        if self.generation.load(Ordering::SeqCst) == generation {
            self.state.send_replace(state);
        }
    }
}
