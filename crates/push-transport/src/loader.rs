use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{info, warn};

/// Errors loading the transport runtime.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LoadError {
    #[error("failed to fetch {url}: {reason}")]
    Fetch { url: String, reason: String },
    #[error("{url} responded with status {status}")]
    Status { url: String, status: u16 },
    #[error("load of {url} was abandoned")]
    Abandoned { url: String },
}

/// Fetches the resource that makes the transport runtime available.
#[async_trait]
pub trait ResourceLoader: Send + Sync {
    async fn load(&self, url: &str) -> Result<(), LoadError>;
}

type ReadyFn = Box<dyn FnOnce() + Send>;
type FailFn = Box<dyn FnOnce(LoadError) + Send>;

struct Listener {
    on_ready: ReadyFn,
    on_fail: FailFn,
}

enum LoadState {
    Unloaded,
    Loading(Vec<Listener>),
    Loaded,
}

/// Latch gating use of the transport runtime until its resource has loaded.
///
/// Overlapping requests share one underlying load. A failed load resets the
/// latch, so a later request starts a fresh attempt.
#[derive(Clone)]
pub struct LibraryLoader {
    inner: Arc<LoaderInner>,
}

struct LoaderInner {
    url: String,
    resource: Arc<dyn ResourceLoader>,
    state: Mutex<LoadState>,
}

impl LibraryLoader {
    pub fn new(url: impl Into<String>, resource: Arc<dyn ResourceLoader>) -> Self {
        Self {
            inner: Arc::new(LoaderInner {
                url: url.into(),
                resource,
                state: Mutex::new(LoadState::Unloaded),
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn is_loaded(&self) -> bool {
        matches!(*self.inner.state.lock(), LoadState::Loaded)
    }

    /// Runs `on_ready` once the runtime is loaded, or `on_fail` if the load
    /// fails. When already loaded, `on_ready` runs before this returns.
    /// Starting a load spawns onto the current tokio runtime.
    pub fn ensure_loaded<R, F>(&self, on_ready: R, on_fail: F)
    where
        R: FnOnce() + Send + 'static,
        F: FnOnce(LoadError) + Send + 'static,
    {
        let listener = Listener {
            on_ready: Box::new(on_ready),
            on_fail: Box::new(on_fail),
        };

        let mut state = self.inner.state.lock();
        if matches!(*state, LoadState::Loaded) {
            drop(state);
            (listener.on_ready)();
            return;
        }
        if let LoadState::Loading(listeners) = &mut *state {
            listeners.push(listener);
            return;
        }
        *state = LoadState::Loading(vec![listener]);
        drop(state);

        info!(target: "push.transport", url = %self.inner.url, "loading push runtime");
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let result = inner.resource.load(&inner.url).await;
            inner.finish(result);
        });
    }

    /// Runs `command` once loaded; a failed load only logs.
    pub fn run_when_loaded<C>(&self, command: C)
    where
        C: FnOnce() + Send + 'static,
    {
        self.ensure_loaded(command, log_load_failure);
    }

    /// Awaitable form of [`LibraryLoader::ensure_loaded`].
    pub async fn loaded(&self) -> Result<(), LoadError> {
        let (tx, rx) = oneshot::channel();
        let ready_tx = Arc::new(Mutex::new(Some(tx)));
        let fail_tx = Arc::clone(&ready_tx);
        self.ensure_loaded(
            move || {
                if let Some(tx) = ready_tx.lock().take() {
                    let _ = tx.send(Ok(()));
                }
            },
            move |err| {
                if let Some(tx) = fail_tx.lock().take() {
                    let _ = tx.send(Err(err));
                }
            },
        );
        rx.await.unwrap_or_else(|_| {
            Err(LoadError::Abandoned {
                url: self.inner.url.clone(),
            })
        })
    }
}

impl LoaderInner {
    fn finish(&self, result: Result<(), LoadError>) {
        let next = if result.is_ok() {
            LoadState::Loaded
        } else {
            LoadState::Unloaded
        };
        let listeners = match std::mem::replace(&mut *self.state.lock(), next) {
            LoadState::Loading(listeners) => listeners,
            _ => Vec::new(),
        };

        match result {
            Ok(()) => {
                info!(target: "push.transport", url = %self.url, "push runtime loaded");
                for listener in listeners {
                    (listener.on_ready)();
                }
            }
            Err(err) => {
                for listener in listeners {
                    (listener.on_fail)(err.clone());
                }
            }
        }
    }
}

fn log_load_failure(err: LoadError) {
    warn!(target: "push.transport", error = %err, "push runtime could not be loaded. Push will not work.");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    struct GatedResource {
        loads: AtomicUsize,
        gate: Notify,
        fail: bool,
    }

    impl GatedResource {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                loads: AtomicUsize::new(0),
                gate: Notify::new(),
                fail,
            })
        }
    }

    #[async_trait]
    impl ResourceLoader for GatedResource {
        async fn load(&self, url: &str) -> Result<(), LoadError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            if self.fail {
                Err(LoadError::Status {
                    url: url.to_string(),
                    status: 404,
                })
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn overlapping_requests_share_one_load() {
        let resource = GatedResource::new(false);
        let loader = LibraryLoader::new("/push/runtime", resource.clone());
        let ready = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let ready = ready.clone();
            loader.ensure_loaded(
                move || {
                    ready.fetch_add(1, Ordering::SeqCst);
                },
                |err| panic!("unexpected load failure: {err}"),
            );
        }
        assert!(!loader.is_loaded());

        // let the spawned load reach the gate before opening it
        tokio::time::sleep(Duration::from_millis(20)).await;
        resource.gate.notify_one();
        tokio::time::timeout(Duration::from_secs(2), async {
            while ready.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("listeners not released");

        assert_eq!(resource.loads.load(Ordering::SeqCst), 1);
        assert!(loader.is_loaded());
    }

    #[tokio::test]
    async fn loaded_runtime_runs_ready_synchronously() {
        let resource = GatedResource::new(false);
        let loader = LibraryLoader::new("/push/runtime", resource.clone());
        resource.gate.notify_one();
        loader.loaded().await.expect("load");

        let ran = Arc::new(AtomicUsize::new(0));
        let flag = ran.clone();
        loader.run_when_loaded(move || {
            flag.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(resource.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_load_notifies_and_allows_retry() {
        let resource = GatedResource::new(true);
        let loader = LibraryLoader::new("/missing", resource.clone());

        resource.gate.notify_one();
        let err = loader.loaded().await.expect_err("load should fail");
        assert_eq!(
            err,
            LoadError::Status {
                url: "/missing".into(),
                status: 404
            }
        );
        assert!(!loader.is_loaded());

        resource.gate.notify_one();
        assert!(loader.loaded().await.is_err());
        assert_eq!(resource.loads.load(Ordering::SeqCst), 2);
    }
}
