//! Shared, reference counted case templates
//!
//! One task owns every loaded [`CaseTemplate`]. Channels ask it for a case
//! (optionally handing back the one they are done with) and get a shared
//! read-only handle. Entries are evicted once nobody uses them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::template::{CaseTemplate, TemplateSource};
use crate::{Error, Result};

pub enum CacheCommand {
    Acquire {
        key: PathBuf,
        release: Option<PathBuf>,
        reply: oneshot::Sender<Result<Arc<CaseTemplate>>>,
    },
    Release {
        key: PathBuf,
    },
    Shutdown,
}

struct CacheEntry {
    template: Arc<CaseTemplate>,
    count: usize,
}

pub struct ResourceController {
    source: Arc<dyn TemplateSource>,
    entries: HashMap<PathBuf, CacheEntry>,
    command_rx: mpsc::UnboundedReceiver<CacheCommand>,
}

/// Cloneable client side of the controller.
#[derive(Clone)]
pub struct CacheHandle {
    command_tx: mpsc::UnboundedSender<CacheCommand>,
}

impl ResourceController {
    pub fn new(source: Arc<dyn TemplateSource>) -> (Self, CacheHandle) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let controller = Self {
            source,
            entries: HashMap::new(),
            command_rx,
        };
        (controller, CacheHandle { command_tx })
    }

    /// Serves commands until shutdown or until every handle is dropped.
    pub async fn run(mut self) {
        info!("Resource controller started");
        while let Some(command) = self.command_rx.recv().await {
            match command {
                CacheCommand::Acquire { key, release, reply } => {
                    let result = self.acquire(&key, release.as_deref());
                    if reply.send(result).is_err() {
                        // Requester is gone, undo its reference
                        self.release(&key);
                    }
                }
                CacheCommand::Release { key } => self.release(&key),
                CacheCommand::Shutdown => break,
            }
        }
        info!(
            "Resource controller stopped with {} entries loaded",
            self.entries.len()
        );
    }

    /// Takes a reference on `key`, loading it on a miss, after releasing `release`.
    pub fn acquire(&mut self, key: &Path, release: Option<&Path>) -> Result<Arc<CaseTemplate>> {
        if let Some(previous) = release {
            self.release(previous);
        }

        if let Some(entry) = self.entries.get_mut(key) {
            entry.count += 1;
            debug!("Case {} now used by {} channel(s)", key.display(), entry.count);
            return Ok(entry.template.clone());
        }

        let template = Arc::new(self.source.load(key)?);
        debug!("Case {} loaded", key.display());
        self.entries.insert(
            key.to_path_buf(),
            CacheEntry {
                template: template.clone(),
                count: 1,
            },
        );
        Ok(template)
    }

    pub fn release(&mut self, key: &Path) {
        let Some(entry) = self.entries.get_mut(key) else {
            warn!("{}", Error::unknown_key(key.display().to_string()));
            return;
        };
        entry.count -= 1;
        if entry.count == 0 {
            self.entries.remove(key);
            debug!("Case {} evicted", key.display());
        }
    }

    pub fn ref_count(&self, key: &Path) -> usize {
        self.entries.get(key).map_or(0, |entry| entry.count)
    }
}

impl CacheHandle {
    pub async fn acquire(&self, key: PathBuf, release: Option<PathBuf>) -> Result<Arc<CaseTemplate>> {
        let (reply, response) = oneshot::channel();
        self.command_tx
            .send(CacheCommand::Acquire { key, release, reply })
            .map_err(|_| Error::internal("resource controller is not running"))?;
        response
            .await
            .map_err(|_| Error::internal("resource controller dropped the request"))?
    }

    pub fn release(&self, key: PathBuf) {
        if self.command_tx.send(CacheCommand::Release { key }).is_err() {
            debug!("Release after the resource controller stopped");
        }
    }

    pub fn shutdown(&self) {
        let _ = self.command_tx.send(CacheCommand::Shutdown);
    }
}
