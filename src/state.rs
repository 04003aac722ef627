use std::sync::Arc;

use crate::config::Config;
use crate::progress::ProgressStore;
use crate::session::CancelFlags;
use crate::store::FileStore;

/// 所有请求共享的状态
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    store: FileStore,
    progress: ProgressStore,
    cancel_flags: CancelFlags,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let store = FileStore::new(config.upload_dir.clone());
        Self {
            inner: Arc::new(AppStateInner {
                config,
                store,
                progress: ProgressStore::new(),
                cancel_flags: CancelFlags::new(),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn store(&self) -> &FileStore {
        &self.inner.store
    }

    pub fn progress(&self) -> &ProgressStore {
        &self.inner.progress
    }

    pub fn cancel_flags(&self) -> &CancelFlags {
        &self.inner.cancel_flags
    }
}
