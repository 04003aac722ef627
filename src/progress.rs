//! 上传进度表
//!
//! 由传输层在收到字节时写入，由轮询请求读取。key 由客户端在上传开始前选定，
//! 冲突由调用方负责：同一个 key 被新的上传复用时，旧条目会被覆盖。

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;

/// 某个 key 当前的进度快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub received: u64,
    pub total: u64,
}

impl Progress {
    /// 总量未知时返回 None
    pub fn percent(&self) -> Option<u64> {
        if self.total == 0 {
            return None;
        }
        let ratio = self.received as f64 / self.total as f64;
        Some(((ratio * 100.0).round() as u64).min(100))
    }

    pub fn is_finished(&self) -> bool {
        self.total > 0 && self.received == self.total
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    progress: Progress,
    owner: Uuid,
}

/// 进程内共享的进度表，克隆即共享
#[derive(Debug, Clone, Default)]
pub struct ProgressStore {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
}

impl ProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 覆盖写入 `owner` 这次上传的进度。
    ///
    /// 同一次上传内 `received` 不会倒退，一旦到达 `total` 就不再变化。
    pub fn put(&self, key: &str, owner: Uuid, received: u64, total: u64) {
        let mut entries = self.entries.write();
        let next = Progress { received, total };
        match entries.get_mut(key) {
            Some(entry) if entry.owner == owner => {
                if entry.progress.is_finished() {
                    return;
                }
                entry.progress = Progress {
                    received: received.max(entry.progress.received),
                    total,
                };
            }
            _ => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        progress: next,
                        owner,
                    },
                );
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<Progress> {
        self.entries.read().get(key).map(|entry| entry.progress)
    }

    /// 回收条目；如果 key 已经被别的上传占用则保持不动
    pub fn release(&self, key: &str, owner: Uuid) {
        let mut entries = self.entries.write();
        if entries.get(key).is_some_and(|entry| entry.owner == owner) {
            entries.remove(key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
