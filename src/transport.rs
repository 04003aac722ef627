//! 请求体字节计数
//!
//! 上传进度需要在 multipart 解析之前就开始统计，所以在请求体的数据流外面
//! 包一层，每收到一个数据块就回调一次 [`ProgressHook`]。

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::Stream;
use parking_lot::Mutex;
use pin_project_lite::pin_project;
use uuid::Uuid;

use crate::progress::ProgressStore;

/// 请求体读取器每读到一块数据调用一次，参数是累计字节数
pub trait ProgressHook: Send + Sync {
    fn on_chunk(&self, received: u64);
}

pin_project! {
    /// 透传数据块的同时统计字节数
    pub struct ProgressBody<S> {
        #[pin]
        inner: S,
        received: u64,
        hook: Arc<dyn ProgressHook>,
    }
}

impl<S> ProgressBody<S> {
    pub fn new(inner: S, hook: Arc<dyn ProgressHook>) -> Self {
        Self {
            inner,
            received: 0,
            hook,
        }
    }
}

impl<S, E> Stream for ProgressBody<S>
where
    S: Stream<Item = Result<Bytes, E>>,
{
    type Item = Result<Bytes, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let polled = this.inner.poll_next(cx);
        if let Poll::Ready(Some(Ok(chunk))) = &polled {
            *this.received += chunk.len() as u64;
            this.hook.on_chunk(*this.received);
        }
        polled
    }
}

/// 把字节计数写进 [`ProgressStore`] 的钩子。
///
/// 进度 key 在请求体里，要等解析到对应字段后才能 [`bind`](Self::bind)；
/// 绑定之前的计数会在绑定时一次性补写。被丢弃时回收自己写入的条目。
pub struct KeyedProgress {
    store: ProgressStore,
    upload: Uuid,
    total: u64,
    received: AtomicU64,
    key: Mutex<Option<String>>,
}

impl KeyedProgress {
    pub fn new(store: ProgressStore, total: u64) -> Self {
        Self {
            store,
            upload: Uuid::new_v4(),
            total,
            received: AtomicU64::new(0),
            key: Mutex::new(None),
        }
    }

    /// 绑定进度 key，只有第一次调用生效
    pub fn bind(&self, key: &str) {
        let mut bound = self.key.lock();
        if bound.is_some() {
            return;
        }
        *bound = Some(key.to_string());
        let received = self.received.load(Ordering::Acquire);
        self.store.put(key, self.upload, received, self.total);
        tracing::debug!(key, received, total = self.total, "progress key bound");
    }

    pub fn key(&self) -> Option<String> {
        self.key.lock().clone()
    }
}

impl ProgressHook for KeyedProgress {
    fn on_chunk(&self, received: u64) {
        self.received.store(received, Ordering::Release);
        if let Some(key) = self.key.lock().as_deref() {
            self.store.put(key, self.upload, received, self.total);
        }
    }
}

impl Drop for KeyedProgress {
    fn drop(&mut self) {
        if let Some(key) = self.key.get_mut().take() {
            self.store.release(&key, self.upload);
        }
    }
}
