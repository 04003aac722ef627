//! 会话标识和取消标记
//!
//! 会话 token 来自 cookie，没有或不合法时签发新的 token。
//! 取消标记按会话保存，由下一次进度轮询读取并清除。

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use axum_extra::extract::cookie::{Cookie, CookieJar};
use parking_lot::Mutex;
use uuid::Uuid;

const MAX_TOKEN_LEN: usize = 128;

/// 可以安全用作目录名的会话 token
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionToken(String);

impl SessionToken {
    /// 只接受 1..=128 个 `[A-Za-z0-9_-]` 字符
    pub fn parse(raw: &str) -> Option<Self> {
        let valid = !raw.is_empty()
            && raw.len() <= MAX_TOKEN_LEN
            && raw
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        valid.then(|| Self(raw.to_string()))
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 请求所属的会话
#[derive(Debug, Clone)]
pub struct Session {
    pub token: SessionToken,
    /// 本次请求才签发，客户端之前没有这个会话
    pub issued: bool,
}

/// 从 cookie 中取出会话；需要新会话时把 cookie 加进返回的 jar
pub fn resolve(jar: CookieJar, cookie_name: &str) -> (CookieJar, Session) {
    if let Some(token) = jar
        .get(cookie_name)
        .and_then(|cookie| SessionToken::parse(cookie.value()))
    {
        return (jar, Session { token, issued: false });
    }

    let token = SessionToken::generate();
    tracing::debug!(session = %token, "issued new session");
    let cookie = Cookie::build((cookie_name.to_string(), token.to_string()))
        .path("/")
        .http_only(true);
    (jar.add(cookie), Session { token, issued: true })
}

/// 按会话记录的取消标记
#[derive(Debug, Clone, Default)]
pub struct CancelFlags {
    canceled: Arc<Mutex<HashSet<SessionToken>>>,
}

impl CancelFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, session: &SessionToken) {
        self.canceled.lock().insert(session.clone());
    }

    pub fn is_empty(&self) -> bool {
        self.canceled.lock().is_empty()
    }

    pub fn clear(&self, session: &SessionToken) {
        self.canceled.lock().remove(session);
    }

    /// 读取并复位
    pub fn take(&self, session: &SessionToken) -> bool {
        self.canceled.lock().remove(session)
    }
}
