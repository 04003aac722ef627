use std::collections::HashMap;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum_extra::extract::cookie::CookieJar;
use percent_encoding::{percent_encode, NON_ALPHANUMERIC};
use tokio_util::io::ReaderStream;

use crate::error::UploadError;
use crate::response::{xml_response, Encoding, XmlBody};
use crate::session::{self, SessionToken};
use crate::state::AppState;

// 按优先级排列，只处理第一个出现的参数
pub const PARAM_FILENAME: &str = "filename";
pub const PARAM_NEW_SESSION: &str = "new_session";
pub const PARAM_SHOW: &str = "show";
pub const PARAM_REMOVE: &str = "remove";
pub const PARAM_CANCEL: &str = "cancel";

const CHUNK_SIZE: usize = 256 * 1024;
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// GET：进度轮询、会话初始化、取回、删除、取消
pub async fn handle_query(
    State(state): State<AppState>,
    jar: CookieJar,
    Query(params): Query<HashMap<String, String>>,
) -> (CookieJar, Response) {
    let (jar, resolved) = session::resolve(jar, &state.config().session_cookie);
    let session = &resolved.token;

    let mut response = match dispatch(&state, session, resolved.issued, &params).await {
        Ok(response) => response,
        Err(e) => {
            tracing::debug!(session = %session, error = %e, "query failed");
            xml_response(e.to_xml(Encoding::Plain), Encoding::Plain)
        }
    };

    // 进度轮询不能被缓存
    if params.contains_key(PARAM_FILENAME) {
        let headers = response.headers_mut();
        headers.insert(
            header::EXPIRES,
            HeaderValue::from_static("Tue, 08 Oct 1991 00:00:00 GMT"),
        );
        headers.insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache, must-revalidate"),
        );
    }
    (jar, response)
}

async fn dispatch(
    state: &AppState,
    session: &SessionToken,
    issued: bool,
    params: &HashMap<String, String>,
) -> Result<Response, UploadError> {
    if let Some(key) = params.get(PARAM_FILENAME) {
        return poll(state, session, key).await;
    }

    let files = state.store().session(session);
    let mut body = XmlBody::new();

    if params.contains_key(PARAM_NEW_SESSION) {
        files.ensure().await?;
        tracing::info!(session = %session, "session storage ready");
        body.text("session", "ok");
    } else if let Some(field) = params.get(PARAM_SHOW) {
        return show(state, session, field).await;
    } else if let Some(field) = params.get(PARAM_REMOVE) {
        files.remove(field).await?;
        tracing::info!(session = %session, field = %field, "file removed");
        body.text("deleted", "true");
    } else if params.contains_key(PARAM_CANCEL) {
        // 刚签发的会话不可能有进行中的上传，不记录标记
        if !issued {
            state.cancel_flags().set(session);
            tracing::info!(session = %session, "upload canceled by client");
        }
        body.text("canceled", "true");
    } else {
        return Err(UploadError::NoParameter);
    }

    Ok(body.into_response(Encoding::Plain))
}

/// 取消标记 → 进度表 → 已完成文件列表
async fn poll(
    state: &AppState,
    session: &SessionToken,
    key: &str,
) -> Result<Response, UploadError> {
    let mut body = XmlBody::new();

    if state.cancel_flags().take(session) {
        body.text("canceled", "true").text("finished", "canceled");
        return Ok(body.into_response(Encoding::Plain));
    }

    if let Some(progress) = state.progress().get(key) {
        if let Some(percent) = progress.percent() {
            body.number("percent", percent)
                .number("currentBytes", progress.received)
                .number("totalBytes", progress.total);
            if progress.is_finished() {
                body.text("finished", "ok");
            }
            return Ok(body.into_response(Encoding::Plain));
        }
    }

    // 没有进度条目：上传已经结束或从未开始
    let files = state.store().session(session);
    let mut stored = Vec::new();
    for field in files.list(key).await? {
        match files.describe(&field).await? {
            Some(file) => stored.push(file),
            None => {
                tracing::warn!(session = %session, field = %field, "stored file has no metadata");
            }
        }
    }

    if stored.is_empty() {
        return Err(UploadError::NotFound(key.to_string()));
    }
    Ok(XmlBody::manifest(&stored).into_response(Encoding::Plain))
}

/// 原样返回文件内容，不存在时返回空响应
async fn show(
    state: &AppState,
    session: &SessionToken,
    field: &str,
) -> Result<Response, UploadError> {
    let blob = match state.store().session(session).read(field).await {
        Ok(blob) => blob,
        Err(UploadError::NotFound(_)) => return Ok(Body::empty().into_response()),
        Err(e) => return Err(e),
    };

    let mut builder = Response::builder().header(header::CONTENT_LENGTH, blob.len);

    match &blob.meta {
        Some(meta) => {
            let content_type = if meta.content_type.is_empty() {
                mime_guess::from_path(&meta.name)
                    .first_or_octet_stream()
                    .to_string()
            } else {
                meta.content_type.clone()
            };

            // 对文件名进行RFC 5987编码
            let encoded_filename = percent_encode(meta.name.as_bytes(), NON_ALPHANUMERIC);
            let content_disposition = format!("inline; filename*=UTF-8''{encoded_filename}");

            builder = builder
                .header(header::CONTENT_TYPE, content_type)
                .header(header::CONTENT_DISPOSITION, content_disposition);
        }
        None => {
            builder = builder.header(header::CONTENT_TYPE, DEFAULT_CONTENT_TYPE);
        }
    }

    tracing::debug!(session = %session, field = %blob.field, bytes = blob.len, "streaming stored file");
    let stream = ReaderStream::with_capacity(blob.file, CHUNK_SIZE);
    builder
        .body(Body::from_stream(stream))
        .map_err(|e| UploadError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::server::router;
    use anyhow::{Context, Result};
    use axum::http::{Request, StatusCode};
    use bytes::Bytes;
    use futures_util::stream;
    use std::path::Path;
    use tempfile::tempdir;
    use tower::ServiceExt;
    use uuid::Uuid;

    const COOKIE: &str = "SESSIONID=querysession";

    fn test_state(root: &Path) -> AppState {
        AppState::new(Config {
            upload_dir: root.to_path_buf(),
            ..Config::default()
        })
    }

    fn token() -> Result<SessionToken> {
        SessionToken::parse("querysession").context("valid token")
    }

    async fn get(state: &AppState, query: &str) -> Result<Response> {
        let request = Request::builder()
            .uri(format!("/upload?{query}"))
            .header(header::COOKIE, COOKIE)
            .body(Body::empty())?;
        let response = router(state.clone()).oneshot(request).await?;
        assert_eq!(response.status(), StatusCode::OK);
        Ok(response)
    }

    async fn get_text(state: &AppState, query: &str) -> Result<String> {
        let response = get(state, query).await?;
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
        Ok(String::from_utf8(bytes.to_vec())?)
    }

    async fn save(state: &AppState, field: &str, data: &'static [u8]) -> Result<()> {
        let files = state.store().session(&token()?);
        files.ensure().await?;
        files
            .save(
                field,
                "report.txt",
                "text/plain",
                stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from_static(data))]),
            )
            .await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_no_parameter() -> Result<()> {
        let temp_dir = tempdir()?;
        let state = test_state(temp_dir.path());
        let body = get_text(&state, "unrelated=1").await?;
        assert!(body.contains("<error>no parameter</error>"));
        Ok(())
    }

    #[tokio::test]
    async fn test_new_session_creates_directory() -> Result<()> {
        let temp_dir = tempdir()?;
        let state = test_state(temp_dir.path());

        let body = get_text(&state, "new_session").await?;
        assert!(body.contains("<session>ok</session>"));
        assert!(temp_dir.path().join("querysession").is_dir());

        // 重复调用仍然成功
        let body = get_text(&state, "new_session=true").await?;
        assert!(body.contains("<session>ok</session>"));
        Ok(())
    }

    #[tokio::test]
    async fn test_new_cookie_is_issued_when_missing() -> Result<()> {
        let temp_dir = tempdir()?;
        let state = test_state(temp_dir.path());

        let request = Request::builder().uri("/upload?new_session").body(Body::empty())?;
        let response = router(state).oneshot(request).await?;
        let cookie = response.headers()[header::SET_COOKIE].to_str()?;
        assert!(cookie.starts_with("SESSIONID="));
        assert!(cookie.contains("HttpOnly"));
        Ok(())
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() -> Result<()> {
        let temp_dir = tempdir()?;
        let state = test_state(temp_dir.path());
        save(&state, "doc-0", b"bytes").await?;

        for _ in 0..2 {
            let body = get_text(&state, "remove=doc-0").await?;
            assert!(body.contains("<deleted>true</deleted>"));
        }
        let dir = temp_dir.path().join("querysession");
        assert!(!dir.join("doc-0.bin").exists());
        assert!(!dir.join("doc-0.info").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_show_returns_stored_bytes() -> Result<()> {
        let temp_dir = tempdir()?;
        let state = test_state(temp_dir.path());
        save(&state, "doc-0", b"exact bytes \x00\x01").await?;

        // 不带后缀的字段名退回 -0
        let response = get(&state, "show=doc").await?;
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "inline; filename*=UTF-8''report%2Etxt"
        );
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
        assert_eq!(&bytes[..], b"exact bytes \x00\x01");
        Ok(())
    }

    #[tokio::test]
    async fn test_show_missing_is_empty() -> Result<()> {
        let temp_dir = tempdir()?;
        let state = test_state(temp_dir.path());
        let body = get_text(&state, "show=nothing").await?;
        assert!(body.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_is_reported_once() -> Result<()> {
        let temp_dir = tempdir()?;
        let state = test_state(temp_dir.path());
        save(&state, "k-0", b"x").await?;

        let body = get_text(&state, "cancel").await?;
        assert!(body.contains("<canceled>true</canceled>"));

        let body = get_text(&state, "filename=k").await?;
        assert!(body.contains("<canceled>true</canceled><finished>canceled</finished>"));

        let body = get_text(&state, "filename=k").await?;
        assert!(!body.contains("canceled"));
        assert!(body.contains("<field>k-0</field>"));
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_without_cookie_records_nothing() -> Result<()> {
        let temp_dir = tempdir()?;
        let state = test_state(temp_dir.path());

        for _ in 0..3 {
            let request = Request::builder().uri("/upload?cancel").body(Body::empty())?;
            let response = router(state.clone()).oneshot(request).await?;
            assert!(response.headers().contains_key(header::SET_COOKIE));
            let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
            assert!(String::from_utf8(bytes.to_vec())?.contains("<canceled>true</canceled>"));
        }
        assert!(state.cancel_flags().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_poll_reports_progress() -> Result<()> {
        let temp_dir = tempdir()?;
        let state = test_state(temp_dir.path());
        let upload = Uuid::new_v4();

        state.progress().put("k", upload, 1, 3);
        let response = get(&state, "filename=k").await?;
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache, must-revalidate");
        assert!(response.headers().contains_key(header::EXPIRES));
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
        let body = String::from_utf8(bytes.to_vec())?;
        assert!(body.contains("<percent>33</percent><currentBytes>1</currentBytes><totalBytes>3</totalBytes>"));
        assert!(!body.contains("finished"));

        state.progress().put("k", upload, 3, 3);
        let body = get_text(&state, "filename=k").await?;
        assert!(body.contains("<percent>100</percent>"));
        assert!(body.contains("<finished>ok</finished>"));
        Ok(())
    }

    #[tokio::test]
    async fn test_poll_lists_completed_files_until_gap() -> Result<()> {
        let temp_dir = tempdir()?;
        let state = test_state(temp_dir.path());
        for field in ["k-0", "k-1", "k-3"] {
            save(&state, field, b"x").await?;
        }

        let body = get_text(&state, "filename=k").await?;
        assert!(body.contains("<field>k-0</field>"));
        assert!(body.contains("<field>k-1</field>"));
        assert!(!body.contains("<field>k-3</field>"));
        assert!(body.contains("<finished>ok</finished>"));
        Ok(())
    }

    #[tokio::test]
    async fn test_poll_unknown_key_names_it() -> Result<()> {
        let temp_dir = tempdir()?;
        let state = test_state(temp_dir.path());
        let body = get_text(&state, "filename=ghost").await?;
        assert!(body.contains("<error>ghost</error>"));
        Ok(())
    }

    #[tokio::test]
    async fn test_first_parameter_wins() -> Result<()> {
        let temp_dir = tempdir()?;
        let state = test_state(temp_dir.path());

        // filename 优先于 cancel，取消标记不会被设置
        let body = get_text(&state, "cancel&filename=ghost").await?;
        assert!(body.contains("<error>ghost</error>"));
        assert!(!state.cancel_flags().take(&token()?));

        // new_session 优先于 remove
        let body = get_text(&state, "remove=x&new_session").await?;
        assert!(body.contains("<session>ok</session>"));
        Ok(())
    }
}
