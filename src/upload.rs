use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap};
use axum::response::Response;
use axum_extra::extract::cookie::CookieJar;
use multer::{parse_boundary, Constraints, SizeLimit};

use crate::error::UploadError;
use crate::response::{xml_response, Encoding, XmlBody};
use crate::session::{self, SessionToken};
use crate::state::AppState;
use crate::store::{sanitize_field, StoredFile};
use crate::transport::{KeyedProgress, ProgressBody};

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// 单个 POST 请求的处理阶段
#[derive(Debug)]
enum Phase {
    /// 还没有拿到进度 key
    AwaitingKey,
    /// 已拿到 key，`next_index` 是下一个文件的序号
    Streaming { key: String, next_index: usize },
}

/// 去掉数组标记，`files[]` 与 `files` 视为同一个字段
fn strip_array_marker(name: &str) -> String {
    name.replace("[]", "")
}

/// POST：接收 multipart 上传，返回 iframe 安全编码的文件清单
pub async fn handle_upload(
    State(state): State<AppState>,
    jar: CookieJar,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Body,
) -> (CookieJar, Response) {
    let (jar, session) = session::resolve(jar, &state.config().session_cookie);
    let session = session.token;

    // 新的上传开始时复位取消标记
    state.cancel_flags().clear(&session);

    let response = match receive(&state, &session, &params, &headers, body).await {
        Ok(files) => {
            tracing::info!(session = %session, files = files.len(), "upload completed");
            XmlBody::manifest(&files).into_response(Encoding::IframeSafe)
        }
        Err(e) => {
            tracing::warn!(session = %session, error = %e, "upload rejected");
            xml_response(e.to_xml(Encoding::IframeSafe), Encoding::IframeSafe)
        }
    };
    (jar, response)
}

async fn receive(
    state: &AppState,
    session: &SessionToken,
    params: &HashMap<String, String>,
    headers: &HeaderMap,
    body: Body,
) -> Result<Vec<StoredFile>, UploadError> {
    let config = state.config();

    // 1. 解析 boundary 和请求大小
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| UploadError::Malformed("missing Content-Type".to_string()))?;
    let boundary = parse_boundary(content_type)?;

    let total = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);

    let limit = config.size_limit();
    if let Some(limit) = limit {
        if total > limit {
            return Err(UploadError::SizeLimitExceeded { limit });
        }
    }

    // 2. 在请求体外挂上字节计数
    let hook = Arc::new(KeyedProgress::new(state.progress().clone(), total));
    let mut phase = Phase::AwaitingKey;
    if let Some(key) = params.get(&config.progress_field).filter(|k| !k.is_empty()) {
        hook.bind(key);
        phase = Phase::Streaming {
            key: key.clone(),
            next_index: 0,
        };
    }

    let stream = ProgressBody::new(body.into_data_stream(), hook.clone());
    let constraints = match limit {
        Some(limit) => Constraints::new().size_limit(SizeLimit::new().whole_stream(limit)),
        None => Constraints::new(),
    };
    let mut multipart = multer::Multipart::with_constraints(stream, boundary, constraints);

    let files = state.store().session(session);
    files.ensure().await?;

    // 3. 按提交顺序处理每个字段
    let mut stored = Vec::new();
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();

        let Some(filename) = field.file_name().map(str::to_string) else {
            if name == config.progress_field && matches!(phase, Phase::AwaitingKey) {
                let key = field.text().await?;
                if !key.is_empty() {
                    hook.bind(&key);
                    phase = Phase::Streaming { key, next_index: 0 };
                }
            }
            continue;
        };

        let Phase::Streaming { key, next_index } = &mut phase else {
            tracing::debug!(session = %session, part = %name, "file part before progress key, skipped");
            continue;
        };
        let base = strip_array_marker(key);
        if strip_array_marker(&name) != base {
            continue;
        }

        let index = *next_index;
        *next_index += 1;
        let field_name = format!("{}-{index}", sanitize_field(&base));

        // 没有选择文件的输入框：占用序号但不保存
        if filename.is_empty() {
            tracing::debug!(session = %session, field = %field_name, "empty file part");
            continue;
        }

        let content_type = field
            .content_type()
            .map(|mime| mime.to_string())
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());

        // 单个文件失败不影响后续文件，清单里直接省略
        match files.save(&field_name, &filename, &content_type, field).await {
            Ok(file) => {
                tracing::info!(
                    session = %session,
                    field = %file.field,
                    name = %file.name,
                    size = %humansize::format_size(file.size, humansize::BINARY),
                    "file stored"
                );
                stored.push(file);
            }
            Err(e) => {
                tracing::warn!(session = %session, field = %field_name, error = %e, "failed to store file");
            }
        }
    }

    // 4. 根据最终阶段决定结果
    match phase {
        Phase::AwaitingKey => Err(UploadError::MissingParameter(config.progress_field.clone())),
        Phase::Streaming { key, next_index: 0 } => Err(UploadError::UnknownProgressKey(key)),
        Phase::Streaming { .. } => Ok(stored),
    }
}
