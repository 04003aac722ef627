//! 按会话划分的文件存储
//!
//! 每个会话一个目录，每个字段两个文件：
//! - `<field>.bin` 上传的原始数据
//! - `<field>.info` 原始文件名、content-type、大小，每行一项
//!
//! 目录的清理由外部负责，这里从不主动删除会话目录。

use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use futures_util::{Stream, TryStreamExt};
use tokio::fs::{self, File};
use tokio_util::io::StreamReader;

use crate::error::UploadError;
use crate::session::SessionToken;

/// 已保存文件的元数据
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub field: String,
    pub name: String,
    pub content_type: String,
    pub size: u64,
}

/// 读取时返回的数据和可选的元数据
#[derive(Debug)]
pub struct StoredBlob {
    /// 实际命中的字段名（可能是 `<field>-0`）
    pub field: String,
    pub meta: Option<StoredFile>,
    pub len: u64,
    pub file: File,
}

/// 所有会话目录的根
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 会话到存储句柄的映射，不做任何 IO
    pub fn session(&self, token: &SessionToken) -> SessionFiles {
        SessionFiles {
            dir: self.root.join(token.as_str()),
        }
    }
}

/// 单个会话的文件存储句柄
#[derive(Debug, Clone)]
pub struct SessionFiles {
    dir: PathBuf,
}

/// 字段名只能是单个路径分量
pub fn sanitize_field(field: &str) -> String {
    sanitize_filename::sanitize(field)
}

// 写进 sidecar 的值不能带换行，否则行格式会错位
fn single_line(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}

impl SessionFiles {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn blob_path(&self, field: &str) -> PathBuf {
        self.dir.join(format!("{field}.bin"))
    }

    fn info_path(&self, field: &str) -> PathBuf {
        self.dir.join(format!("{field}.info"))
    }

    async fn has_blob(&self, field: &str) -> io::Result<bool> {
        fs::try_exists(self.blob_path(field)).await
    }

    /// 幂等地创建会话目录（仅当前用户可访问）
    pub async fn ensure(&self) -> Result<(), UploadError> {
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(0o700);

        match builder.create(&self.dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(UploadError::StorageFailure(e)),
        }
    }

    /// 流式写入数据和 sidecar 的临时文件，全部成功后再依次替换；
    /// 失败时旧的数据和 sidecar 保持不变
    pub async fn save<S, E>(
        &self,
        field: &str,
        filename: &str,
        content_type: &str,
        source: S,
    ) -> Result<StoredFile, UploadError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let field = sanitize_field(field);
        let blob = self.blob_path(&field);
        let info = self.info_path(&field);
        let blob_staging = self.dir.join(format!("{field}.bin.part"));
        let info_staging = self.dir.join(format!("{field}.info.part"));

        let reader = StreamReader::new(source.map_err(io::Error::other));
        tokio::pin!(reader);
        let committed = async {
            // 1. 数据写到临时文件
            let mut file = File::create(&blob_staging).await?;
            let size = tokio::io::copy(&mut reader, &mut file).await?;
            file.sync_all().await?;
            drop(file);

            // 2. sidecar 同样先写临时文件
            let stored = StoredFile {
                field: field.clone(),
                name: single_line(filename),
                content_type: single_line(content_type),
                size,
            };
            fs::write(
                &info_staging,
                format!("{}\n{}\n{}\n", stored.name, stored.content_type, stored.size),
            )
            .await?;

            // 3. 先替换数据，再替换 sidecar
            fs::rename(&blob_staging, &blob).await?;
            fs::rename(&info_staging, &info).await?;
            Ok::<_, io::Error>(stored)
        }
        .await;

        match committed {
            Ok(stored) => Ok(stored),
            Err(e) => {
                let _ = remove_if_exists(&blob_staging).await;
                let _ = remove_if_exists(&info_staging).await;
                Err(UploadError::StorageFailure(e))
            }
        }
    }

    /// 按上传协议列出字段：先是不带后缀的名字，然后是 `-0`、`-1`……，
    /// 遇到第一个缺失的序号就停止，不做目录扫描
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>, UploadError> {
        let prefix = sanitize_field(prefix);
        let mut fields = Vec::new();

        if self.has_blob(&prefix).await? {
            fields.push(prefix.clone());
        }
        for index in 0.. {
            let field = format!("{prefix}-{index}");
            if !self.has_blob(&field).await? {
                break;
            }
            fields.push(field);
        }

        Ok(fields)
    }

    /// 读取 sidecar；不存在时返回 None
    pub async fn describe(&self, field: &str) -> Result<Option<StoredFile>, UploadError> {
        let field = sanitize_field(field);
        let content = match fs::read_to_string(self.info_path(&field)).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut lines = content.lines().map(str::trim_end);
        let name = lines.next().unwrap_or_default().to_string();
        let content_type = lines.next().unwrap_or_default().to_string();
        let size = lines
            .next()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();

        Ok(Some(StoredFile {
            field,
            name,
            content_type,
            size,
        }))
    }

    /// 打开字段数据，找不到时退回 `<field>-0`
    pub async fn read(&self, field: &str) -> Result<StoredBlob, UploadError> {
        let requested = sanitize_field(field);
        let fallback = format!("{requested}-0");

        let resolved = if self.has_blob(&requested).await? {
            requested
        } else if self.has_blob(&fallback).await? {
            fallback
        } else {
            return Err(UploadError::NotFound(field.to_string()));
        };

        let file = File::open(self.blob_path(&resolved)).await?;
        let len = file.metadata().await?.len();
        let meta = self.describe(&resolved).await?;

        Ok(StoredBlob {
            field: resolved,
            meta,
            len,
            file,
        })
    }

    /// 删除数据和 sidecar，不存在也算成功
    pub async fn remove(&self, field: &str) -> Result<(), UploadError> {
        let field = sanitize_field(field);
        remove_if_exists(&self.blob_path(&field)).await?;
        remove_if_exists(&self.info_path(&field)).await?;
        Ok(())
    }
}

async fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
