use std::fmt::Display;

use axum::http::header;
use axum::response::{IntoResponse, Response};

use crate::store::StoredFile;

pub const XML_DECLARATION: &str = r#"<?xml version="1.0" encoding="ISO-8859-1"?>"#;

// iframe 传输使用的哨兵标记，客户端负责还原
pub const MSG_START: &str = "%%%INI%%%";
pub const MSG_END: &str = "%%%END%%%";
pub const LT_SENTINEL: &str = "@@@";
pub const GT_SENTINEL: &str = "___";

/// 响应体编码策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// GET 请求：原样 XML
    Plain,
    /// POST 请求：替换尖括号并包裹在哨兵中，旧式 iframe 上传才能读到完整内容
    IframeSafe,
}

impl Encoding {
    fn content_type(self) -> &'static str {
        match self {
            Encoding::Plain => "text/xml",
            Encoding::IframeSafe => "text/html",
        }
    }
}

/// `<response>` 内部内容的顺序构建器
#[derive(Debug, Default)]
pub struct XmlBody {
    buf: String,
}

impl XmlBody {
    pub fn new() -> Self {
        Self::default()
    }

    /// 写入一个文本元素，值会做实体转义
    pub fn text(&mut self, tag: &str, value: &str) -> &mut Self {
        let escaped = html_escape::encode_text(value);
        self.buf.push_str(&format!("<{tag}>{escaped}</{tag}>"));
        self
    }

    /// 写入一个数值元素
    pub fn number(&mut self, tag: &str, value: impl Display) -> &mut Self {
        self.buf.push_str(&format!("<{tag}>{value}</{tag}>"));
        self
    }

    /// 写入 `<files>` 清单
    pub fn files<'a>(&mut self, files: impl IntoIterator<Item = &'a StoredFile>) -> &mut Self {
        self.buf.push_str("<files>\n");
        for file in files {
            self.buf.push_str(" <file>");
            self.text("field", &file.field)
                .text("name", &file.name)
                .text("ctype", &file.content_type)
                .number("size", file.size);
            self.buf.push_str("</file>\n");
        }
        self.buf.push_str("</files>\n");
        self
    }

    /// 上传结果和已完成文件列表共用的清单格式
    pub fn manifest(files: &[StoredFile]) -> Self {
        let mut body = Self::new();
        body.text(
            "message",
            concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION")),
        )
        .files(files)
        .text("finished", "ok");
        body
    }

    pub fn render(&self, encoding: Encoding) -> String {
        let xml = format!("{XML_DECLARATION}\n<response>\n{}\n</response>\n", self.buf);
        encode(&xml, encoding)
    }

    pub fn into_response(self, encoding: Encoding) -> Response {
        xml_response(self.render(encoding), encoding)
    }
}

/// 按编码策略处理完整的 XML 文档
pub fn encode(xml: &str, encoding: Encoding) -> String {
    match encoding {
        Encoding::Plain => xml.to_string(),
        Encoding::IframeSafe => {
            let escaped = xml.replace('<', LT_SENTINEL).replace('>', GT_SENTINEL);
            format!("{MSG_START}{escaped}{MSG_END}")
        }
    }
}

/// `encode` 的逆过程，对应客户端的还原逻辑
pub fn decode_iframe_safe(body: &str) -> Option<String> {
    let start = body.find(MSG_START)? + MSG_START.len();
    let end = body[start..].find(MSG_END)? + start;
    Some(
        body[start..end]
            .replace(LT_SENTINEL, "<")
            .replace(GT_SENTINEL, ">"),
    )
}

/// 所有 XML 响应都是 200，错误体现在 `<error>` 元素里
pub fn xml_response(body: String, encoding: Encoding) -> Response {
    ([(header::CONTENT_TYPE, encoding.content_type())], body).into_response()
}
