//! 沙箱文件系统工具
//!
//! SafeFs 绑定 root_dir，所有路径经 resolve 校验必须在 root 下（禁止 ../ 逃逸）；
//! ReadFileTool / ListDirTool 基于 SafeFs 提供只读访问。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::tools::schema::{parameters_schema, parse_args};
use crate::tools::Tool;

/// 单次读取的最大字符数，超出截断
const MAX_READ_CHARS: usize = 20_000;

/// 沙箱文件系统：绑定根目录，resolve 校验路径在根下，防止路径逃逸
#[derive(Debug, Clone)]
pub struct SafeFs {
    root_dir: PathBuf,
}

impl SafeFs {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        let root = root_dir.as_ref().to_path_buf();
        let root_dir = root.canonicalize().unwrap_or(root);
        Self { root_dir }
    }

    /// 解析相对路径并检查仍在沙箱内
    pub fn resolve(&self, path: &str) -> Result<PathBuf, String> {
        let path = path.trim().trim_start_matches("./");
        let full = self.root_dir.join(path);
        let canonical = full
            .canonicalize()
            .map_err(|_| format!("Path not found: {}", path))?;
        if canonical.starts_with(&self.root_dir) {
            Ok(canonical)
        } else {
            Err(format!("Path escapes workspace: {}", path)) // 如 ../../etc/passwd
        }
    }

    pub async fn read_file(&self, path: &str) -> Result<String, String> {
        let resolved = self.resolve(path)?;
        tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| format!("Read failed: {}", e))
    }

    pub async fn list_dir(&self, path: &str) -> Result<Vec<String>, String> {
        let base = if path.trim().is_empty() || path.trim() == "." {
            self.root_dir.clone()
        } else {
            self.resolve(path)?
        };
        let mut dir = tokio::fs::read_dir(&base)
            .await
            .map_err(|e| format!("List failed: {}", e))?;
        let mut entries = Vec::new();
        while let Some(e) = dir.next_entry().await.map_err(|e| e.to_string())? {
            let name = e.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            let is_dir = e.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            entries.push(if is_dir { format!("{}/", name) } else { name });
        }
        entries.sort();
        Ok(entries)
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct PathArgs {
    /// Path relative to the workspace root
    #[serde(default)]
    path: String,
}

/// read_file：读取工作区内的文本文件
pub struct ReadFileTool {
    fs: SafeFs,
}

impl ReadFileTool {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
        }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file from the user's workspace."
    }

    fn parameters_schema(&self) -> Value {
        parameters_schema::<PathArgs>()
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let args: PathArgs = parse_args(self.name(), args)?;
        tracing::info!(path = %args.path, "read_file tool execute");
        let content = self.fs.read_file(&args.path).await?;
        let truncated = content.chars().count() > MAX_READ_CHARS;
        let content: String = content.chars().take(MAX_READ_CHARS).collect();
        Ok(json!({"path": args.path, "content": content, "truncated": truncated}))
    }
}

/// list_dir：列出工作区目录
pub struct ListDirTool {
    fs: SafeFs,
}

impl ListDirTool {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
        }
    }
}

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List entries of a directory in the user's workspace (default: workspace root)."
    }

    fn parameters_schema(&self) -> Value {
        parameters_schema::<PathArgs>()
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let args: PathArgs = parse_args(self.name(), args)?;
        tracing::info!(path = %args.path, "list_dir tool execute");
        let entries = self.fs.list_dir(&args.path).await?;
        Ok(json!({"entries": entries}))
    }
}
