//! 沙箱文件系统工具
//!
//! SafeFs 绑定工作区根目录，所有路径经 resolve 校验必须在根下（禁止 ../ 逃逸）；
//! ReadFileTool / ListDirTool 为只读工具，写类工具（write_file、edit_file）同样经 SafeFs 定位文件。

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::tools::{PermissionCategory, Tool};

/// 单个文件最大读写字节数
pub const MAX_FILE_BYTES: usize = 10 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("Path escapes workspace: {0}")]
    Escape(String),

    #[error("File too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: usize },

    #[error("{op} failed for {path}: {source}")]
    Io {
        op: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// 沙箱文件系统：绑定根目录，防止路径逃逸
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

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    /// 已存在路径：规范化后必须位于根下
    pub fn resolve(&self, path: &str) -> Result<PathBuf, FsError> {
        let rel = path.trim().trim_start_matches("./");
        let full = self.root_dir.join(rel);
        let canonical = full
            .canonicalize()
            .map_err(|_| FsError::NotFound(rel.to_string()))?;
        if canonical.starts_with(&self.root_dir) {
            Ok(canonical)
        } else {
            Err(FsError::Escape(rel.to_string()))
        }
    }

    /// 待写入路径：文件可以不存在，但不允许 `..` 或绝对路径跳出根目录
    pub fn resolve_for_write(&self, path: &str) -> Result<PathBuf, FsError> {
        let rel = Path::new(path.trim());
        let mut out = self.root_dir.clone();
        for comp in rel.components() {
            match comp {
                Component::Normal(part) => out.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !out.pop() || !out.starts_with(&self.root_dir) {
                        return Err(FsError::Escape(path.to_string()));
                    }
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(FsError::Escape(path.to_string()))
                }
            }
        }
        if !out.starts_with(&self.root_dir) || out == self.root_dir {
            return Err(FsError::Escape(path.to_string()));
        }
        // 已存在的文件可能是指向根外的符号链接
        if out.exists() {
            return self.resolve(path);
        }
        Ok(out)
    }

    pub fn read_file(&self, path: &str) -> Result<String, FsError> {
        let resolved = self.resolve(path)?;
        let size = std::fs::metadata(&resolved)
            .map(|m| m.len())
            .map_err(|e| io_err("stat", &resolved, e))?;
        if size > MAX_FILE_BYTES as u64 {
            return Err(FsError::TooLarge {
                size,
                max: MAX_FILE_BYTES,
            });
        }
        std::fs::read_to_string(&resolved).map_err(|e| io_err("read", &resolved, e))
    }

    /// 读取文件；不存在时返回 None（写入新文件前计算 diff 用）
    pub fn read_existing(&self, path: &str) -> Result<Option<String>, FsError> {
        let target = self.resolve_for_write(path)?;
        if !target.exists() {
            return Ok(None);
        }
        std::fs::read_to_string(&target)
            .map(Some)
            .map_err(|e| io_err("read", &target, e))
    }

    pub fn write_file(&self, path: &str, content: &str) -> Result<PathBuf, FsError> {
        if content.len() > MAX_FILE_BYTES {
            return Err(FsError::TooLarge {
                size: content.len() as u64,
                max: MAX_FILE_BYTES,
            });
        }
        let target = self.resolve_for_write(path)?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_err("mkdir", parent, e))?;
        }
        std::fs::write(&target, content).map_err(|e| io_err("write", &target, e))?;
        Ok(target)
    }

    pub fn list_dir(&self, path: &str) -> Result<Vec<String>, FsError> {
        let base = if path.trim().is_empty() || path.trim() == "." {
            self.root_dir.clone()
        } else {
            self.resolve(path)?
        };
        let mut entries = Vec::new();
        for e in std::fs::read_dir(&base).map_err(|e| io_err("list", &base, e))? {
            let e = e.map_err(|e| io_err("list", &base, e))?;
            let name = e.file_name().to_string_lossy().to_string();
            if !name.starts_with('.') {
                let ty = if e.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    "/"
                } else {
                    ""
                };
                entries.push(format!("{}{}", name, ty));
            }
        }
        entries.sort();
        Ok(entries)
    }
}

fn io_err(op: &'static str, path: &Path, source: std::io::Error) -> FsError {
    FsError::Io {
        op,
        path: path.display().to_string(),
        source,
    }
}

/// 读取文件内容
pub struct ReadFileTool {
    fs: SafeFs,
}

impl ReadFileTool {
    pub fn new(fs: SafeFs) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a UTF-8 text file from the workspace. Args: {\"path\": \"file path relative to workspace\"}"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "File path relative to the workspace root"}
            },
            "required": ["path"]
        })
    }

    fn permission(&self) -> PermissionCategory {
        PermissionCategory::ReadOnly
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let path = args.get("path").and_then(|v| v.as_str()).unwrap_or("");
        tracing::debug!(path = %path, "read_file");
        self.fs.read_file(path).map_err(|e| e.to_string())
    }
}

/// 列出目录（隐藏文件除外，目录以 / 结尾）
pub struct ListDirTool {
    fs: SafeFs,
}

impl ListDirTool {
    pub fn new(fs: SafeFs) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List a workspace directory. Args: {\"path\": \"directory path, default '.'\"}"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Directory relative to the workspace root"}
            }
        })
    }

    fn permission(&self) -> PermissionCategory {
        PermissionCategory::ReadOnly
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let path = args.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        let entries = self.fs.list_dir(path).map_err(|e| e.to_string())?;
        if entries.is_empty() {
            return Ok("(empty directory)".to_string());
        }
        Ok(entries.join("\n"))
    }
}
