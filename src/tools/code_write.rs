//! 文件写入工具 - 创建或覆盖工作区内的文件
//!
//! 写类工具：确认前用 similar 生成统一 diff 展示给用户。

use async_trait::async_trait;
use serde_json::Value;
use similar::TextDiff;

use crate::tools::{PermissionCategory, SafeFs, Tool};

/// 生成统一 diff（a/ b/ 前缀，3 行上下文）；内容相同时返回 None
pub fn render_diff(path: &str, old: &str, new: &str) -> Option<String> {
    if old == new {
        return None;
    }
    let diff = TextDiff::from_lines(old, new);
    let text = diff
        .unified_diff()
        .context_radius(3)
        .header(&format!("a/{path}"), &format!("b/{path}"))
        .to_string();
    Some(text)
}

/// 写文件工具
pub struct WriteFileTool {
    fs: SafeFs,
}

impl WriteFileTool {
    pub fn new(fs: SafeFs) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        r#"Create or overwrite a file in the workspace. Parent directories are created automatically.

Args:
- path: file path relative to the workspace
- content: full new file content

Example:
{"path": "src/lib.rs", "content": "pub fn hello() {}\n"}"#
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "content": {"type": "string"}
            },
            "required": ["path", "content"]
        })
    }

    fn permission(&self) -> PermissionCategory {
        PermissionCategory::Write
    }

    async fn propose_diff(&self, args: &Value) -> Option<String> {
        let path = args.get("path")?.as_str()?;
        let content = args.get("content")?.as_str()?;
        let old = self.fs.read_existing(path).ok()?.unwrap_or_default();
        render_diff(path, &old, content)
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let path = args
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or("Missing required parameter: path")?;
        let content = args
            .get("content")
            .and_then(|v| v.as_str())
            .ok_or("Missing required parameter: content")?;

        let existed = self
            .fs
            .read_existing(path)
            .map_err(|e| e.to_string())?
            .is_some();
        let written = self.fs.write_file(path, content).map_err(|e| e.to_string())?;
        tracing::info!(path = %written.display(), bytes = content.len(), "write_file");

        Ok(format!(
            "{} {} ({} bytes)",
            if existed { "Overwrote" } else { "Created" },
            path,
            content.len()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_diff_marks_changes() {
        let d = render_diff("a.txt", "one\ntwo\n", "one\nthree\n").unwrap();
        assert!(d.contains("--- a/a.txt"));
        assert!(d.contains("-two"));
        assert!(d.contains("+three"));
        assert!(render_diff("a.txt", "same", "same").is_none());
    }

    #[tokio::test]
    async fn test_write_then_diff_against_existing() {
        let dir = tempfile::tempdir().unwrap();
        let tool = WriteFileTool::new(SafeFs::new(dir.path()));
        let args = json!({"path": "notes.md", "content": "hello\n"});

        let diff = tool.propose_diff(&args).await.unwrap();
        assert!(diff.contains("+hello"));

        let out = tool.execute(args.clone()).await.unwrap();
        assert!(out.starts_with("Created"));
        assert!(tool.propose_diff(&args).await.is_none());

        let out = tool
            .execute(json!({"path": "notes.md", "content": "bye\n"}))
            .await
            .unwrap();
        assert!(out.starts_with("Overwrote"));
        assert_eq!(std::fs::read_to_string(dir.path().join("notes.md")).unwrap(), "bye\n");
    }
}
