//! 文件编辑工具 - 精确字符串替换
//!
//! old_string 必须在文件中唯一出现（除非 replace_all=true）；确认前展示替换后的 diff。

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::code_write::render_diff;
use crate::tools::{PermissionCategory, SafeFs, Tool};

/// 编辑文件工具
pub struct EditFileTool {
    fs: SafeFs,
}

struct EditArgs<'a> {
    path: &'a str,
    old_string: &'a str,
    new_string: &'a str,
    replace_all: bool,
}

impl<'a> EditArgs<'a> {
    fn parse(args: &'a Value) -> Result<Self, String> {
        Ok(Self {
            path: str_field(args, "path")?,
            old_string: str_field(args, "old_string")?,
            new_string: str_field(args, "new_string")?,
            replace_all: args
                .get("replace_all")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        })
    }
}

fn str_field<'a>(args: &'a Value, key: &str) -> Result<&'a str, String> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| format!("Missing required parameter: {key}"))
}

impl EditFileTool {
    pub fn new(fs: SafeFs) -> Self {
        Self { fs }
    }

    /// 计算替换结果：(原内容, 新内容, 替换次数)
    fn apply(&self, edit: &EditArgs<'_>) -> Result<(String, String, usize), String> {
        if edit.old_string.is_empty() {
            return Err("old_string must not be empty".to_string());
        }
        let original = self.fs.read_file(edit.path).map_err(|e| e.to_string())?;
        let count = original.matches(edit.old_string).count();
        match count {
            0 => Err(format!("old_string not found in {}", edit.path)),
            n if n > 1 && !edit.replace_all => Err(format!(
                "old_string occurs {n} times in {}; add more context or set replace_all=true",
                edit.path
            )),
            n => {
                let updated = if edit.replace_all {
                    original.replace(edit.old_string, edit.new_string)
                } else {
                    original.replacen(edit.old_string, edit.new_string, 1)
                };
                Ok((original, updated, n))
            }
        }
    }
}

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        r#"Replace an exact snippet in an existing file.

Args:
- path: file path relative to the workspace
- old_string: exact text to replace (must be unique unless replace_all is true)
- new_string: replacement text
- replace_all: replace every occurrence (optional, default false)"#
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "old_string": {"type": "string"},
                "new_string": {"type": "string"},
                "replace_all": {"type": "boolean"}
            },
            "required": ["path", "old_string", "new_string"]
        })
    }

    fn permission(&self) -> PermissionCategory {
        PermissionCategory::Write
    }

    async fn propose_diff(&self, args: &Value) -> Option<String> {
        let edit = EditArgs::parse(args).ok()?;
        let (old, new, _) = self.apply(&edit).ok()?;
        render_diff(edit.path, &old, &new)
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let edit = EditArgs::parse(&args)?;
        let (_, updated, count) = self.apply(&edit)?;
        self.fs
            .write_file(edit.path, &updated)
            .map_err(|e| e.to_string())?;
        tracing::info!(path = %edit.path, replacements = count, "edit_file");
        Ok(format!(
            "Edited {} ({} replacement{})",
            edit.path,
            count,
            if count == 1 { "" } else { "s" }
        ))
    }
}
