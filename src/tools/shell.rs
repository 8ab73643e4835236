//! Shell 执行器：白名单命令，禁止危险操作
//!
//! 仅允许配置中的命令名（首词，如 ls、grep、cargo）；禁止 rm -rf、wget、chmod 777 等子串。
//! 命令按引号规则切成参数后直接执行，不经过 sh：引号外的 `;` `&` `|` `<` `>` `(` `)`、
//! 以及引号外或双引号内的 `$` 与反引号一律拒绝，白名单无法被拼接命令绕过。
//! 在工作区目录下执行，超时由 ToolExecutor 统一处理。

use std::collections::HashSet;
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use crate::tools::{PermissionCategory, Tool};

/// 禁止的命令/子串（即使首词在白名单中也不允许）
const FORBIDDEN_SUBSTR: &[&str] = &[
    "rm -rf",
    "rm -fr",
    "rm -r",
    "wget ",
    "curl | sh",
    "chmod 777",
    "chmod +s",
    "mkfs",
    "dd if=",
    "> /dev/sd",
    ":(){ :|:& };:",
];

/// 单次输出保留的最大字符数
const MAX_OUTPUT_CHARS: usize = 20_000;

/// Shell 工具：仅允许白名单内命令
pub struct ShellTool {
    allowed_commands: HashSet<String>,
    workdir: PathBuf,
}

impl ShellTool {
    pub fn new(allowed_commands: Vec<String>, workdir: impl Into<PathBuf>) -> Self {
        let allowed_commands = allowed_commands
            .into_iter()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        Self {
            allowed_commands,
            workdir: workdir.into(),
        }
    }

    /// 校验并切分命令，返回 argv
    fn is_allowed(&self, raw: &str) -> Result<Vec<String>, String> {
        let raw_lower = raw.to_lowercase();
        for forbidden in FORBIDDEN_SUBSTR {
            if raw_lower.contains(forbidden) {
                return Err(format!("Forbidden pattern: {}", forbidden));
            }
        }
        let argv = split_command(raw)?;
        let Some(program) = argv.first() else {
            return Err("Empty command".to_string());
        };
        let name = program.to_lowercase();
        if self.allowed_commands.contains(&name) {
            return Ok(argv);
        }
        Err(format!("Command '{}' not in allowlist", name))
    }
}

/// 按 POSIX 引号规则切分参数；遇到需要 shell 解释的字符时报错
fn split_command(raw: &str) -> Result<Vec<String>, String> {
    #[derive(PartialEq)]
    enum Quote {
        None,
        Single,
        Double,
    }

    let mut argv = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote = Quote::None;
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        match quote {
            Quote::Single => {
                if c == '\'' {
                    quote = Quote::None;
                } else {
                    current.push(c);
                }
            }
            Quote::Double => match c {
                '"' => quote = Quote::None,
                '$' | '`' => return Err(shell_syntax_error(c)),
                '\\' => match chars.next() {
                    Some(n @ ('"' | '\\')) => current.push(n),
                    Some(n) => {
                        current.push('\\');
                        current.push(n);
                    }
                    None => return Err("Unterminated quote".to_string()),
                },
                _ => current.push(c),
            },
            Quote::None => match c {
                '\'' => {
                    quote = Quote::Single;
                    in_word = true;
                }
                '"' => {
                    quote = Quote::Double;
                    in_word = true;
                }
                '\\' => {
                    if let Some(n) = chars.next() {
                        current.push(n);
                        in_word = true;
                    }
                }
                ';' | '&' | '|' | '<' | '>' | '(' | ')' | '$' | '`' => {
                    return Err(shell_syntax_error(c));
                }
                c if c.is_whitespace() => {
                    if in_word {
                        argv.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                }
                _ => {
                    current.push(c);
                    in_word = true;
                }
            },
        }
    }
    if quote != Quote::None {
        return Err("Unterminated quote".to_string());
    }
    if in_word {
        argv.push(current);
    }
    Ok(argv)
}

fn shell_syntax_error(c: char) -> String {
    format!("Shell syntax '{c}' is not supported; run one allowlisted command without pipes, redirects or substitutions")
}

fn clip(s: &str) -> String {
    if s.chars().count() <= MAX_OUTPUT_CHARS {
        return s.to_string();
    }
    let head: String = s.chars().take(MAX_OUTPUT_CHARS).collect();
    format!("{head}\n... (output truncated)")
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Run one allowlisted command in the workspace directory (no pipes, redirects or chaining). Args: {\"command\": \"cargo test\"}"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute (first word must be in the allowlist)"
                }
            },
            "required": ["command"]
        })
    }

    fn permission(&self) -> PermissionCategory {
        PermissionCategory::Execute
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let command = args
            .get("command")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim();
        let argv = self.is_allowed(command)?;

        tracing::info!(command = %command, "shell tool execute");

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .current_dir(&self.workdir)
            .kill_on_drop(true);

        let output = cmd
            .output()
            .await
            .map_err(|e| format!("Execution failed: {}", e))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(clip(&format!(
                "Exit {}\nstdout: {}\nstderr: {}",
                output.status,
                stdout.trim(),
                stderr.trim()
            )));
        }
        Ok(clip(&if stderr.trim().is_empty() {
            stdout.to_string()
        } else {
            format!("{}\nstderr: {}", stdout.trim(), stderr.trim())
        }))
    }
}
