//! 可观测性：tracing 日志初始化
//!
//! 默认级别 info，可通过 RUST_LOG 覆盖。CLI 写 stderr（stdout 只留给最终回答）；
//! TUI 占用终端，日志写入工作区下的文件。

use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::Mutex;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 日志输出位置
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    Stderr,
    File(PathBuf),
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn open_log_file(path: &PathBuf) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// 安装全局 subscriber；重复调用时静默忽略
pub fn init(target: LogTarget) -> std::io::Result<()> {
    match target {
        LogTarget::Stderr => {
            let _ = tracing_subscriber::registry()
                .with(env_filter())
                .with(fmt::layer().with_writer(std::io::stderr))
                .try_init();
        }
        LogTarget::File(path) => {
            let file = open_log_file(&path)?;
            let _ = tracing_subscriber::registry()
                .with(env_filter())
                .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
                .try_init();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_file_parent_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".beecode").join("beecode.log");
        open_log_file(&path).unwrap();
        assert!(path.exists());
    }
}
