//! Beecode - Rust 编码助手：对话编排引擎
//!
//! 模块划分：
//! - **cli**: 单次阻塞式会话（控制台确认、事件打印）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误与恢复、引擎构建、状态投影、会话监管、任务调度、TUI 主控循环
//! - **engine**: 对话主循环、工具调用提取、检查点编排、事件与调度驱动
//! - **llm**: 模型客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **memory**: 会话历史、消息契约、检查点存储
//! - **observability**: tracing 日志初始化
//! - **tools**: 工具箱（read_file、list_dir、write_file、edit_file、shell、finish）、权限策略与执行器
//! - **ui**: Ratatui TUI 界面

pub mod cli;
pub mod config;
pub mod core;
pub mod engine;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod tools;
pub mod ui;
