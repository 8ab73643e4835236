pub mod code_edit;
pub mod code_write;
pub mod confirm;
pub mod executor;
pub mod filesystem;
pub mod finish;
pub mod registry;
pub mod schema;
pub mod shell;

use std::path::Path;

pub use code_edit::EditFileTool;
pub use code_write::{render_diff, WriteFileTool};
pub use confirm::{
    AutoApprove, ConfirmDecision, Confirmer, DenyAll, PermissionDecision, PermissionPolicy,
    ScriptedConfirmer,
};
pub use executor::{
    aggregate_fallback_results, BatchContext, BatchOutcome, DeclineReason, ToolCallResult,
    ToolError, ToolExecutor, ToolProgress, ToolStatus,
};
pub use filesystem::{FsError, ListDirTool, ReadFileTool, SafeFs};
pub use finish::FinishTool;
pub use registry::{PermissionCategory, Tool, ToolRegistry};
pub use schema::{fallback_call_schema_json, validate_arguments};
pub use shell::ShellTool;

/// 内置工具集：read_file / list_dir / write_file / edit_file / shell / finish
pub fn builtin_registry(workspace: &Path, shell_allowlist: Vec<String>) -> ToolRegistry {
    let fs = SafeFs::new(workspace);
    let mut registry = ToolRegistry::new();
    registry.register(ReadFileTool::new(fs.clone()));
    registry.register(ListDirTool::new(fs.clone()));
    registry.register(WriteFileTool::new(fs.clone()));
    registry.register(EditFileTool::new(fs.clone()));
    registry.register(ShellTool::new(shell_allowlist, fs.root().to_path_buf()));
    registry.register(FinishTool);
    registry
}
