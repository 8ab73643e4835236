//! 记忆层：会话历史、消息契约、检查点存储

pub mod checkpoint;
pub mod contract;
pub mod conversation;

pub use checkpoint::{
    Checkpoint, CheckpointError, CheckpointLock, CheckpointStore, FileCheckpointStore,
    InMemoryCheckpointStore, DEFAULT_LOCK_STALE_AFTER,
};
pub use contract::{
    get_content, get_role, get_tool_call_id, get_tool_calls, to_canonical_record, CanonicalRecord,
    MessageView, RawContent, RawToolCalls,
};
pub use conversation::{Conversation, Message, Role, ToolCallRequest};
