//! 检查点存储
//!
//! 检查点是对话压缩后的摘要：summary_text + cycle_count（代数，只增不减）+ 存在标记。
//! clear 只撤下存在标记，保留代数，保证下一次写入的 cycle_count 继续递增。
//! FileCheckpointStore 以单个 JSON 文件持久化（临时文件 + rename 原子写入），
//! 并用同目录下的 `.lock` 文件（create_new）实现跨会话的独占锁。
//! 锁文件记录持有者 PID；持有进程已退出或锁文件超过 stale_after 未更新时视为陈旧锁并回收。

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 存储层错误
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("checkpoint file is corrupt: {0}")]
    Corrupt(String),

    #[error("no checkpoint to read")]
    Missing,

    #[error("checkpoint lock is held by another session")]
    LockHeld,
}

/// 持久化的检查点
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub summary_text: String,
    pub cycle_count: u64,
    /// 存在标记：clear 后为 false，但代数保留
    #[serde(default = "default_active")]
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

fn default_active() -> bool {
    true
}

/// 独占锁守卫：drop 时释放（所有退出路径，包括失败与 panic 展开）
pub struct CheckpointLock {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl CheckpointLock {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }
}

impl Drop for CheckpointLock {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for CheckpointLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointLock")
            .field("held", &self.release.is_some())
            .finish()
    }
}

/// 检查点存储协作者：exists / read / write / clear + 独占锁
pub trait CheckpointStore: Send + Sync {
    fn exists(&self) -> bool;

    fn read(&self) -> Result<Checkpoint, CheckpointError>;

    /// 写入新摘要，返回新的 cycle_count（上一代 + 1）
    fn write(&self, summary_text: &str) -> Result<u64, CheckpointError>;

    fn clear(&self) -> Result<(), CheckpointError>;

    /// 尝试获取独占锁；已被占用时返回 LockHeld（由调用方做有界重试）
    fn try_lock(&self) -> Result<CheckpointLock, CheckpointError>;
}

/// 默认陈旧锁阈值
pub const DEFAULT_LOCK_STALE_AFTER: Duration = Duration::from_secs(600);

/// 文件存储：path 为检查点 JSON，`<path>.lock` 为锁文件
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    path: PathBuf,
    stale_after: Duration,
}

impl FileCheckpointStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            stale_after: DEFAULT_LOCK_STALE_AFTER,
        }
    }

    /// 锁文件超过该时长未更新即视为陈旧
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "checkpoint".into());
        name.push(".lock");
        self.path.with_file_name(name)
    }

    fn io_err(path: &Path, source: std::io::Error) -> CheckpointError {
        CheckpointError::Io {
            path: path.display().to_string(),
            source,
        }
    }

    fn load_raw(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&self.path).map_err(|e| Self::io_err(&self.path, e))?;
        serde_json::from_str(&data)
            .map(Some)
            .map_err(|e| CheckpointError::Corrupt(e.to_string()))
    }

    /// 陈旧锁：持有进程已不存在，或锁文件年龄超过 stale_after
    fn lock_is_stale(&self, lock_path: &Path) -> bool {
        let aged = std::fs::metadata(lock_path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.elapsed().ok())
            .is_some_and(|age| age >= self.stale_after);
        if aged {
            return true;
        }
        let holder = std::fs::read_to_string(lock_path)
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok());
        match holder {
            Some(pid) => !process_alive(pid),
            // 空文件：持有者可能刚创建还未写入 PID
            None => false,
        }
    }

    fn create_lock(&self, lock_path: &Path) -> std::io::Result<CheckpointLock> {
        let mut file = std::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(lock_path)?;
        use std::io::Write;
        let _ = file.write_all(std::process::id().to_string().as_bytes());
        let lock_path = lock_path.to_path_buf();
        Ok(CheckpointLock::new(move || {
            let _ = std::fs::remove_file(&lock_path);
        }))
    }

    fn save_raw(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent).map_err(|e| Self::io_err(parent, e))?;
        let body = serde_json::to_string_pretty(checkpoint)
            .map_err(|e| CheckpointError::Corrupt(e.to_string()))?;
        let tmp = parent.join(format!(
            ".{}.tmp-{}",
            self.path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("checkpoint"),
            std::process::id()
        ));
        std::fs::write(&tmp, body).map_err(|e| Self::io_err(&tmp, e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| Self::io_err(&self.path, e))
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn exists(&self) -> bool {
        match self.load_raw() {
            Ok(Some(c)) => c.active,
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "checkpoint unreadable");
                false
            }
        }
    }

    fn read(&self) -> Result<Checkpoint, CheckpointError> {
        match self.load_raw()? {
            Some(c) if c.active => Ok(c),
            _ => Err(CheckpointError::Missing),
        }
    }

    fn write(&self, summary_text: &str) -> Result<u64, CheckpointError> {
        // 损坏的文件不能当作第 0 代覆盖，否则 cycle_count 会倒退
        let previous = self.load_raw()?.map(|c| c.cycle_count).unwrap_or(0);
        let checkpoint = Checkpoint {
            summary_text: summary_text.to_string(),
            cycle_count: previous + 1,
            active: true,
            created_at: Utc::now(),
        };
        self.save_raw(&checkpoint)?;
        tracing::info!(
            path = %self.path.display(),
            cycle_count = checkpoint.cycle_count,
            "checkpoint written"
        );
        Ok(checkpoint.cycle_count)
    }

    fn clear(&self) -> Result<(), CheckpointError> {
        if let Some(mut c) = self.load_raw()? {
            c.active = false;
            self.save_raw(&c)?;
        }
        Ok(())
    }

    fn try_lock(&self) -> Result<CheckpointLock, CheckpointError> {
        let lock_path = self.lock_path();
        if let Some(parent) = lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| Self::io_err(parent, e))?;
        }
        match self.create_lock(&lock_path) {
            Ok(lock) => Ok(lock),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if !self.lock_is_stale(&lock_path) {
                    return Err(CheckpointError::LockHeld);
                }
                tracing::warn!(path = %lock_path.display(), "reclaiming stale checkpoint lock");
                let _ = std::fs::remove_file(&lock_path);
                match self.create_lock(&lock_path) {
                    Ok(lock) => Ok(lock),
                    Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                        Err(CheckpointError::LockHeld)
                    }
                    Err(e) => Err(Self::io_err(&lock_path, e)),
                }
            }
            Err(e) => Err(Self::io_err(&lock_path, e)),
        }
    }
}

/// 进程是否仍存活；无法判断的平台上一律视为存活，只靠锁文件年龄回收
fn process_alive(pid: u32) -> bool {
    if pid == std::process::id() {
        return true;
    }
    #[cfg(target_os = "linux")]
    {
        Path::new("/proc").join(pid.to_string()).exists()
    }
    #[cfg(not(target_os = "linux"))]
    {
        true
    }
}

/// 内存存储（测试与未配置路径时使用）
#[derive(Debug, Default, Clone)]
pub struct InMemoryCheckpointStore {
    slot: Arc<Mutex<Option<Checkpoint>>>,
    locked: Arc<AtomicBool>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预置一个已存在的检查点
    pub fn with_checkpoint(summary_text: &str, cycle_count: u64) -> Self {
        let store = Self::new();
        if let Ok(mut slot) = store.slot.lock() {
            *slot = Some(Checkpoint {
                summary_text: summary_text.to_string(),
                cycle_count,
                active: true,
                created_at: Utc::now(),
            });
        }
        store
    }

    /// 当前记录（含已 clear 的），便于断言代数
    pub fn snapshot(&self) -> Option<Checkpoint> {
        self.slot.lock().ok().and_then(|s| s.clone())
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn exists(&self) -> bool {
        matches!(self.snapshot(), Some(c) if c.active)
    }

    fn read(&self) -> Result<Checkpoint, CheckpointError> {
        match self.snapshot() {
            Some(c) if c.active => Ok(c),
            _ => Err(CheckpointError::Missing),
        }
    }

    fn write(&self, summary_text: &str) -> Result<u64, CheckpointError> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|e| CheckpointError::Corrupt(e.to_string()))?;
        let cycle_count = slot.as_ref().map(|c| c.cycle_count).unwrap_or(0) + 1;
        *slot = Some(Checkpoint {
            summary_text: summary_text.to_string(),
            cycle_count,
            active: true,
            created_at: Utc::now(),
        });
        Ok(cycle_count)
    }

    fn clear(&self) -> Result<(), CheckpointError> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|e| CheckpointError::Corrupt(e.to_string()))?;
        if let Some(c) = slot.as_mut() {
            c.active = false;
        }
        Ok(())
    }

    fn try_lock(&self) -> Result<CheckpointLock, CheckpointError> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CheckpointError::LockHeld);
        }
        let locked = self.locked.clone();
        Ok(CheckpointLock::new(move || locked.store(false, Ordering::SeqCst)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_store_cycle_survives_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("state/checkpoint.json"));
        assert!(!store.exists());
        assert_eq!(store.write("first").unwrap(), 1);
        assert!(store.exists());
        assert_eq!(store.read().unwrap().summary_text, "first");

        store.clear().unwrap();
        assert!(!store.exists());
        assert!(matches!(store.read(), Err(CheckpointError::Missing)));
        assert_eq!(store.write("second").unwrap(), 2);
    }

    #[test]
    fn test_file_lock_is_exclusive_and_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("checkpoint.json"));
        let guard = store.try_lock().unwrap();
        assert!(store.lock_path().exists());
        assert!(matches!(store.try_lock(), Err(CheckpointError::LockHeld)));
        drop(guard);
        assert!(!store.lock_path().exists());
        assert!(store.try_lock().is_ok());
    }

    #[test]
    fn test_corrupt_file_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        std::fs::write(&path, "not json").unwrap();
        let store = FileCheckpointStore::new(&path);
        assert!(!store.exists());
        assert!(matches!(store.read(), Err(CheckpointError::Corrupt(_))));
    }

    #[test]
    fn test_write_over_corrupt_file_fails_instead_of_restarting_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        std::fs::write(&path, "{\"cycle_count\": 7, truncated").unwrap();
        let store = FileCheckpointStore::new(&path);
        assert!(matches!(store.write("next"), Err(CheckpointError::Corrupt(_))));
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "{\"cycle_count\": 7, truncated"
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_lock_left_by_dead_process_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("checkpoint.json"));
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();
        std::fs::write(store.lock_path(), dead_pid.to_string()).unwrap();

        let guard = store.try_lock().unwrap();
        assert_eq!(
            std::fs::read_to_string(store.lock_path()).unwrap(),
            std::process::id().to_string()
        );
        drop(guard);
        assert!(!store.lock_path().exists());
    }

    #[test]
    fn test_old_lock_is_reclaimed_after_stale_bound() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        let live = FileCheckpointStore::new(&path);
        std::fs::write(live.lock_path(), std::process::id().to_string()).unwrap();
        assert!(matches!(live.try_lock(), Err(CheckpointError::LockHeld)));

        let impatient = FileCheckpointStore::new(&path).with_stale_after(Duration::ZERO);
        assert!(impatient.try_lock().is_ok());
    }

    #[test]
    fn test_in_memory_store_lock() {
        let store = InMemoryCheckpointStore::new();
        let guard = store.try_lock().unwrap();
        assert!(store.is_locked());
        assert!(store.try_lock().is_err());
        drop(guard);
        assert!(!store.is_locked());
    }
}
