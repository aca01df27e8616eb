//! 轮次提交：把完成的 TurnRecord 交给持久化存储
//!
//! commit 以 turn_id 为幂等键：同一 id 重复提交返回 AlreadyCommitted，不会写第二份。
//! 两种实现：InMemoryMemoryStore（进程内）与 JournalMemoryStore（追加写 JSONL）。

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::core::{MemoryStoreError, TurnId, TurnRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStatus {
    Committed,
    /// 该 turn_id 已提交过，本次为空操作
    AlreadyCommitted,
}

#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn commit(&self, turn_id: &TurnId, record: &TurnRecord) -> Result<CommitStatus, MemoryStoreError>;

    /// 是否已提交
    async fn contains(&self, turn_id: &TurnId) -> bool;
}

#[derive(Debug, Default)]
pub struct InMemoryMemoryStore {
    records: Mutex<HashMap<TurnId, TurnRecord>>,
}

impl InMemoryMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, turn_id: &TurnId) -> Option<TurnRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(turn_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MemoryStore for InMemoryMemoryStore {
    async fn commit(&self, turn_id: &TurnId, record: &TurnRecord) -> Result<CommitStatus, MemoryStoreError> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if records.contains_key(turn_id) {
            return Ok(CommitStatus::AlreadyCommitted);
        }
        let mut stored = record.clone();
        stored.committed = true;
        records.insert(turn_id.clone(), stored);
        Ok(CommitStatus::Committed)
    }

    async fn contains(&self, turn_id: &TurnId) -> bool {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(turn_id)
    }
}

/// JSONL 中的一行
#[derive(Debug, Serialize, Deserialize)]
pub struct JournalEntry {
    pub turn_id: TurnId,
    pub committed_at: DateTime<Utc>,
    pub record: TurnRecord,
}

/// 追加写的轮次日志；打开时扫描已有行建立已提交 id 索引
#[derive(Debug)]
pub struct JournalMemoryStore {
    path: PathBuf,
    committed: Mutex<HashSet<TurnId>>,
}

impl JournalMemoryStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, MemoryStoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut committed = HashSet::new();
        match tokio::fs::read_to_string(&path).await {
            Ok(data) => {
                for (lineno, line) in data.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<JournalEntry>(line) {
                        Ok(entry) => {
                            committed.insert(entry.turn_id);
                        }
                        Err(e) => {
                            tracing::warn!(path = %path.display(), line = lineno + 1, error = %e, "Skipping unreadable journal line")
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tracing::info!(path = %path.display(), turns = committed.len(), "Turn journal opened");
        Ok(Self {
            path,
            committed: Mutex::new(committed),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.committed.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 读回全部记录（按写入顺序）
    pub async fn entries(&self) -> Result<Vec<JournalEntry>, MemoryStoreError> {
        let data = match tokio::fs::read_to_string(&self.path).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        data.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(MemoryStoreError::from))
            .collect()
    }

    async fn append(&self, line: &str) -> Result<(), MemoryStoreError> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl MemoryStore for JournalMemoryStore {
    async fn commit(&self, turn_id: &TurnId, record: &TurnRecord) -> Result<CommitStatus, MemoryStoreError> {
        // 先占位再写文件，锁不跨 await
        if !self
            .committed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(turn_id.clone())
        {
            return Ok(CommitStatus::AlreadyCommitted);
        }

        let mut stored = record.clone();
        stored.committed = true;
        let entry = JournalEntry {
            turn_id: turn_id.clone(),
            committed_at: Utc::now(),
            record: stored,
        };
        let written = match serde_json::to_string(&entry) {
            Ok(mut line) => {
                line.push('\n');
                self.append(&line).await
            }
            Err(e) => Err(e.into()),
        };
        if let Err(e) = written {
            self.committed
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(turn_id);
            return Err(e);
        }
        Ok(CommitStatus::Committed)
    }

    async fn contains(&self, turn_id: &TurnId) -> bool {
        self.committed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(turn_id)
    }
}
