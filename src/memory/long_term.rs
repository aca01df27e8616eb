//! 长期记忆：用户事实与偏好，跨会话检索
//!
//! remember / recall 工具读写这里。当前实现为 InMemoryLongTerm（关键词重叠），
//! 可选 JSON 快照文件，进程重启后仍能回忆。

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

/// 长期记忆 trait：支持写入与相似度检索
pub trait LongTermMemory: Send + Sync {
    /// 存入一段文本，返回是否为新条目（重复内容不重复写入）
    fn add(&self, text: &str) -> bool;

    /// 按查询检索最相关的 k 条，返回文本片段
    fn search(&self, query: &str, k: usize) -> Vec<String>;

    /// 条目数
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 将文本切分为小写词集合；去掉常见标点，保证 "pizza." 与 "pizza" 能匹配
fn tokenize_lower(s: &str) -> HashSet<String> {
    s.split(|c: char| c.is_whitespace() || matches!(c, ',' | '.' | '?' | '!' | ';' | ':' | '"' | '，' | '。' | '？' | '！'))
        .map(|w| w.trim_matches('\'').to_lowercase())
        .filter(|w| w.chars().count() > 1)
        .collect()
}

/// 简单内存实现：按关键词重叠检索（无真实向量）
#[derive(Clone)]
pub struct InMemoryLongTerm {
    /// (text, 小写词集合) 用于简单匹配
    store: Arc<RwLock<Vec<(String, HashSet<String>)>>>,
    max_entries: usize,
    snapshot: Option<PathBuf>,
    /// 串行化快照写盘；写文件时不持有 store 锁
    save_lock: Arc<Mutex<()>>,
}

impl InMemoryLongTerm {
    pub fn new(max_entries: usize) -> Self {
        Self {
            store: Arc::new(RwLock::new(Vec::new())),
            max_entries,
            snapshot: None,
            save_lock: Arc::new(Mutex::new(())),
        }
    }

    /// 带快照文件：存在则加载，之后每次写入整体覆盖保存
    pub fn with_snapshot(max_entries: usize, path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mem = Self {
            snapshot: Some(path.clone()),
            ..Self::new(max_entries)
        };
        if path.exists() {
            let data = std::fs::read_to_string(&path)?;
            let entries: Vec<String> = serde_json::from_str(&data)?;
            let mut store = mem.store.write().unwrap_or_else(|e| e.into_inner());
            for text in entries {
                let tokens = tokenize_lower(&text);
                store.push((text, tokens));
            }
            tracing::debug!(path = %path.display(), entries = store.len(), "long-term snapshot loaded");
        }
        Ok(mem)
    }

    /// 在 store 锁之外写盘；拿到 save_lock 后再取最新内容，后写者总是落盘最新状态
    fn save_snapshot(&self) {
        let Some(path) = &self.snapshot else {
            return;
        };
        let _saving = self.save_lock.lock().unwrap_or_else(|e| e.into_inner());
        let texts: Vec<String> = self
            .store
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(t, _)| t.clone())
            .collect();
        let result = serde_json::to_string_pretty(&texts)
            .map_err(anyhow::Error::from)
            .and_then(|json| {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(path, json)?;
                Ok(())
            });
        if let Err(e) = result {
            tracing::warn!(path = %path.display(), error = %e, "long-term snapshot save failed");
        }
    }
}

impl LongTermMemory for InMemoryLongTerm {
    fn add(&self, text: &str) -> bool {
        let text = text.trim();
        if text.is_empty() {
            return false;
        }
        {
            let mut store = self.store.write().unwrap_or_else(|e| e.into_inner());
            if store.iter().any(|(t, _)| t == text) {
                return false;
            }
            store.push((text.to_string(), tokenize_lower(text)));
            let n = store.len();
            if n > self.max_entries {
                store.drain(0..n - self.max_entries);
            }
        }
        self.save_snapshot();
        true
    }

    fn search(&self, query: &str, k: usize) -> Vec<String> {
        let query_tokens = tokenize_lower(query);
        if query_tokens.is_empty() {
            return Vec::new();
        }
        let store = self.store.read().unwrap_or_else(|e| e.into_inner());
        let mut scored: Vec<(usize, usize, String)> = store
            .iter()
            .enumerate()
            .map(|(i, (text, doc_tokens))| (query_tokens.intersection(doc_tokens).count(), i, text.clone()))
            .filter(|(s, _, _)| *s > 0)
            .collect();
        // 分数相同时新写入的优先
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)));
        scored.into_iter().take(k).map(|(_, _, t)| t).collect()
    }

    fn len(&self) -> usize {
        self.store.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for InMemoryLongTerm {
    fn default() -> Self {
        Self::new(1000)
    }
}
