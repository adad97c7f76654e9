// 内存存储实现：无持久化，进程退出即丢失，主要用于测试与本地演示。
use crate::storage::{
    normalize_title, BackendHealth, MessageRecord, MessageRole, StorageBackend, ThreadRecord,
    DEFAULT_THREAD_TITLE, HISTORY_LIMIT, THREAD_LIST_LIMIT,
};
use anyhow::{anyhow, Result};
use chrono::Utc;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::HashMap;

#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    users: HashMap<String, f64>,
    threads: HashMap<String, ThreadRecord>,
    messages: HashMap<String, Vec<MessageRecord>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn now_ts() -> f64 {
        Utc::now().timestamp_millis() as f64 / 1000.0
    }
}

impl StorageBackend for MemoryStorage {
    fn ensure_initialized(&self) -> Result<()> {
        Ok(())
    }

    fn ensure_user(&self, user_id: &str) -> Result<()> {
        let cleaned = user_id.trim();
        if cleaned.is_empty() {
            return Err(anyhow!("user id is empty"));
        }
        let mut inner = self.inner.lock();
        inner
            .users
            .entry(cleaned.to_string())
            .or_insert_with(Self::now_ts);
        Ok(())
    }

    fn create_thread(&self, thread_id: &str, user_id: &str, title: &str) -> Result<()> {
        let cleaned_thread = thread_id.trim();
        let cleaned_user = user_id.trim();
        if cleaned_thread.is_empty() || cleaned_user.is_empty() {
            return Err(anyhow!("thread id or user id is empty"));
        }
        let title =
            normalize_title(title).unwrap_or_else(|| DEFAULT_THREAD_TITLE.to_string());
        let now = Self::now_ts();
        let mut inner = self.inner.lock();
        // 先建用户再建线程，保持与持久后端相同的引用顺序。
        inner
            .users
            .entry(cleaned_user.to_string())
            .or_insert(now);
        if inner.threads.contains_key(cleaned_thread) {
            return Err(anyhow!("thread already exists: {cleaned_thread}"));
        }
        inner.threads.insert(
            cleaned_thread.to_string(),
            ThreadRecord {
                thread_id: cleaned_thread.to_string(),
                anon_user_id: cleaned_user.to_string(),
                title,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(())
    }

    fn list_threads(&self, user_id: &str) -> Result<Vec<ThreadRecord>> {
        let cleaned = user_id.trim();
        if cleaned.is_empty() {
            return Ok(Vec::new());
        }
        let inner = self.inner.lock();
        let mut records: Vec<ThreadRecord> = inner
            .threads
            .values()
            .filter(|record| record.anon_user_id == cleaned)
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            b.updated_at
                .partial_cmp(&a.updated_at)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.thread_id.cmp(&b.thread_id))
        });
        records.truncate(THREAD_LIST_LIMIT as usize);
        Ok(records)
    }

    fn thread_owned_by(&self, thread_id: &str, user_id: &str) -> Result<bool> {
        let cleaned_thread = thread_id.trim();
        let cleaned_user = user_id.trim();
        if cleaned_thread.is_empty() || cleaned_user.is_empty() {
            return Ok(false);
        }
        let inner = self.inner.lock();
        Ok(inner
            .threads
            .get(cleaned_thread)
            .map(|record| record.anon_user_id == cleaned_user)
            .unwrap_or(false))
    }

    fn rename_thread(&self, thread_id: &str, user_id: &str, title: &str) -> Result<bool> {
        let cleaned_thread = thread_id.trim();
        let cleaned_user = user_id.trim();
        if cleaned_thread.is_empty() || cleaned_user.is_empty() {
            return Ok(false);
        }
        let Some(title) = normalize_title(title) else {
            return Err(anyhow!("thread title is empty"));
        };
        let mut inner = self.inner.lock();
        let Some(record) = inner.threads.get_mut(cleaned_thread) else {
            return Ok(false);
        };
        if record.anon_user_id != cleaned_user {
            return Ok(false);
        }
        record.title = title;
        record.updated_at = Self::now_ts();
        Ok(true)
    }

    fn insert_message(
        &self,
        msg_id: &str,
        thread_id: &str,
        role: MessageRole,
        content: Option<&str>,
    ) -> Result<()> {
        let cleaned_msg = msg_id.trim();
        let cleaned_thread = thread_id.trim();
        if cleaned_msg.is_empty() || cleaned_thread.is_empty() {
            return Err(anyhow!("message id or thread id is empty"));
        }
        let mut inner = self.inner.lock();
        if !inner.threads.contains_key(cleaned_thread) {
            return Err(anyhow!("thread not found: {cleaned_thread}"));
        }
        let record = MessageRecord {
            msg_id: cleaned_msg.to_string(),
            thread_id: cleaned_thread.to_string(),
            role: role.as_str().to_string(),
            content: content.map(|value| value.to_string()),
            created_at: Self::now_ts(),
        };
        inner
            .messages
            .entry(cleaned_thread.to_string())
            .or_default()
            .push(record);
        Ok(())
    }

    fn touch_thread(&self, thread_id: &str) -> Result<()> {
        let cleaned = thread_id.trim();
        if cleaned.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        if let Some(record) = inner.threads.get_mut(cleaned) {
            record.updated_at = Self::now_ts();
        }
        Ok(())
    }

    fn get_history(&self, thread_id: &str) -> Result<Vec<MessageRecord>> {
        let cleaned = thread_id.trim();
        if cleaned.is_empty() {
            return Ok(Vec::new());
        }
        let inner = self.inner.lock();
        let mut records = inner
            .messages
            .get(cleaned)
            .cloned()
            .unwrap_or_default();
        // 稳定排序：同一时间戳保持插入顺序。
        records.sort_by(|a, b| {
            a.created_at
                .partial_cmp(&b.created_at)
                .unwrap_or(Ordering::Equal)
        });
        records.truncate(HISTORY_LIMIT as usize);
        Ok(records)
    }

    fn health_check(&self) -> BackendHealth {
        BackendHealth {
            backend: "memory",
            reachable: true,
        }
    }
}
