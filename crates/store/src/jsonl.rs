//! JSONL-backed message store.
//!
//! Each thread gets a `<thread_id>.jsonl` file under the base directory;
//! every message is appended as a single JSON line. `delete_by_kind`
//! rewrites the file through a temp-and-rename pass since the log is
//! otherwise append-only.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use uuid::Uuid;

use relay_domain::error::{Error, Result};
use relay_domain::message::{Message, MessageKind};

use crate::messages::MessageStore;

pub struct JsonlMessageStore {
    base_dir: PathBuf,
}

impl JsonlMessageStore {
    pub fn new(base_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(base_dir).map_err(Error::Io)?;
        Ok(Self { base_dir: base_dir.to_path_buf() })
    }

    fn path_for(&self, thread_id: Uuid) -> PathBuf {
        self.base_dir.join(format!("{thread_id}.jsonl"))
    }

    fn read_all(&self, thread_id: Uuid) -> Result<Vec<Message>> {
        let path = self.path_for(thread_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let raw = std::fs::read_to_string(&path).map_err(Error::Io)?;
        let mut messages = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Message>(line) {
                Ok(m) => messages.push(m),
                Err(e) => {
                    tracing::warn!(%thread_id, error = %e, "skipping malformed message line");
                }
            }
        }
        messages.sort_by_key(|m| m.sort_key());
        Ok(messages)
    }

    fn rewrite(&self, thread_id: Uuid, messages: &[Message]) -> Result<()> {
        let path = self.path_for(thread_id);
        let tmp = path.with_extension("jsonl.tmp");
        {
            use std::io::Write;
            let mut f = std::fs::File::create(&tmp).map_err(Error::Io)?;
            for m in messages {
                let json = serde_json::to_string(m)?;
                writeln!(f, "{json}").map_err(Error::Io)?;
            }
        }
        std::fs::rename(&tmp, &path).map_err(Error::Io)?;
        Ok(())
    }
}

#[async_trait]
impl MessageStore for JsonlMessageStore {
    async fn append(
        &self,
        thread_id: Uuid,
        kind: MessageKind,
        content: serde_json::Value,
        is_llm_message: bool,
        metadata: serde_json::Value,
    ) -> Result<Message> {
        let message = Message::new(thread_id, kind, content, is_llm_message, metadata);
        let json = serde_json::to_string(&message)?;

        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(thread_id))
            .map_err(Error::Io)?;
        writeln!(file, "{json}").map_err(Error::Io)?;

        Ok(message)
    }

    async fn list(&self, thread_id: Uuid) -> Result<Vec<Message>> {
        self.read_all(thread_id)
    }

    async fn list_llm(&self, thread_id: Uuid) -> Result<Vec<Message>> {
        Ok(self
            .read_all(thread_id)?
            .into_iter()
            .filter(|m| m.is_llm_message)
            .collect())
    }

    async fn delete_by_kind(&self, thread_id: Uuid, kind: MessageKind) -> Result<usize> {
        let messages = self.read_all(thread_id)?;
        let kept: Vec<Message> = messages.iter().filter(|m| m.kind != kind).cloned().collect();
        let removed = messages.len() - kept.len();
        if removed > 0 {
            self.rewrite(thread_id, &kept)?;
        }
        Ok(removed)
    }
}
