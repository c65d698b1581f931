use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;

use crate::util::lock::mutex_lock;

use super::{OutputError, OutputHandle, PageTask, PageWriter};

const LOCK_TARGET: &str = "staticplus::infra::output::memory";

/// Page id to rendered body, shared between the builder and whoever
/// inspects the result.
#[derive(Debug, Clone, Default)]
pub struct MemoryOutput {
    pages: Arc<Mutex<BTreeMap<String, String>>>,
}

impl MemoryOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<String> {
        mutex_lock(&self.pages, LOCK_TARGET, "get").get(id).cloned()
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.pages, LOCK_TARGET, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        mutex_lock(&self.pages, LOCK_TARGET, "snapshot").clone()
    }

    fn insert(&self, id: String, body: String) {
        mutex_lock(&self.pages, LOCK_TARGET, "insert").insert(id, body);
    }

    fn remove(&self, id: &str) {
        mutex_lock(&self.pages, LOCK_TARGET, "remove").remove(id);
    }
}

pub struct MemoryWriter {
    output: MemoryOutput,
}

impl MemoryWriter {
    pub fn new(output: MemoryOutput) -> Self {
        Self { output }
    }
}

#[async_trait]
impl PageWriter for MemoryWriter {
    async fn write(&self, page: &PageTask) -> Result<(), OutputError> {
        let body = String::from_utf8_lossy(&page.body).into_owned();
        self.output.insert(page.id.clone(), body);
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), OutputError> {
        self.output.remove(id);
        Ok(())
    }

    fn handle(&self) -> OutputHandle {
        OutputHandle::Memory(self.output.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_are_visible_through_clones() {
        let output = MemoryOutput::new();
        let writer = MemoryWriter::new(output.clone());

        writer
            .write(&PageTask::html("foo", "foo says tball"))
            .await
            .expect("write");
        assert_eq!(output.get("foo").as_deref(), Some("foo says tball"));

        writer.remove("foo").await.expect("remove");
        assert!(output.is_empty());
    }
}
