//! Per-project output buffers.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::RwLock;
use tracing::debug;

use super::buffer::{OutputBuffer, OutputLine, OutputPage};

/// A buffer shared between its drain worker and readers.
pub type SharedBuffer = Arc<RwLock<OutputBuffer>>;

#[derive(Debug)]
struct ProjectOutput {
    /// Unique per buffer set; offsets are only meaningful within one.
    generation: u64,
    combined: SharedBuffer,
    agents: HashMap<String, SharedBuffer>,
}

impl ProjectOutput {
    fn new(capacity: usize, generation: u64) -> Self {
        Self {
            generation,
            combined: Arc::new(RwLock::new(OutputBuffer::new(capacity))),
            agents: HashMap::new(),
        }
    }

    fn buffer(&self, agent: Option<&str>) -> Option<SharedBuffer> {
        match agent {
            None => Some(Arc::clone(&self.combined)),
            Some(name) => self.agents.get(name).map(Arc::clone),
        }
    }
}

/// Write side handed to one drain worker.
#[derive(Debug, Clone)]
pub struct OutputSinks {
    agent: SharedBuffer,
    combined: SharedBuffer,
}

impl OutputSinks {
    /// Append to the agent buffer and the combined buffer.
    ///
    /// Each buffer is locked only for its own append.
    pub async fn push(&self, line: OutputLine) {
        self.agent.write().await.push(line.clone());
        self.combined.write().await.push(line);
    }
}

impl OutputPage {
    /// Page for a buffer that does not exist (yet).
    pub fn empty(offset: i64) -> Self {
        let offset = offset.max(0);
        Self {
            lines: Vec::new(),
            offset,
            next_offset: offset,
            total: 0,
            has_more: false,
        }
    }
}

/// Output buffers for every project: one combined buffer plus one per agent.
#[derive(Debug)]
pub struct OutputStore {
    capacity: usize,
    next_generation: AtomicU64,
    projects: RwLock<HashMap<String, ProjectOutput>>,
}

impl OutputStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_generation: AtomicU64::new(1),
            projects: RwLock::new(HashMap::new()),
        }
    }

    /// Page-size ceiling for reads.
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    fn new_output(&self) -> ProjectOutput {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        ProjectOutput::new(self.capacity, generation)
    }

    /// Replace a project's buffers with empty ones (start of a new run).
    ///
    /// Subscriptions on the old buffers see the generation change and end.
    pub async fn reset_project(&self, project_id: &str) {
        let output = self.new_output();
        let generation = output.generation;
        self.projects
            .write()
            .await
            .insert(project_id.to_string(), output);
        debug!(project_id, generation, "Output buffers reset");
    }

    /// Generation of the project's current buffers, if it has any.
    pub async fn generation(&self, project_id: &str) -> Option<u64> {
        self.projects
            .read()
            .await
            .get(project_id)
            .map(|output| output.generation)
    }

    /// Sinks for one agent, creating its buffer on first use.
    #[allow(clippy::significant_drop_tightening)]
    pub async fn sinks(&self, project_id: &str, agent: &str) -> OutputSinks {
        let mut projects = self.projects.write().await;
        let output = projects
            .entry(project_id.to_string())
            .or_insert_with(|| self.new_output());
        let agent_buf = output
            .agents
            .entry(agent.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(OutputBuffer::new(self.capacity))));
        OutputSinks {
            agent: Arc::clone(agent_buf),
            combined: Arc::clone(&output.combined),
        }
    }

    /// The combined buffer, or one agent's buffer.
    pub async fn buffer(&self, project_id: &str, agent: Option<&str>) -> Option<SharedBuffer> {
        self.projects.read().await.get(project_id)?.buffer(agent)
    }

    /// Paginated read. A missing buffer reads as empty.
    pub async fn read(
        &self,
        project_id: &str,
        agent: Option<&str>,
        offset: i64,
        limit: i64,
    ) -> OutputPage {
        self.read_tagged(project_id, agent, offset, limit).await.1
    }

    /// Paginated read together with the generation of the buffers it read.
    pub async fn read_tagged(
        &self,
        project_id: &str,
        agent: Option<&str>,
        offset: i64,
        limit: i64,
    ) -> (Option<u64>, OutputPage) {
        let (generation, buffer) = {
            let projects = self.projects.read().await;
            projects
                .get(project_id)
                .map_or((None, None), |output| (Some(output.generation), output.buffer(agent)))
        };
        let page = match buffer {
            Some(buf) => buf.read().await.read(offset, limit),
            None => OutputPage::empty(offset),
        };
        (generation, page)
    }

    /// Drop every buffer of a project.
    pub async fn remove_project(&self, project_id: &str) -> bool {
        self.projects.write().await.remove(project_id).is_some()
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::output::StreamKind;

    fn line(agent: &str, text: &str) -> OutputLine {
        OutputLine {
            agent: agent.to_string(),
            stream: StreamKind::Stdout,
            text: text.to_string(),
            timestamp: 0,
        }
    }

    #[tokio::test]
    async fn lines_land_in_agent_and_combined_buffers() {
        let store = OutputStore::new(100);
        let alpha = store.sinks("p1", "alpha").await;
        let beta = store.sinks("p1", "beta").await;

        alpha.push(line("alpha", "a1")).await;
        beta.push(line("beta", "b1")).await;
        alpha.push(line("alpha", "a2")).await;

        let combined = store.read("p1", None, 0, 10).await;
        let texts: Vec<_> = combined.lines.iter().map(|l| l.text.as_str()).collect();
        assert_eq!(texts, vec!["a1", "b1", "a2"]);

        let alpha_page = store.read("p1", Some("alpha"), 0, 10).await;
        assert_eq!(alpha_page.total, 2);
    }

    #[tokio::test]
    async fn unknown_buffers_read_empty() {
        let store = OutputStore::new(10);
        let page = store.read("nope", None, 5, 10).await;
        assert!(page.lines.is_empty());
        assert_eq!(page.next_offset, 5);

        store.reset_project("p1").await;
        let page = store.read("p1", Some("ghost"), -3, 10).await;
        assert_eq!(page.next_offset, 0);
    }

    #[tokio::test]
    async fn reset_and_remove() {
        let store = OutputStore::new(10);
        let sinks = store.sinks("p1", "alpha").await;
        sinks.push(line("alpha", "old")).await;

        let before = store.generation("p1").await.unwrap();
        store.reset_project("p1").await;
        assert_eq!(store.read("p1", None, 0, 10).await.total, 0);
        assert_ne!(store.generation("p1").await, Some(before));

        assert!(store.remove_project("p1").await);
        assert!(!store.remove_project("p1").await);
        assert_eq!(store.generation("p1").await, None);
    }
}
