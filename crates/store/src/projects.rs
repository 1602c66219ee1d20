//! Project and thread lookup store.
//!
//! Sparse records: accounts own projects, projects own threads and at most
//! one sandbox reference. A thread's project binding is immutable.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

use relay_domain::error::{Error, Result};
use relay_domain::message::{Project, Thread};

#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// The account's project, created lazily on first use.
    async fn ensure_project(&self, account_id: &str) -> Result<Project>;

    async fn get_project(&self, project_id: Uuid) -> Result<Project>;

    /// Record the sandbox provisioned for a project.
    async fn set_sandbox_ref(&self, project_id: Uuid, sandbox_ref: &str) -> Result<()>;

    async fn create_thread(&self, project_id: Uuid) -> Result<Thread>;

    async fn get_thread(&self, thread_id: Uuid) -> Result<Thread>;
}

/// In-process implementation backed by two maps.
#[derive(Default)]
pub struct InMemoryProjectStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    projects: HashMap<Uuid, Project>,
    by_account: HashMap<String, Uuid>,
    threads: HashMap<Uuid, Thread>,
}

impl InMemoryProjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProjectStore for InMemoryProjectStore {
    async fn ensure_project(&self, account_id: &str) -> Result<Project> {
        let mut inner = self.inner.write();
        if let Some(project_id) = inner.by_account.get(account_id) {
            return Ok(inner.projects[project_id].clone());
        }
        let project = Project::new(account_id);
        inner.by_account.insert(account_id.to_owned(), project.project_id);
        inner.projects.insert(project.project_id, project.clone());
        Ok(project)
    }

    async fn get_project(&self, project_id: Uuid) -> Result<Project> {
        self.inner
            .read()
            .projects
            .get(&project_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("project {project_id}")))
    }

    async fn set_sandbox_ref(&self, project_id: Uuid, sandbox_ref: &str) -> Result<()> {
        let mut inner = self.inner.write();
        let project = inner
            .projects
            .get_mut(&project_id)
            .ok_or_else(|| Error::NotFound(format!("project {project_id}")))?;
        project.sandbox_ref = Some(sandbox_ref.to_owned());
        Ok(())
    }

    async fn create_thread(&self, project_id: Uuid) -> Result<Thread> {
        let mut inner = self.inner.write();
        let account_id = inner
            .projects
            .get(&project_id)
            .map(|p| p.account_id.clone())
            .ok_or_else(|| Error::NotFound(format!("project {project_id}")))?;
        let thread = Thread::new(project_id, account_id);
        inner.threads.insert(thread.thread_id, thread.clone());
        Ok(thread)
    }

    async fn get_thread(&self, thread_id: Uuid) -> Result<Thread> {
        self.inner
            .read()
            .threads
            .get(&thread_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("thread {thread_id}")))
    }
}
