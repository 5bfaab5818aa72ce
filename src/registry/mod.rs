//! # Project Registry Module
//!
//! Process-level bookkeeping of open projects and their switching
//! instances. Nothing here is global: the binary (or any embedding
//! service) owns one [`ProjectRegistry`] and every topology manager gets
//! its collaborators through a shared [`EngineContext`].
//!
//! ## Key Components
//!
//! - [`EngineContext`]: server configuration, container runtime, network
//!   stack, switch registry and the bounded worker pool
//! - [`SwitchRegistry`]: at most one switching instance per project
//! - [`ProjectRegistry`]: open/get/list/close of projects, each identified
//!   by a random 4-letter id

use crate::config::ServerConfig;
use crate::errors::{NetemError, Result};
use crate::link::{IpRoute2, NetworkStack};
use crate::runtime::{ContainerRuntime, DockerCli};
use crate::switch::SwitchInstance;
use crate::topology::TopologyManager;
use crate::utils::pool::WorkerPool;
use crate::utils::random::rand_letters;
use chrono::{DateTime, Utc};
use log::{error, info};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Length of generated project ids.
pub const PROJECT_ID_LEN: usize = 4;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Switching instances of the open projects.
#[derive(Debug, Default)]
pub struct SwitchRegistry {
    instances: Mutex<HashMap<String, Arc<SwitchInstance>>>,
}

impl SwitchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the switching instance of `project_id`.
    pub fn create(
        &self,
        project_id: &str,
        runtime: Arc<dyn ContainerRuntime>,
        config: &ServerConfig,
    ) -> Result<Arc<SwitchInstance>> {
        let mut instances = lock(&self.instances);
        if instances.contains_key(project_id) {
            return Err(NetemError::Unsupported(format!(
                "switch instance of project {} already exists",
                project_id
            )));
        }

        let instance = Arc::new(SwitchInstance::create(project_id, runtime, config)?);
        instances.insert(project_id.to_string(), instance.clone());
        Ok(instance)
    }

    pub fn get(&self, project_id: &str) -> Option<Arc<SwitchInstance>> {
        lock(&self.instances).get(project_id).cloned()
    }

    pub fn remove(&self, project_id: &str) -> Option<Arc<SwitchInstance>> {
        lock(&self.instances).remove(project_id)
    }

    pub fn len(&self) -> usize {
        lock(&self.instances).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Collaborators shared by every topology manager of the process.
pub struct EngineContext {
    pub config: ServerConfig,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub stack: Arc<dyn NetworkStack>,
    pub switches: SwitchRegistry,
    pub pool: WorkerPool,
}

impl EngineContext {
    pub fn new(
        config: ServerConfig,
        runtime: Arc<dyn ContainerRuntime>,
        stack: Arc<dyn NetworkStack>,
    ) -> Result<Self> {
        config.validate()?;
        let pool = WorkerPool::new(config.workers)?;
        Ok(Self {
            config,
            runtime,
            stack,
            switches: SwitchRegistry::new(),
            pool,
        })
    }

    /// Context driving the docker CLI and iproute2.
    pub fn system(config: ServerConfig) -> Result<Self> {
        Self::new(config, Arc::new(DockerCli::default()), Arc::new(IpRoute2::new()))
    }
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("config", &self.config)
            .field("switches", &self.switches)
            .field("pool", &self.pool)
            .finish()
    }
}

/// An open project.
#[derive(Debug)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub dir: PathBuf,
    pub opened_at: DateTime<Utc>,
    topology: Mutex<TopologyManager>,
}

impl Project {
    pub fn topology(&self) -> MutexGuard<'_, TopologyManager> {
        lock(&self.topology)
    }

    pub fn summary(&self) -> ProjectSummary {
        ProjectSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            dir: self.dir.clone(),
            opened_at: self.opened_at,
            running: self.topology().is_running(),
        }
    }
}

/// Serializable view of a [`Project`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectSummary {
    pub id: String,
    pub name: String,
    pub dir: PathBuf,
    pub opened_at: DateTime<Utc>,
    pub running: bool,
}

#[derive(Debug)]
pub struct ProjectRegistry {
    ctx: Arc<EngineContext>,
    projects: Mutex<HashMap<String, Arc<Project>>>,
    /// Ids handed to projects that are still loading.
    pending: Mutex<HashSet<String>>,
}

impl ProjectRegistry {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self {
            ctx,
            projects: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashSet::new()),
        }
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    /// Pick an id unused by open and loading projects and hold it.
    fn reserve_id(&self) -> String {
        let projects = lock(&self.projects);
        let mut pending = lock(&self.pending);
        loop {
            let id = rand_letters(PROJECT_ID_LEN);
            if !projects.contains_key(&id) && pending.insert(id.clone()) {
                return id;
            }
        }
    }

    fn release_id(&self, id: &str) {
        lock(&self.pending).remove(id);
    }

    /// Open the project stored in `dir` and load its topology.
    ///
    /// A project whose topology fails to load is closed again and not
    /// registered. Loading runs without holding the registry lock, so other
    /// projects stay reachable meanwhile.
    pub fn open(&self, dir: &Path) -> Result<Arc<Project>> {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| dir.display().to_string());

        let id = self.reserve_id();
        let mut topology = TopologyManager::new(&id, dir, self.ctx.clone());
        if let Err(e) = topology.load() {
            if let Err(close_err) = topology.close() {
                error!("[{}] Error when closing project: {}", id, close_err);
            }
            self.release_id(&id);
            return Err(e);
        }

        let project = Arc::new(Project {
            id: id.clone(),
            name,
            dir: dir.to_path_buf(),
            opened_at: Utc::now(),
            topology: Mutex::new(topology),
        });
        lock(&self.projects).insert(id.clone(), project.clone());
        self.release_id(&id);

        info!("Project {} opened from {:?}", id, dir);
        Ok(project)
    }

    pub fn get(&self, id: &str) -> Result<Arc<Project>> {
        lock(&self.projects)
            .get(id)
            .cloned()
            .ok_or_else(|| NetemError::ProjectNotFound(id.to_string()))
    }

    /// Whether a project named `name` is open.
    pub fn is_open(&self, name: &str) -> bool {
        lock(&self.projects).values().any(|p| p.name == name)
    }

    /// Every open project, oldest first.
    pub fn list(&self) -> Vec<ProjectSummary> {
        let projects: Vec<Arc<Project>> = lock(&self.projects).values().cloned().collect();
        let mut summaries: Vec<ProjectSummary> = projects.iter().map(|p| p.summary()).collect();
        summaries.sort_by(|a, b| a.opened_at.cmp(&b.opened_at).then(a.id.cmp(&b.id)));
        summaries
    }

    pub fn close(&self, id: &str) -> Result<()> {
        let project = lock(&self.projects)
            .remove(id)
            .ok_or_else(|| NetemError::ProjectNotFound(id.to_string()))?;
        info!("Closing project {}", id);
        let result = project.topology().close();
        result
    }

    /// Close every open project, logging failures.
    pub fn close_all(&self) {
        let ids: Vec<String> = lock(&self.projects).keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.close(&id) {
                error!("Error when closing project {}: {}", id, e);
            }
        }
    }
}
