//! On-disk layout of a Genie home and opening pipelines from it.
//!
//! ```text
//! $GENIE_HOME/
//! ├── config.toml          [pipeline] section
//! ├── logs/
//! └── projects/            (or [pipeline].store_dir)
//!     ├── {org_id}.json    project snapshot
//!     └── orgs/
//!         └── {org_id}.json  organization data
//! ```

use crate::offline::{LocalPlatform, TemplateGenerator};
use anyhow::{bail, Context, Result};
use genie_pipeline::{
    load_pipeline_config, DefaultActions, JsonFileStore, OrgSnapshot, Pipeline, PipelineConfig,
    Project, ProjectStore, StageId,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

pub struct Workspace {
    config: PipelineConfig,
    store: Arc<JsonFileStore>,
}

impl Workspace {
    /// Read `config.toml` under `home` and open the project store.
    /// `store_override` wins over the configured `store_dir`.
    pub fn load(home: &Path, store_override: Option<PathBuf>) -> Result<Self> {
        let config_path = home.join("config.toml");
        let config = load_pipeline_config(&config_path)
            .with_context(|| format!("Failed to load {}", config_path.display()))?;
        let dir = store_override
            .or_else(|| config.store_dir.clone())
            .unwrap_or_else(|| home.join("projects"));
        let store = JsonFileStore::new(dir)?;
        debug!("Project store at {}", store.dir().display());
        Ok(Self {
            config,
            store: Arc::new(store),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut PipelineConfig {
        &mut self.config
    }

    pub fn store_dir(&self) -> &Path {
        self.store.dir()
    }

    fn org_path(&self, org_id: &str) -> PathBuf {
        let safe: String = org_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.store.dir().join("orgs").join(format!("{}.json", safe))
    }

    pub fn project_exists(&self, org_id: &str) -> Result<bool> {
        Ok(self.store.load(org_id)?.is_some())
    }

    /// Organization data saved by `init`. Missing data means nothing loaded yet.
    pub fn load_org(&self, org_id: &str) -> Result<OrgSnapshot> {
        let path = self.org_path(org_id);
        if !path.exists() {
            return Ok(OrgSnapshot::new(org_id));
        }
        let json = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read org data: {}", path.display()))?;
        let mut org: OrgSnapshot = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse org data: {}", path.display()))?;
        org.org_id = org_id.to_string();
        Ok(org)
    }

    pub fn save_org(&self, org: &OrgSnapshot) -> Result<()> {
        let path = self.org_path(&org.org_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(org)?;
        fs::write(&path, json)
            .with_context(|| format!("Failed to write org data: {}", path.display()))?;
        Ok(())
    }

    /// Start a pipeline for a brand-new project and write its first snapshot.
    pub async fn create(&self, org: OrgSnapshot, project: Project) -> Result<Pipeline> {
        let pipeline = Pipeline::builder(
            project,
            Arc::new(TemplateGenerator),
            Arc::new(LocalPlatform),
        )
        .org(org)
        .config(self.config.clone())
        .current_stage(StageId::first())
        .actions(Arc::new(DefaultActions))
        .store(self.store.clone())
        .build();
        pipeline.flush().await?;
        info!("Created project {}", pipeline.project().await.name);
        Ok(pipeline)
    }

    /// Reopen the saved project of `org_id` together with its org data.
    pub fn open(&self, org_id: &str) -> Result<Pipeline> {
        let Some(snapshot) = self.store.load(org_id)? else {
            bail!(
                "No project for organization '{}'. TRY: genie --org {} init --name <NAME>",
                org_id,
                org_id
            );
        };
        let org = self.load_org(org_id)?;
        let pipeline = Pipeline::restore(&snapshot, Arc::new(TemplateGenerator), Arc::new(LocalPlatform))?
            .org(org)
            .config(self.config.clone())
            .actions(Arc::new(DefaultActions))
            .store(self.store.clone())
            .build();
        Ok(pipeline)
    }
}
