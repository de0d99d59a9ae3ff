//! Narrow interfaces to services this crate consumes but does not own.
//!
//! Deployment, HTTP health checks of deployed artifacts, and prompt
//! rendering live outside the supervisor. Jobs reach them only through
//! these traits, so embedders plug in real implementations and tests plug
//! in scripted ones.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use crate::process::BoxFuture;
use crate::{AppError, Result};

/// Result of a deploy or redeploy.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Deployment {
    /// Where the artifact is reachable.
    pub url: String,
    /// Free-form detail from the deployer.
    pub detail: Option<String>,
}

/// Result of a health check against a deployed URL.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HealthReport {
    /// Whether the endpoint looked healthy.
    pub healthy: bool,
    /// HTTP status observed, when applicable.
    pub status: Option<u16>,
    /// Free-form detail.
    pub detail: Option<String>,
}

/// Publishes worker output somewhere reachable.
pub trait Deployer: Send + Sync {
    /// First deployment of `source_path`.
    ///
    /// # Errors
    ///
    /// Implementation-defined; failures abort the running job.
    fn deploy<'a>(&'a self, source_path: &'a Path) -> BoxFuture<'a, Result<Deployment>>;

    /// Replace the deployment at `url` with `source_path`.
    ///
    /// # Errors
    ///
    /// Implementation-defined; failures abort the running job.
    fn redeploy<'a>(&'a self, source_path: &'a Path, url: &'a str)
        -> BoxFuture<'a, Result<Deployment>>;
}

/// Checks that a deployed URL responds.
pub trait HealthCheck: Send + Sync {
    /// Probe `url`.
    ///
    /// # Errors
    ///
    /// Implementation-defined; an unhealthy report is not an error.
    fn check<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<HealthReport>>;
}

/// Turns a template id plus variables into the text sent to the worker.
pub trait PromptRenderer: Send + Sync {
    /// Render `template_id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown template.
    fn render(&self, template_id: &str, variables: &BTreeMap<String, String>) -> Result<String>;
}

/// Stand-in used when no deployer or health checker is wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unconfigured;

impl Deployer for Unconfigured {
    fn deploy<'a>(&'a self, _source_path: &'a Path) -> BoxFuture<'a, Result<Deployment>> {
        Box::pin(async { Err(AppError::Config("no deployer configured".into())) })
    }

    fn redeploy<'a>(
        &'a self,
        _source_path: &'a Path,
        _url: &'a str,
    ) -> BoxFuture<'a, Result<Deployment>> {
        Box::pin(async { Err(AppError::Config("no deployer configured".into())) })
    }
}

impl HealthCheck for Unconfigured {
    fn check<'a>(&'a self, _url: &'a str) -> BoxFuture<'a, Result<HealthReport>> {
        Box::pin(async { Err(AppError::Config("no health checker configured".into())) })
    }
}

/// Renderer substituting `{{name}}` placeholders.
///
/// Templates come from an in-memory table first, then from
/// `<dir>/<template_id>.md` when a directory is set.
#[derive(Debug, Default, Clone)]
pub struct TemplateRenderer {
    templates: HashMap<String, String>,
    dir: Option<PathBuf>,
}

impl TemplateRenderer {
    /// Renderer with no templates.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Also look up templates as files in `dir`.
    #[must_use]
    pub fn with_dir(mut self, dir: PathBuf) -> Self {
        self.dir = Some(dir);
        self
    }

    /// Register an in-memory template.
    #[must_use]
    pub fn with_template(mut self, id: impl Into<String>, body: impl Into<String>) -> Self {
        self.templates.insert(id.into(), body.into());
        self
    }

    fn source(&self, template_id: &str) -> Result<String> {
        if let Some(body) = self.templates.get(template_id) {
            return Ok(body.clone());
        }
        let valid_name = !template_id.is_empty()
            && template_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        match &self.dir {
            Some(dir) if valid_name => {
                let path = dir.join(format!("{template_id}.md"));
                std::fs::read_to_string(&path).map_err(|err| {
                    AppError::NotFound(format!("template {template_id}: {err}"))
                })
            }
            _ => Err(AppError::NotFound(format!("template {template_id}"))),
        }
    }
}

impl PromptRenderer for TemplateRenderer {
    fn render(&self, template_id: &str, variables: &BTreeMap<String, String>) -> Result<String> {
        let mut text = self.source(template_id)?;
        for (name, value) in variables {
            text = text.replace(&format!("{{{{{name}}}}}"), value);
        }
        Ok(text)
    }
}

/// The external services available to jobs.
#[derive(Clone)]
pub struct Collaborators {
    /// Deployment service.
    pub deployer: Arc<dyn Deployer>,
    /// Deployed-artifact health checker.
    pub health: Arc<dyn HealthCheck>,
    /// Prompt renderer.
    pub renderer: Arc<dyn PromptRenderer>,
}

impl Collaborators {
    /// Template files under `templates_dir`; deploy and verify jobs fail
    /// until real services are supplied.
    #[must_use]
    pub fn unconfigured(templates_dir: PathBuf) -> Self {
        Self {
            deployer: Arc::new(Unconfigured),
            health: Arc::new(Unconfigured),
            renderer: Arc::new(TemplateRenderer::new().with_dir(templates_dir)),
        }
    }
}
