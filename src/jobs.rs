//! Step lists for each job payload.
//!
//! `steps_for` matches the closed [`JobPayload`] enum exhaustively, so a
//! new job type cannot be queued without deciding how it runs.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::info;

use crate::models::outcome::SignalKind;
use crate::models::work_item::JobPayload;
use crate::orchestrator::pipeline::{Step, StepContext};
use crate::{AppError, Result};

/// Step ids, stable across releases since they are persisted.
pub mod step_ids {
    /// Render the prompt template.
    pub const RENDER_PROMPT: &str = "render_prompt";
    /// Send the prompt to the worker.
    pub const DISPATCH_PROMPT: &str = "dispatch_prompt";
    /// Wait for the worker's acknowledgement.
    pub const AWAIT_ACK: &str = "await_ack";
    /// Wait for the worker to finish.
    pub const AWAIT_DONE: &str = "await_done";
    /// First deployment.
    pub const DEPLOY: &str = "deploy";
    /// Replacement deployment.
    pub const REDEPLOY: &str = "redeploy";
    /// Health check of the deployed URL.
    pub const HEALTH_CHECK: &str = "health_check";
}

use step_ids::{AWAIT_ACK, AWAIT_DONE, DEPLOY, DISPATCH_PROMPT, HEALTH_CHECK, REDEPLOY, RENDER_PROMPT};

const DISPATCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Ordered steps implementing `payload`.
#[must_use]
pub fn steps_for(payload: &JobPayload) -> Vec<Step> {
    match payload {
        JobPayload::Prompt {
            template_id,
            variables,
        } => vec![
            render_prompt(template_id.clone(), variables.clone()),
            dispatch_prompt(),
            await_signal(AWAIT_ACK, "Await acknowledgement", SignalKind::Ack),
            await_signal(AWAIT_DONE, "Await completion", SignalKind::Done),
        ],
        JobPayload::Deploy { source_path } => vec![
            deploy(source_path.clone(), None),
            health_check(None, Some(DEPLOY)),
        ],
        JobPayload::Redeploy { source_path, url } => vec![
            deploy(source_path.clone(), Some(url.clone())),
            health_check(Some(url.clone()), Some(REDEPLOY)),
        ],
        JobPayload::Verify { url } => vec![health_check(Some(url.clone()), None)],
    }
}

fn step_error(step_id: &str, step_name: &str, message: impl Into<String>) -> AppError {
    AppError::Step {
        step_id: step_id.to_owned(),
        step_name: step_name.to_owned(),
        message: message.into(),
    }
}

fn render_prompt(template_id: String, variables: BTreeMap<String, String>) -> Step {
    Step::new(RENDER_PROMPT, "Render prompt", move |ctx| {
        run_render_prompt(ctx, template_id, variables)
    })
}

async fn run_render_prompt(
    ctx: StepContext,
    template_id: String,
    variables: BTreeMap<String, String>,
) -> Result<Option<Value>> {
    let prompt = ctx
        .collaborators
        .renderer
        .render(&template_id, &variables)?;
    Ok(Some(json!({ "template_id": template_id, "prompt": prompt })))
}

const DISPATCH_NAME: &str = "Send prompt to worker";

fn dispatch_prompt() -> Step {
    Step::new(DISPATCH_PROMPT, DISPATCH_NAME, run_dispatch_prompt).with_timeout(DISPATCH_TIMEOUT)
}

async fn run_dispatch_prompt(ctx: StepContext) -> Result<Option<Value>> {
    let prompt = ctx
        .result_of(RENDER_PROMPT)
        .and_then(|rendered| rendered.get("prompt"))
        .and_then(Value::as_str)
        .ok_or_else(|| step_error(DISPATCH_PROMPT, DISPATCH_NAME, "no rendered prompt"))?
        .to_owned();

    // Clear stale signals before the worker can possibly answer.
    ctx.signals.begin(&ctx.session_id).await?;
    ctx.handle.send_line(&prompt).await?;
    info!(session_id = %ctx.session_id, bytes = prompt.len(), "prompt dispatched");
    Ok(Some(json!({ "bytes": prompt.len(), "backend": ctx.signals.name() })))
}

fn await_signal(id: &'static str, name: &'static str, kind: SignalKind) -> Step {
    Step::new(id, name, move |ctx| run_await_signal(ctx, id, name, kind))
}

async fn run_await_signal(
    ctx: StepContext,
    id: &'static str,
    name: &'static str,
    kind: SignalKind,
) -> Result<Option<Value>> {
    let timeout = match kind {
        SignalKind::Ack => ctx.config.ack_timeout(),
        _ => ctx.config.done_timeout(),
    };
    let outcome = ctx
        .signals
        .await_signal(&ctx.session_id, kind, timeout)
        .await?;
    if outcome.is_failure() {
        let detail = outcome
            .payload
            .get("message")
            .or_else(|| outcome.payload.get("error"))
            .and_then(Value::as_str)
            .map_or_else(|| outcome.payload.to_string(), str::to_owned);
        return Err(step_error(id, name, format!("worker reported failure: {detail}")));
    }
    Ok(Some(serde_json::to_value(&outcome)?))
}

fn deploy(source_path: PathBuf, existing_url: Option<String>) -> Step {
    let (id, name) = match existing_url {
        Some(_) => (REDEPLOY, "Redeploy"),
        None => (DEPLOY, "Deploy"),
    };
    Step::new(id, name, move |ctx| run_deploy(ctx, source_path, existing_url))
}

async fn run_deploy(
    ctx: StepContext,
    source_path: PathBuf,
    existing_url: Option<String>,
) -> Result<Option<Value>> {
    let deployer = &ctx.collaborators.deployer;
    let deployment = match &existing_url {
        Some(url) => deployer.redeploy(&source_path, url).await?,
        None => deployer.deploy(&source_path).await?,
    };
    info!(session_id = %ctx.session_id, url = %deployment.url, "deployed");
    Ok(Some(serde_json::to_value(&deployment)?))
}

fn deployed_url(ctx: &StepContext, from_step: Option<&str>) -> Option<String> {
    ctx.result_of(from_step?)?
        .get("url")?
        .as_str()
        .map(str::to_owned)
}

const HEALTH_CHECK_NAME: &str = "Health check";

fn health_check(fallback_url: Option<String>, from_step: Option<&'static str>) -> Step {
    Step::new(HEALTH_CHECK, HEALTH_CHECK_NAME, move |ctx| {
        run_health_check(ctx, fallback_url, from_step)
    })
}

async fn run_health_check(
    ctx: StepContext,
    fallback_url: Option<String>,
    from_step: Option<&'static str>,
) -> Result<Option<Value>> {
    let url = deployed_url(&ctx, from_step)
        .or(fallback_url)
        .ok_or_else(|| step_error(HEALTH_CHECK, HEALTH_CHECK_NAME, "no url to check"))?;
    let report = ctx.collaborators.health.check(&url).await?;
    if !report.healthy {
        return Err(step_error(
            HEALTH_CHECK,
            HEALTH_CHECK_NAME,
            format!(
                "{url} is unhealthy: {}",
                report.detail.as_deref().unwrap_or("no detail")
            ),
        ));
    }
    Ok(Some(json!({ "url": url, "report": report })))
}

/// Validate a payload before it is queued.
///
/// # Errors
///
/// Returns `AppError::Config` for payloads that can never run.
pub fn validate(payload: &JobPayload) -> Result<()> {
    match payload {
        JobPayload::Prompt { template_id, .. } if template_id.trim().is_empty() => {
            Err(AppError::Config("prompt job needs a template_id".into()))
        }
        JobPayload::Redeploy { url, .. } | JobPayload::Verify { url } if url.trim().is_empty() => {
            Err(AppError::Config(format!("{} job needs a url", payload.job_type())))
        }
        _ => Ok(()),
    }
}
