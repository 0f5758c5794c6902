//! Remote administration requests shared by both roles.

use std::path::{Component, Path, PathBuf};

use base64::Engine;
use serde_json::Value;

use crate::crypto::cipher::encrypt_payload;
use crate::error::{Error, Result};
use crate::frame::{now_ms, Frame};
use crate::router::AdminOp;
use crate::session::descriptor::Role;
use crate::session::SessionContext;

/// Runs `op` and returns the response frame. Failures are reported in the
/// response's `error` field.
pub async fn handle(ctx: &SessionContext, op: AdminOp, request: Frame) -> Frame {
    let mut response = request.clone().into_response(ctx.role());
    let outcome = match op {
        AdminOp::Restart => restart(ctx, &mut response).await,
        AdminOp::UploadCode => upload_code(ctx, &mut response).await,
        AdminOp::UpdateCode => update_code(ctx, &request, &mut response).await,
        AdminOp::UploadEventLog => upload_event_log(ctx, &request, &mut response).await,
    };
    if let Err(err) = outcome {
        tracing::debug!(?op, error = %err, "admin request failed");
        response.set("result", "fail").set("error", err.to_string());
    }
    response
}

async fn restart(ctx: &SessionContext, response: &mut Frame) -> Result<()> {
    let config = ctx.config();
    if !config.restartable {
        return Err(Error::Resource("process is not restartable".into()));
    }
    request_restart(&config.restart_marker).await?;
    ctx.log().record("remote", "restart", &[]);
    response.set("result", "success").set("restartable", true);
    Ok(())
}

/// Asks the supervising process for a restart by touching the marker file.
pub async fn request_restart(marker: &Path) -> Result<()> {
    write_file(marker, now_ms().to_string().as_bytes()).await
}

fn code_file(ctx: &SessionContext) -> Result<PathBuf> {
    let code = &ctx.config().code;
    match (&code.filename, code.allow) {
        (Some(filename), true) => Ok(filename.clone()),
        _ => Err(Error::Resource("remote code access is not allowed".into())),
    }
}

async fn upload_code(ctx: &SessionContext, response: &mut Frame) -> Result<()> {
    let path = code_file(ctx)?;
    let content = tokio::fs::read(&path).await?;
    response
        .set("appData", base64::engine::general_purpose::STANDARD.encode(content))
        .set("filename", path.display().to_string())
        .set("result", "success");
    Ok(())
}

async fn update_code(ctx: &SessionContext, request: &Frame, response: &mut Frame) -> Result<()> {
    let path = code_file(ctx)?;
    let encoded = request
        .str_field("appData")
        .ok_or_else(|| Error::Resource("missing appData".into()))?;
    let content = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| Error::Resource(format!("invalid appData: {e}")))?;
    write_file(&path, &content).await?;
    response.remove("appData");
    response.set("result", "success");
    ctx.log().record("remote", "code updated", &[path.display().to_string().as_str()]);
    if ctx.config().restartable {
        request_restart(&ctx.config().restart_marker).await?;
        response.set("restart", true);
    }
    Ok(())
}

async fn upload_event_log(ctx: &SessionContext, request: &Frame, response: &mut Frame) -> Result<()> {
    let contents = ctx.log().contents()?;
    if request.flag("enc") {
        let keys = ctx.key_source().exchange().await?;
        let payload = encrypt_payload(&keys, contents.as_bytes())?;
        if let Value::Object(fields) = serde_json::to_value(&payload)? {
            response.merge(&fields);
        }
    } else {
        response.set("eventLog", contents);
    }
    response.set("result", "success");
    Ok(())
}

/// Rejects absolute paths and parent references.
fn confined(root: &Path, relative: &str) -> Result<PathBuf> {
    let path = Path::new(relative);
    if relative.is_empty()
        || path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(Error::Validation(format!("refusing update path {relative}")));
    }
    Ok(root.join(path))
}

/// Writes the files of a pushed module update: `file.<key>` holds the
/// contents and `path.<key>` the relative destination. Returns the paths
/// written.
pub async fn apply_module_update(update: &Frame, root: &Path) -> Result<Vec<PathBuf>> {
    let files = update
        .get("file")
        .and_then(Value::as_object)
        .ok_or_else(|| Error::Protocol("module update without files".into()))?;
    let paths = update
        .get("path")
        .and_then(Value::as_object)
        .ok_or_else(|| Error::Protocol("module update without paths".into()))?;

    let mut targets = Vec::with_capacity(files.len());
    for (key, content) in files {
        let relative = paths
            .get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Protocol(format!("no path for module file {key}")))?;
        let content = match content {
            Value::String(text) => text.clone(),
            other => serde_json::to_string_pretty(other)?,
        };
        targets.push((confined(root, relative)?, content));
    }
    let mut written = Vec::with_capacity(targets.len());
    for (path, content) in targets {
        write_file(&path, content.as_bytes()).await?;
        written.push(path);
    }
    Ok(written)
}

/// Applies a module update and builds the acknowledgement.
pub async fn module_update_response(update: Frame, root: &Path, role: Role) -> Frame {
    let result = apply_module_update(&update, root).await;
    let mut response = Frame::new();
    for key in ["id", "appId", "aid", "_pid"] {
        if let Some(value) = update.get(key) {
            response.set(key, value.clone());
        }
    }
    let mut response = response.into_response(role);
    match result {
        Ok(written) => {
            tracing::info!(files = written.len(), "module update applied");
            response.set("update", "success");
        }
        Err(err) => {
            tracing::warn!(error = %err, "module update rejected");
            response.set("update", "fail").set("error", err.to_string());
        }
    }
    response
}

async fn write_file(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    tokio::fs::write(path, content).await?;
    Ok(())
}
