use crate::task_store::{Message, STAGE_PRUNE, STAGE_UPDATE, UpdateRunner};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::env;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;

pub(crate) const ENV_DOCKER_BIN: &str = "STATION_DOCKER_BIN";

fn docker_command() -> Command {
    let bin = env::var(ENV_DOCKER_BIN)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| "docker".to_string());
    Command::new(bin)
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StackSummary {
    pub name: String,
    pub status: String,
    pub config_files: Vec<PathBuf>,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: String,
    pub status: String,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ImageSummary {
    pub id: String,
    pub repository: String,
    pub tag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    pub created_at: String,
    pub size: String,
}

impl ImageSummary {
    /// `repository:tag` when both are real values; images without a tag
    /// cannot be checked against a registry.
    pub(crate) fn repo_tag(&self) -> Option<String> {
        if self.repository.is_empty()
            || self.tag.is_empty()
            || self.repository == "<none>"
            || self.tag == "<none>"
        {
            return None;
        }
        Some(format!("{}:{}", self.repository, self.tag))
    }
}

/// Run a listing command to completion and hand back its stdout. Listing
/// output is small, so buffering the whole thing is fine; only updates
/// stream.
fn run_capture(mut cmd: Command, label: &str) -> Result<String, String> {
    let output = cmd
        .stdin(Stdio::null())
        .output()
        .map_err(|e| format!("{label} spawn failed: {e}"))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!(
            "{label} exited with {}: {}",
            exit_label(&output.status),
            stderr.trim()
        ));
    }
    String::from_utf8(output.stdout).map_err(|e| format!("{label} produced invalid utf-8: {e}"))
}

pub(crate) fn list_stacks() -> Result<Vec<StackSummary>, String> {
    let mut cmd = docker_command();
    cmd.args(["compose", "ls", "--all", "--format", "json"]);
    let output = run_capture(cmd, "docker compose ls")?;
    parse_compose_ls(&output)
}

pub(crate) fn list_containers() -> Result<Vec<ContainerSummary>, String> {
    let mut cmd = docker_command();
    cmd.args(["ps", "--all", "--no-trunc", "--format", "json"]);
    let output = run_capture(cmd, "docker ps")?;
    Ok(parse_docker_ps(&output))
}

pub(crate) fn list_images() -> Result<Vec<ImageSummary>, String> {
    let mut cmd = docker_command();
    cmd.args(["image", "ls", "--digests", "--format", "json"]);
    let output = run_capture(cmd, "docker image ls")?;
    Ok(parse_image_ls(&output))
}

/// `docker compose ls --format json` prints an array; older releases print
/// one object per invocation. ConfigFiles is a comma-joined path list.
pub(crate) fn parse_compose_ls(raw: &str) -> Result<Vec<StackSummary>, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let value: Value =
        serde_json::from_str(trimmed).map_err(|e| format!("compose ls parse failed: {e}"))?;
    let items: Vec<&Value> = match &value {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };

    let mut stacks = Vec::new();
    for item in items {
        let Some(name) = item.get("Name").and_then(|v| v.as_str()) else {
            continue;
        };
        let status = item
            .get("Status")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let config_files = item
            .get("ConfigFiles")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .collect();

        stacks.push(StackSummary {
            name: name.to_string(),
            status,
            config_files,
        });
    }

    stacks.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(stacks)
}

/// `docker ps --format json` emits one JSON object per line. Compose
/// membership comes from the standard compose labels.
pub(crate) fn parse_docker_ps(raw: &str) -> Vec<ContainerSummary> {
    let mut containers = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            continue;
        };

        let field = |name: &str| -> String {
            value
                .get(name)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };

        let labels = parse_label_list(&field("Labels"));
        containers.push(ContainerSummary {
            id: field("ID"),
            name: field("Names"),
            image: field("Image"),
            state: field("State"),
            status: field("Status"),
            created_at: field("CreatedAt"),
            stack: labels.get("com.docker.compose.project").cloned(),
            service: labels.get("com.docker.compose.service").cloned(),
        });
    }
    containers
}

pub(crate) fn parse_image_ls(raw: &str) -> Vec<ImageSummary> {
    let mut images = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            continue;
        };

        let field = |name: &str| -> String {
            value
                .get(name)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };

        let digest = match field("Digest") {
            d if d.is_empty() || d == "<none>" => None,
            d => Some(d),
        };

        images.push(ImageSummary {
            id: field("ID"),
            repository: field("Repository"),
            tag: field("Tag"),
            digest,
            created_at: field("CreatedAt"),
            size: field("Size"),
        });
    }
    images
}

fn parse_label_list(raw: &str) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    for part in raw.split(',') {
        if let Some((key, value)) = part.split_once('=') {
            labels.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    labels
}

/// Look for an env file next to the stack's compose files: `<config>.env`
/// first, then a sibling `.env`.
pub(crate) fn infer_env_file(config_files: &[PathBuf]) -> Option<PathBuf> {
    for path in config_files {
        let with_ext = path.with_extension("env");
        if with_ext.is_file() {
            return Some(with_ext);
        }
        let sibling = path.with_file_name(".env");
        if sibling.is_file() {
            return Some(sibling);
        }
    }
    None
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct UpdateOptions {
    pub infer_envfile: bool,
    pub restart_containers: bool,
    pub prune_images: bool,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            infer_envfile: true,
            restart_containers: true,
            prune_images: false,
        }
    }
}

/// The external update procedure: pull (and usually restart) one compose
/// stack or a single service in it, streaming the tool's output as progress
/// messages.
pub(crate) struct ComposeUpdater {
    stack: String,
    service: Option<String>,
    options: UpdateOptions,
}

impl ComposeUpdater {
    pub(crate) fn new(stack: &str, service: Option<&str>, options: UpdateOptions) -> Self {
        Self {
            stack: stack.to_string(),
            service: service.map(str::to_string),
            options,
        }
    }
}

impl UpdateRunner for ComposeUpdater {
    fn run(self: Box<Self>, emit: &mut dyn FnMut(Message)) -> Result<(), String> {
        let stacks = list_stacks()?;
        let Some(stack) = stacks.into_iter().find(|s| s.name == self.stack) else {
            return Err(format!("compose stack '{}' not found", self.stack));
        };

        let env_file = if self.options.infer_envfile {
            infer_env_file(&stack.config_files)
        } else {
            None
        };

        let mut cmd = docker_command();
        cmd.arg("compose");
        for file in &stack.config_files {
            cmd.arg("-f").arg(file);
        }
        if let Some(env_file) = &env_file {
            cmd.arg("--env-file").arg(env_file);
        }
        if self.options.restart_containers {
            cmd.args(["up", "--detach", "--pull", "always"]);
        } else {
            cmd.arg("pull");
        }
        if let Some(service) = &self.service {
            cmd.arg(service);
        }
        stream_command(cmd, "docker compose", STAGE_UPDATE, emit)?;

        if self.options.prune_images {
            let mut prune = docker_command();
            prune.args(["image", "prune", "--force"]);
            stream_command(prune, "docker image prune", STAGE_PRUNE, emit)?;
        }

        Ok(())
    }
}

/// Run a command and emit its output line-by-line as it is produced. Compose
/// writes progress to stderr, so stderr is streamed live on this thread and
/// stdout is collected by a side thread and emitted afterwards.
fn stream_command(
    mut cmd: Command,
    label: &str,
    stage: &str,
    emit: &mut dyn FnMut(Message),
) -> Result<(), String> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|e| format!("{label} spawn failed: {e}"))?;

    let stdout_lines = child.stdout.take().map(|out| {
        thread::spawn(move || {
            BufReader::new(out)
                .lines()
                .map_while(Result::ok)
                .collect::<Vec<String>>()
        })
    });

    if let Some(stderr) = child.stderr.take() {
        for line in BufReader::new(stderr).lines() {
            let Ok(line) = line else { break };
            let trimmed = line.trim_end();
            if trimmed.is_empty() {
                continue;
            }
            emit(Message::line(stage, trimmed.to_string()));
        }
    }

    if let Some(handle) = stdout_lines {
        for line in handle.join().unwrap_or_default() {
            if line.trim().is_empty() {
                continue;
            }
            emit(Message::line(stage, line));
        }
    }

    let status = child
        .wait()
        .map_err(|e| format!("{label} wait failed: {e}"))?;
    if !status.success() {
        return Err(format!("{label} exited with {}", exit_label(&status)));
    }
    Ok(())
}

fn exit_label(status: &ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("code {code}"),
        None => "signal".to_string(),
    }
}
