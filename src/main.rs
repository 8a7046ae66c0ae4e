mod cache;
mod compose;
mod registry_digest;
mod task_store;

use crate::cache::{
    CacheBypass, CacheStore, CachedOp, CachedOutcome, DEFAULT_CACHE_TTL_SECS, OP_GET_STACK,
    OP_LIST_CONTAINERS, OP_LIST_IMAGES, OP_LIST_STACKS, fetch_through, invalidate_listing_caches,
    whole_namespace_prefix,
};
use crate::compose::{ComposeUpdater, UpdateOptions};
use crate::task_store::{
    CreateOutcome, DEFAULT_TASK_TTL_SECS, PollOutcome, TaskKey, TaskStore, UpdateRunner,
};
use regex::Regex;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use sqlx::SqlitePool;
use sqlx::migrate::Migrator;
use sqlx::sqlite::SqlitePoolOptions;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use subtle::ConstantTimeEq;
use tokio::runtime::Runtime;
use url::Url;

const LOG_TAG: &str = "compose-station";
const DEFAULT_DB_PATH: &str = "data/compose-station.db";
const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:3001";

const ENV_PROFILE: &str = "STATION_ENV";
const ENV_DB_URL: &str = "STATION_DB_URL";
const ENV_HTTP_ADDR: &str = "STATION_HTTP_ADDR";
const ENV_API_TOKEN: &str = "STATION_API_TOKEN";
const ENV_CACHE_TTL_SECS: &str = "STATION_CACHE_TTL_SECS";
const ENV_TASK_TTL_SECS: &str = "STATION_TASK_TTL_SECS";

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(1);
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

fn main() {
    let mut args = env::args();
    let exe = args.next().unwrap_or_else(|| "compose-station".into());
    let Some(raw_cmd) = args.next() else {
        print_usage(&exe);
        std::process::exit(1);
    };

    apply_env_profile_defaults();

    let command = normalize_command(&raw_cmd);
    let remaining: Vec<String> = args.collect();

    match command.as_str() {
        "serve" => run_serve_cli(&remaining),
        "update" => run_update_cli(&remaining),
        "list-stacks" => run_list_stacks_cli(&remaining),
        "clear-cache" => run_clear_cache_cli(&remaining),
        "version" => {
            println!("{}", release_tag());
            std::process::exit(0);
        }
        "help" => {
            print_usage(&exe);
            std::process::exit(0);
        }
        _ => {
            eprintln!("unknown command: {raw_cmd}");
            print_usage(&exe);
            std::process::exit(2);
        }
    }
}

fn print_usage(exe: &str) {
    eprintln!("Usage: {exe} <command> [args]");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  serve                      run the HTTP API server ({ENV_HTTP_ADDR})");
    eprintln!("  update <stack> [service]   update a compose stack in the foreground");
    eprintln!("      [--pull-only] [--prune] [--no-envfile]");
    eprintln!("  list-stacks                print known compose stacks");
    eprintln!("  clear-cache [namespace]    drop cached API responses");
    eprintln!("  version                    print the release tag");
}

fn normalize_command(raw: &str) -> String {
    raw.trim_start_matches('-').to_lowercase()
}

fn release_tag() -> String {
    if let Some(tag) = option_env!("STATION_BUILD_TAG") {
        let trimmed = tag.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    let version = option_env!("STATION_BUILD_VERSION")
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(env!("CARGO_PKG_VERSION"));
    format!("v{version}")
}

fn apply_env_profile_defaults() {
    // STATION_ENV selects a coarse runtime profile: "test" favors throw-away
    // in-memory defaults, anything else behaves like "dev"/"prod".
    let profile = env::var(ENV_PROFILE)
        .unwrap_or_else(|_| "dev".to_string())
        .to_ascii_lowercase();

    // Only fill unset or empty variables so explicit configuration wins.
    let ensure = |key: &str, value: String| {
        if env::var(key)
            .ok()
            .map(|v| v.trim().is_empty())
            .unwrap_or(true)
        {
            // SAFETY: called once at process start before any other threads
            // exist, so mutating the environment is safe.
            unsafe {
                env::set_var(key, value);
            }
        }
    };

    if profile == "test" || profile == "testing" {
        ensure(ENV_DB_URL, "sqlite::memory:?cache=shared".to_string());
    } else {
        // Anchor the default DB under the compiled project root so the path
        // does not depend on the process CWD.
        let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
        let db_abs = manifest_dir.join(DEFAULT_DB_PATH);
        ensure(ENV_DB_URL, format!("sqlite://{}", db_abs.to_string_lossy()));
    }
}

/// Everything a request handler needs, wired up once at startup and shared
/// across connection threads.
struct AppState {
    cache: Arc<CacheStore>,
    tasks: Arc<TaskStore>,
    runtime: Arc<Runtime>,
    cache_ttl_secs: u64,
    db_url: String,
    db_error: Option<String>,
}

fn build_state() -> Result<Arc<AppState>, String> {
    let runtime =
        Arc::new(Runtime::new().map_err(|e| format!("failed to create tokio runtime: {e}"))?);

    let (pool, db_url, db_error) = init_db_pool(&runtime)?;
    let cache = Arc::new(CacheStore::new(pool, runtime.clone()));

    let cache_ttl_secs = env_u64(ENV_CACHE_TTL_SECS, DEFAULT_CACHE_TTL_SECS)?;
    let task_ttl_secs = env_u64(ENV_TASK_TTL_SECS, DEFAULT_TASK_TTL_SECS)?;

    // Task completion and eviction both funnel into the same listing-cache
    // invalidation.
    let cache_for_hook = cache.clone();
    let tasks = Arc::new(TaskStore::new(
        Duration::from_secs(task_ttl_secs),
        Arc::new(move || invalidate_listing_caches(&cache_for_hook)),
    ));

    Ok(Arc::new(AppState {
        cache,
        tasks,
        runtime,
        cache_ttl_secs,
        db_url,
        db_error,
    }))
}

/// Open the configured sqlite database and run migrations. A broken or
/// unwritable URL degrades to an in-memory pool so the server still comes up;
/// the error is kept for /health.
fn init_db_pool(runtime: &Runtime) -> Result<(SqlitePool, String, Option<String>), String> {
    let url = env::var(ENV_DB_URL)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| format!("sqlite://{DEFAULT_DB_PATH}"));
    let trimmed = url.trim().to_string();

    let memory_pool = |runtime: &Runtime| -> Result<SqlitePool, String> {
        runtime.block_on(async {
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .connect("sqlite::memory:")
                .await
                .map_err(|e| e.to_string())?;
            MIGRATOR.run(&pool).await.map_err(|e| e.to_string())?;
            Ok(pool)
        })
    };

    if !trimmed.starts_with("sqlite://") && !trimmed.starts_with("sqlite::") {
        let message = format!("unsupported database url: {url} (only sqlite:// is supported)");
        log_message(&format!("warn db-init-unsupported {message}"));
        return Ok((memory_pool(runtime)?, url, Some(message)));
    }

    let storage_ready = ensure_sqlite_storage(&trimmed).err();
    let pool_result = runtime.block_on(async {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&trimmed)
            .await?;
        MIGRATOR.run(&pool).await?;
        Ok::<SqlitePool, sqlx::Error>(pool)
    });

    match pool_result {
        Ok(pool) => Ok((pool, url, None)),
        Err(err) => {
            let mut message = format!("failed to initialize database at {url}: {err}");
            if let Some(storage_err) = storage_ready {
                message.push_str(&format!("; {storage_err}"));
            }
            message.push_str(&format!("; adjust {ENV_DB_URL} to a writable path"));

            log_message(&format!("warn db-init-fallback {message}"));
            Ok((memory_pool(runtime)?, url, Some(message)))
        }
    }
}

fn ensure_sqlite_storage(conn: &str) -> Result<(), String> {
    if let Some(path) = conn.strip_prefix("sqlite://") {
        let path = Path::new(path);
        if let Some(parent) = path.parent() {
            if let Err(err) = fs::create_dir_all(parent) {
                let message = format!("db-dir-create-failed path={} err={}", parent.display(), err);
                log_message(&format!("warn {message}"));
                return Err(message);
            }
        }

        // Connecting to a non-existent file can fail with `code: 14` on some
        // sqlite builds instead of creating the file implicitly.
        if !path.exists() {
            if let Err(err) = File::create(path) {
                let message = format!("db-file-create-failed path={} err={}", path.display(), err);
                log_message(&format!("warn {message}"));
                return Err(message);
            }
        }
    }

    Ok(())
}

fn run_serve_cli(_args: &[String]) -> ! {
    let state = build_state().unwrap_or_else(|err| {
        eprintln!("failed to initialize: {err}");
        std::process::exit(1);
    });
    if let Some(err) = &state.db_error {
        log_message(&format!("warn serving with degraded database: {err}"));
    }

    let addr = env::var(ENV_HTTP_ADDR).unwrap_or_else(|_| DEFAULT_HTTP_ADDR.to_string());
    let listener = TcpListener::bind(&addr).unwrap_or_else(|err| {
        eprintln!("failed to bind HTTP address {addr}: {err}");
        std::process::exit(1);
    });

    eprintln!("listening on http://{addr}");

    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                let state = state.clone();
                thread::spawn(move || {
                    if let Err(err) = handle_connection(stream, &state) {
                        log_message(&format!("500 connection-error peer={peer:?} {err}"));
                    }
                });
            }
            Err(err) => {
                eprintln!("accept failed: {err}");
                // avoid busy loop on fatal errors
                thread::sleep(Duration::from_millis(200));
            }
        }
    }
}

fn run_update_cli(args: &[String]) -> ! {
    let mut positional = Vec::new();
    let mut options = UpdateOptions::default();
    for arg in args {
        match arg.as_str() {
            "--pull-only" => options.restart_containers = false,
            "--prune" => options.prune_images = true,
            "--no-envfile" => options.infer_envfile = false,
            other if other.starts_with("--") => {
                eprintln!("unknown flag: {other}");
                std::process::exit(2);
            }
            other => positional.push(other.to_string()),
        }
    }

    let Some(stack) = positional.first() else {
        eprintln!("update requires a stack name");
        std::process::exit(2);
    };
    let service = positional.get(1).map(String::as_str);

    let updater = ComposeUpdater::new(stack, service, options);
    let result = Box::new(updater).run(&mut |msg| match &msg.message {
        Some(line) => println!("[{}] {line}", msg.stage),
        None => println!("[{}]", msg.stage),
    });

    match result {
        Ok(()) => {
            // Listings are stale now; drop them if the cache is reachable.
            match build_state() {
                Ok(state) => invalidate_listing_caches(&state.cache),
                Err(err) => log_message(&format!("warn cache-invalidate-skipped {err}")),
            }
            std::process::exit(0);
        }
        Err(err) => {
            eprintln!("update failed: {err}");
            std::process::exit(1);
        }
    }
}

fn run_list_stacks_cli(_args: &[String]) -> ! {
    match compose::list_stacks() {
        Ok(stacks) => {
            for stack in stacks {
                let files: Vec<String> = stack
                    .config_files
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect();
                println!("{}\t{}\t{}", stack.name, stack.status, files.join(","));
            }
            std::process::exit(0);
        }
        Err(err) => {
            eprintln!("list-stacks failed: {err}");
            std::process::exit(1);
        }
    }
}

fn run_clear_cache_cli(args: &[String]) -> ! {
    let state = build_state().unwrap_or_else(|err| {
        eprintln!("failed to initialize: {err}");
        std::process::exit(1);
    });

    // With a namespace argument only that namespace is dropped; without one
    // the whole cache goes.
    let prefix = match args.first() {
        Some(namespace) => whole_namespace_prefix(namespace),
        None => String::new(),
    };

    match state.cache.clear_namespace(&prefix) {
        Ok(removed) => {
            println!("removed {removed} cached entries");
            std::process::exit(0);
        }
        Err(err) => {
            eprintln!("clear-cache failed ({}): {}", err.code(), err.detail());
            std::process::exit(1);
        }
    }
}

struct RequestContext {
    method: String,
    path: String,
    query: Option<String>,
    headers: HashMap<String, String>,
    body: Vec<u8>,
    request_id: String,
    started_at: Instant,
}

fn handle_connection(stream: TcpStream, state: &AppState) -> Result<(), String> {
    let started_at = Instant::now();
    let request_id = next_request_id();

    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .map_err(|e| e.to_string())?;
    let mut reader = BufReader::new(stream.try_clone().map_err(|e| e.to_string())?);
    let mut stream = stream;

    let mut request_line = String::new();
    reader
        .read_line(&mut request_line)
        .map_err(|e| e.to_string())?;
    let request_line = request_line.trim_end_matches(['\r', '\n']).to_string();

    let (method, raw_target) = parse_request_line(&request_line);
    if method.is_empty() || raw_target.is_empty() {
        log_message(&format!("400 bad-request {}", redact_token(&request_line)));
        return send_response(&mut stream, 400, "BadRequest", "text/plain", &[], b"bad request");
    }

    let (path, query) = match parse_target(&raw_target) {
        Ok(parts) => parts,
        Err(e) => {
            log_message(&format!("400 bad-request {}", redact_token(&request_line)));
            return send_response(&mut stream, 400, "BadRequest", "text/plain", &[], e.as_bytes());
        }
    };

    let headers = read_headers(&mut reader)?;
    let content_length = headers
        .get("content-length")
        .and_then(|v| v.parse::<usize>().ok());
    let transfer_encoding = headers
        .get("transfer-encoding")
        .map(|s| s.to_ascii_lowercase());

    // Only read a body when the client explicitly signals one. Reading to EOF
    // on a plain GET would deadlock while the client keeps the socket open.
    let mut body = Vec::new();
    if let Some(len) = content_length {
        body.resize(len, 0);
        reader
            .read_exact(&mut body)
            .map_err(|e| format!("failed to read body: {e}"))?;
    } else if transfer_encoding
        .as_deref()
        .map(|enc| enc.contains("chunked"))
        .unwrap_or(false)
    {
        body = read_chunked_body(&mut reader)?;
    }

    let ctx = RequestContext {
        method,
        path,
        query,
        headers,
        body,
        request_id,
        started_at,
    };

    route_request(&ctx, &mut stream, state)
}

fn route_request(
    ctx: &RequestContext,
    stream: &mut TcpStream,
    state: &AppState,
) -> Result<(), String> {
    let segments: Vec<&str> = ctx.path.split('/').filter(|s| !s.is_empty()).collect();

    match (ctx.method.as_str(), segments.as_slice()) {
        ("GET", ["health"]) => handle_health(ctx, stream, state),
        ("GET", ["api", "stacks"]) => {
            cached_get(ctx, stream, state, OP_LIST_STACKS, &[], stacks_payload)
        }
        ("GET", ["api", "stacks", stack]) => {
            let name = stack.to_string();
            cached_get(ctx, stream, state, OP_GET_STACK, &[*stack], move || {
                get_stack_payload(&name)
            })
        }
        ("GET", ["api", "containers"]) => cached_get(
            ctx,
            stream,
            state,
            OP_LIST_CONTAINERS,
            &[],
            containers_payload,
        ),
        ("GET", ["api", "images"]) => {
            cached_get(ctx, stream, state, OP_LIST_IMAGES, &[], || {
                images_payload(state)
            })
        }
        ("POST", ["api", "stacks", stack]) => {
            handle_start_update(ctx, stream, state, stack, None)
        }
        ("POST", ["api", "stacks", stack, service]) => {
            handle_start_update(ctx, stream, state, stack, Some(*service))
        }
        ("GET", ["api", "stacks", stack, "updates"]) => {
            handle_poll_updates(ctx, stream, state, &TaskKey::whole_stack(stack))
        }
        ("GET", ["api", "stacks", stack, service, "updates"]) => {
            handle_poll_updates(ctx, stream, state, &TaskKey::named(stack, service))
        }
        _ => {
            respond_json(
                stream,
                ctx,
                404,
                "NotFound",
                &json!({ "error": "not found" }),
                &[],
            )
        }
    }
}

fn handle_health(
    ctx: &RequestContext,
    stream: &mut TcpStream,
    state: &AppState,
) -> Result<(), String> {
    let degraded = state.db_error.is_some();
    let payload = json!({
        "status": if degraded { "degraded" } else { "ok" },
        "db": { "url": state.db_url, "error": state.db_error },
        "tasks": { "tracked": state.tasks.len() },
        "version": release_tag(),
    });
    let (status, reason) = if degraded {
        (503, "ServiceUnavailable")
    } else {
        (200, "OK")
    };
    respond_json(stream, ctx, status, reason, &payload, &[])
}

/// Shared handler for the cached listing endpoints: resolve the bypass mode
/// from query flags, run the request through the cache, and translate the
/// outcome into an HTTP response with an ETag.
fn cached_get<F>(
    ctx: &RequestContext,
    stream: &mut TcpStream,
    state: &AppState,
    op: CachedOp,
    positional: &[&str],
    produce: F,
) -> Result<(), String>
where
    F: FnOnce() -> Result<String, String>,
{
    let bypass = if query_flag(ctx, &["no_store"]) {
        CacheBypass::NoStore
    } else if query_flag(ctx, &["no_cache"]) {
        CacheBypass::NoCache
    } else {
        CacheBypass::None
    };
    let if_none_match = ctx.headers.get("if-none-match").map(String::as_str);

    match fetch_through(
        &state.cache,
        op,
        positional,
        &[],
        state.cache_ttl_secs,
        bypass,
        if_none_match,
        produce,
    ) {
        Ok(CachedOutcome::NotModified { etag }) => {
            log_request(ctx, 304);
            send_response(
                stream,
                304,
                "NotModified",
                "application/json; charset=utf-8",
                &[("ETag", etag)],
                b"",
            )
        }
        Ok(CachedOutcome::Value {
            body,
            etag,
            from_cache,
        }) => {
            log_request(ctx, 200);
            let cache_state = if from_cache { "hit" } else { "miss" };
            send_response(
                stream,
                200,
                "OK",
                "application/json; charset=utf-8",
                &[("ETag", etag), ("X-Cache", cache_state.to_string())],
                body.as_bytes(),
            )
        }
        Err(err) if err == "stack-not-found" => respond_json(
            stream,
            ctx,
            404,
            "NotFound",
            &json!({ "error": "stack not found" }),
            &[],
        ),
        Err(err) => {
            log_message(&format!("warn listing-failed op={} err={err}", ctx.path));
            respond_json(
                stream,
                ctx,
                502,
                "BadGateway",
                &json!({ "error": err }),
                &[],
            )
        }
    }
}

fn stacks_payload() -> Result<String, String> {
    let stacks = compose::list_stacks()?;
    serde_json::to_string(&json!({ "stacks": stacks })).map_err(|e| e.to_string())
}

fn get_stack_payload(stack: &str) -> Result<String, String> {
    let stacks = compose::list_stacks()?;
    let Some(summary) = stacks.into_iter().find(|s| s.name == stack) else {
        return Err("stack-not-found".to_string());
    };

    let containers: Vec<_> = compose::list_containers()?
        .into_iter()
        .filter(|c| c.stack.as_deref() == Some(stack))
        .collect();
    let mut services: Vec<String> = containers
        .iter()
        .filter_map(|c| c.service.clone())
        .collect();
    services.sort();
    services.dedup();

    serde_json::to_string(&json!({
        "name": summary.name,
        "status": summary.status,
        "configFiles": summary.config_files,
        "services": services,
        "containers": containers,
    }))
    .map_err(|e| e.to_string())
}

fn containers_payload() -> Result<String, String> {
    let containers = compose::list_containers()?;
    serde_json::to_string(&json!({ "containers": containers })).map_err(|e| e.to_string())
}

/// Image listing enriched with the digest each registry currently serves.
/// `hasUpdates` is null when the comparison is not possible (untagged image,
/// registry error, unknown local digest).
fn images_payload(state: &AppState) -> Result<String, String> {
    let images = compose::list_images()?;

    let mut entries = Vec::with_capacity(images.len());
    for image in images {
        let mut remote_digest = None;
        let mut has_updates = Value::Null;

        if let Some(reference) = image.repo_tag() {
            match registry_digest::get_remote_digest(&state.cache, &state.runtime, &reference) {
                Ok(Some(remote)) => {
                    if let Some(local) = &image.digest {
                        has_updates = Value::Bool(remote != *local);
                    }
                    remote_digest = Some(remote);
                }
                Ok(None) => {}
                Err(err) => {
                    log_message(&format!(
                        "warn digest-lookup-failed image={reference} code={}",
                        err.code()
                    ));
                }
            }
        }

        let mut entry = serde_json::to_value(&image).map_err(|e| e.to_string())?;
        entry["remoteDigest"] = match remote_digest {
            Some(digest) => Value::String(digest),
            None => Value::Null,
        };
        entry["hasUpdates"] = has_updates;
        entries.push(entry);
    }

    serde_json::to_string(&json!({ "images": entries })).map_err(|e| e.to_string())
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
struct UpdateStackRequest {
    infer_envfile: bool,
    restart_containers: bool,
    prune_images: bool,
}

impl Default for UpdateStackRequest {
    fn default() -> Self {
        let defaults = UpdateOptions::default();
        Self {
            infer_envfile: defaults.infer_envfile,
            restart_containers: defaults.restart_containers,
            prune_images: defaults.prune_images,
        }
    }
}

impl UpdateStackRequest {
    fn options(&self) -> UpdateOptions {
        UpdateOptions {
            infer_envfile: self.infer_envfile,
            restart_containers: self.restart_containers,
            prune_images: self.prune_images,
        }
    }
}

fn handle_start_update(
    ctx: &RequestContext,
    stream: &mut TcpStream,
    state: &AppState,
    stack: &str,
    service: Option<&str>,
) -> Result<(), String> {
    if !authorize(ctx) {
        log_message(&format!(
            "401 update-rejected stack={stack} id={}",
            ctx.request_id
        ));
        return respond_json(
            stream,
            ctx,
            401,
            "Unauthorized",
            &json!({ "error": "invalid or missing token" }),
            &[],
        );
    }

    let request: UpdateStackRequest = match parse_json_body(ctx) {
        Ok(request) => request,
        Err(err) => {
            return respond_json(
                stream,
                ctx,
                400,
                "BadRequest",
                &json!({ "error": err }),
                &[],
            );
        }
    };

    let key = match service {
        Some(service) => TaskKey::named(stack, service),
        None => TaskKey::whole_stack(stack),
    };
    let updater = ComposeUpdater::new(stack, service, request.options());
    let CreateOutcome { task_id, created } = state.tasks.create(key.clone(), updater);

    log_message(&format!(
        "202 update-task target={} task={task_id} created={created}",
        key.describe()
    ));
    respond_json(
        stream,
        ctx,
        202,
        "Accepted",
        &json!({ "taskId": task_id, "created": created }),
        &[],
    )
}

fn handle_poll_updates(
    ctx: &RequestContext,
    stream: &mut TcpStream,
    state: &AppState,
    key: &TaskKey,
) -> Result<(), String> {
    let offset = query_param(ctx, "offset")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);

    match state.tasks.poll(key, offset) {
        PollOutcome::NotFound => respond_json(
            stream,
            ctx,
            404,
            "NotFound",
            &json!({ "error": "task not found" }),
            &[],
        ),
        PollOutcome::Messages {
            task_id,
            messages,
            finished,
        } => respond_json(
            stream,
            ctx,
            200,
            "OK",
            &json!({ "taskId": task_id, "finished": finished, "messages": messages }),
            &[],
        ),
        PollOutcome::Failed {
            task_id,
            messages,
            error,
        } => respond_json(
            stream,
            ctx,
            200,
            "OK",
            &json!({
                "taskId": task_id,
                "finished": true,
                "messages": messages,
                "error": error,
            }),
            &[],
        ),
    }
}

/// Updates require the shared API token, passed as `Authorization: Bearer`
/// or a `token` query parameter. An unset token disables updates outright.
fn authorize(ctx: &RequestContext) -> bool {
    let Some(expected) = env::var(ENV_API_TOKEN)
        .ok()
        .filter(|v| !v.trim().is_empty())
    else {
        return false;
    };

    let provided = ctx
        .headers
        .get("authorization")
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
        .or_else(|| query_param(ctx, "token"));

    match provided {
        Some(provided) => token_matches(&provided, &expected),
        None => false,
    }
}

fn token_matches(provided: &str, expected: &str) -> bool {
    if provided.len() != expected.len() {
        return false;
    }
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}

fn parse_json_body<T: DeserializeOwned + Default>(ctx: &RequestContext) -> Result<T, String> {
    if ctx.body.is_empty() {
        return Ok(T::default());
    }
    serde_json::from_slice(&ctx.body).map_err(|e| format!("invalid request body: {e}"))
}

fn parse_request_line(request_line: &str) -> (String, String) {
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("").to_string();
    let target = parts.next().unwrap_or("").to_string();
    (method, target)
}

fn parse_target(raw_target: &str) -> Result<(String, Option<String>), String> {
    if raw_target.is_empty() {
        return Err("empty target".into());
    }

    // Support both absolute-form and origin-form targets.
    let url = if raw_target.starts_with("http://") || raw_target.starts_with("https://") {
        Url::parse(raw_target).map_err(|e| e.to_string())?
    } else {
        Url::parse(&format!("http://dummy{raw_target}")).map_err(|e| e.to_string())?
    };

    let path = url.path().to_string();
    let query = url.query().map(|s| s.to_string());
    Ok((path, query))
}

fn read_headers<R: BufRead>(reader: &mut R) -> Result<HashMap<String, String>, String> {
    let mut headers = HashMap::new();
    loop {
        let mut line = String::new();
        reader
            .read_line(&mut line)
            .map_err(|e| format!("failed to read header: {e}"))?;
        let trimmed = line.trim_end_matches(['\r', '\n']).to_string();
        if trimmed.is_empty() {
            break;
        }

        if let Some((name, value)) = trimmed.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    Ok(headers)
}

fn read_chunked_body<R: BufRead>(reader: &mut R) -> Result<Vec<u8>, String> {
    let mut body = Vec::new();
    loop {
        let mut size_line = String::new();
        reader
            .read_line(&mut size_line)
            .map_err(|e| format!("failed to read chunk size: {e}"))?;
        let size_str = size_line.trim();
        if size_str.is_empty() {
            continue;
        }

        let size = usize::from_str_radix(size_str, 16)
            .map_err(|e| format!("invalid chunk size '{size_str}': {e}"))?;

        if size == 0 {
            loop {
                let mut trailer = String::new();
                reader
                    .read_line(&mut trailer)
                    .map_err(|e| format!("failed to read chunk trailer: {e}"))?;
                if trailer.trim().is_empty() {
                    break;
                }
            }
            break;
        }

        let mut chunk = vec![0u8; size];
        reader
            .read_exact(&mut chunk)
            .map_err(|e| format!("failed to read chunk body: {e}"))?;
        body.extend_from_slice(&chunk);

        let mut crlf = [0u8; 2];
        reader
            .read_exact(&mut crlf)
            .map_err(|e| format!("failed to read chunk terminator: {e}"))?;
    }

    Ok(body)
}

fn query_flag(ctx: &RequestContext, names: &[&str]) -> bool {
    let Some(query) = &ctx.query else {
        return false;
    };
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        if names.contains(&key.as_ref()) {
            let value = value.to_ascii_lowercase();
            return value.is_empty() || matches!(value.as_str(), "1" | "true" | "yes");
        }
    }
    false
}

fn query_param(ctx: &RequestContext, name: &str) -> Option<String> {
    let query = ctx.query.as_ref()?;
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        if key == name {
            return Some(value.to_string());
        }
    }
    None
}

fn send_response(
    stream: &mut TcpStream,
    status: u16,
    reason: &str,
    content_type: &str,
    extra_headers: &[(&str, String)],
    body: &[u8],
) -> Result<(), String> {
    let mut head = format!("HTTP/1.1 {status} {reason}\r\n");
    head.push_str(&format!("Content-Type: {content_type}\r\n"));
    head.push_str(&format!("Content-Length: {}\r\n", body.len()));
    head.push_str("Connection: close\r\n");
    for (name, value) in extra_headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str("\r\n");

    let result = stream
        .write_all(head.as_bytes())
        .and_then(|_| stream.write_all(body))
        .and_then(|_| stream.flush());

    match result {
        Ok(()) => Ok(()),
        Err(err)
            if err.kind() == io::ErrorKind::BrokenPipe
                || err.kind() == io::ErrorKind::ConnectionReset =>
        {
            Ok(())
        }
        Err(err) => Err(err.to_string()),
    }
}

fn respond_json(
    stream: &mut TcpStream,
    ctx: &RequestContext,
    status: u16,
    reason: &str,
    payload: &Value,
    extra_headers: &[(&str, String)],
) -> Result<(), String> {
    let body = serde_json::to_vec(payload).map_err(|e| e.to_string())?;
    log_request(ctx, status);
    send_response(
        stream,
        status,
        reason,
        "application/json; charset=utf-8",
        extra_headers,
        &body,
    )
}

fn log_request(ctx: &RequestContext, status: u16) {
    let duration_ms = ctx.started_at.elapsed().as_millis();
    let target = match &ctx.query {
        Some(query) => format!("{}?{}", ctx.path, query),
        None => ctx.path.clone(),
    };
    log_message(&format!(
        "{status} {} {} id={} {duration_ms}ms",
        ctx.method,
        redact_token(&target),
        ctx.request_id
    ));
}

fn next_request_id() -> String {
    let seq = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis();
    format!("{ts:x}-{seq:04x}")
}

fn env_u64(name: &str, default: u64) -> Result<u64, String> {
    match env::var(name) {
        Ok(val) => val.trim().parse().map_err(|_| format!("invalid {name}")),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(_) => Err(format!("invalid {name}")),
    }
}

fn current_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs()
}

fn log_message(message: &str) {
    // Try system logger first; fall back to stderr so container logs capture it.
    let _ = Command::new("logger")
        .arg("-t")
        .arg(LOG_TAG)
        .arg(message)
        .status();
    eprintln!("{message}");
}

fn redact_token(input: &str) -> String {
    static TOKEN_RE: OnceLock<Regex> = OnceLock::new();
    let regex = TOKEN_RE.get_or_init(|| Regex::new(r"(token=)[^&\s]+").unwrap());
    regex.replace_all(input, "$1***REDACTED***").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::OP_REMOTE_DIGEST;
    use crate::task_store::{Message, UpdateRunner};

    fn ctx_with_query(query: Option<&str>) -> RequestContext {
        RequestContext {
            method: "GET".to_string(),
            path: "/api/stacks".to_string(),
            query: query.map(str::to_string),
            headers: HashMap::new(),
            body: Vec::new(),
            request_id: "test".to_string(),
            started_at: Instant::now(),
        }
    }

    #[test]
    fn parse_target_splits_path_and_query() {
        let (path, query) = parse_target("/api/stacks?no_cache=1&x=2").unwrap();
        assert_eq!(path, "/api/stacks");
        assert_eq!(query.as_deref(), Some("no_cache=1&x=2"));

        let (path, query) = parse_target("http://host:9/api/images").unwrap();
        assert_eq!(path, "/api/images");
        assert_eq!(query, None);

        assert!(parse_target("").is_err());
    }

    #[test]
    fn query_flag_accepts_bare_and_truthy_values() {
        assert!(query_flag(&ctx_with_query(Some("no_cache")), &["no_cache"]));
        assert!(query_flag(&ctx_with_query(Some("no_cache=1")), &["no_cache"]));
        assert!(query_flag(&ctx_with_query(Some("no_cache=true")), &["no_cache"]));
        assert!(!query_flag(&ctx_with_query(Some("no_cache=0")), &["no_cache"]));
        assert!(!query_flag(&ctx_with_query(Some("other=1")), &["no_cache"]));
        assert!(!query_flag(&ctx_with_query(None), &["no_cache"]));
    }

    #[test]
    fn query_param_decodes_values() {
        let ctx = ctx_with_query(Some("offset=12&token=a%20b"));
        assert_eq!(query_param(&ctx, "offset").as_deref(), Some("12"));
        assert_eq!(query_param(&ctx, "token").as_deref(), Some("a b"));
        assert_eq!(query_param(&ctx, "missing"), None);
    }

    #[test]
    fn token_comparison_rejects_mismatches() {
        assert!(token_matches("secret", "secret"));
        assert!(!token_matches("secret", "secret2"));
        assert!(!token_matches("Secret", "secret"));
        assert!(!token_matches("", "secret"));
    }

    #[test]
    fn update_request_defaults_and_partial_body() {
        let defaults = UpdateStackRequest::default();
        assert!(defaults.infer_envfile);
        assert!(defaults.restart_containers);
        assert!(!defaults.prune_images);

        let parsed: UpdateStackRequest =
            serde_json::from_str(r#"{"pruneImages":true}"#).unwrap();
        assert!(parsed.infer_envfile);
        assert!(parsed.restart_containers);
        assert!(parsed.prune_images);

        let options = parsed.options();
        assert!(options.prune_images);
    }

    #[test]
    fn parse_json_body_empty_body_uses_defaults() {
        let ctx = ctx_with_query(None);
        let parsed: UpdateStackRequest = parse_json_body(&ctx).unwrap();
        assert_eq!(parsed, UpdateStackRequest::default());

        let mut ctx = ctx_with_query(None);
        ctx.body = b"not json".to_vec();
        let err = parse_json_body::<UpdateStackRequest>(&ctx)
            .expect_err("garbage body must be rejected");
        assert!(err.contains("invalid request body"));
    }

    #[test]
    fn redact_token_hides_query_secrets() {
        let raw = "GET /api/stacks/web?token=abc123&offset=1";
        let redacted = redact_token(raw);
        assert!(!redacted.contains("abc123"));
        assert!(redacted.contains("token=***REDACTED***"));
        assert!(redacted.contains("offset=1"));
    }

    #[test]
    fn normalize_command_strips_dashes() {
        assert_eq!(normalize_command("--version"), "version");
        assert_eq!(normalize_command("Serve"), "serve");
    }

    struct NoopRunner;

    impl UpdateRunner for NoopRunner {
        fn run(self: Box<Self>, emit: &mut dyn FnMut(Message)) -> Result<(), String> {
            emit(Message::line(crate::task_store::STAGE_UPDATE, "done".into()));
            Ok(())
        }
    }

    #[test]
    fn finished_task_invalidates_listing_caches_but_not_digests() {
        let runtime = Arc::new(
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap(),
        );
        let pool = runtime.block_on(async {
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .connect("sqlite::memory:")
                .await
                .unwrap();
            MIGRATOR.run(&pool).await.unwrap();
            pool
        });
        let cache = Arc::new(CacheStore::new(pool, runtime));

        let stacks_key = OP_LIST_STACKS.key(&[], &[]);
        let digest_key = OP_REMOTE_DIGEST.key(&["ghcr.io/org/app:v1"], &[]);
        cache.set(&stacks_key, "{}", 600).unwrap();
        cache.set(&digest_key, "{}", 600).unwrap();

        let cache_for_hook = cache.clone();
        let tasks = TaskStore::new(
            Duration::from_secs(60),
            Arc::new(move || invalidate_listing_caches(&cache_for_hook)),
        );

        let key = TaskKey::whole_stack("web");
        tasks.create(key.clone(), NoopRunner);

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let PollOutcome::Messages { finished: true, .. } = tasks.poll(&key, 0) {
                break;
            }
            assert!(Instant::now() < deadline, "task did not finish in time");
            thread::sleep(Duration::from_millis(10));
        }

        assert!(cache.get_with_ttl(&stacks_key).unwrap().is_none());
        assert!(cache.get_with_ttl(&digest_key).unwrap().is_some());
    }
}
