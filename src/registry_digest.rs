use crate::cache::{CacheStore, OP_REMOTE_DIGEST};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::runtime::Runtime;
use url::Url;

const AUTH_JSON_REL_PATH: &str = ".config/containers/auth.json";
const DIGEST_HEADER: &str = "docker-content-digest";
const DEFAULT_REGISTRY: &str = "registry-1.docker.io";

pub(crate) const ENV_DIGEST_TTL_SECS: &str = "STATION_DIGEST_TTL_SECS";
pub(crate) const DEFAULT_DIGEST_TTL_SECS: u64 = 600;

pub(crate) fn digest_cache_ttl_secs() -> u64 {
    env::var(ENV_DIGEST_TTL_SECS)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_DIGEST_TTL_SECS)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum RegistryDigestError {
    InvalidReference,
    Timeout,
    Unauthorized,
    AuthMissing,
    AuthParse,
    ChallengeParse,
    BadResponse,
    DigestMissing,
    Io,
    Json,
}

impl RegistryDigestError {
    pub(crate) fn code(&self) -> &'static str {
        match self {
            RegistryDigestError::InvalidReference => "invalid-reference",
            RegistryDigestError::Timeout => "timeout",
            RegistryDigestError::Unauthorized => "unauthorized",
            RegistryDigestError::AuthMissing => "auth-missing",
            RegistryDigestError::AuthParse => "auth-parse",
            RegistryDigestError::ChallengeParse => "challenge-parse",
            RegistryDigestError::BadResponse => "bad-response",
            RegistryDigestError::DigestMissing => "digest-missing",
            RegistryDigestError::Io => "io-error",
            RegistryDigestError::Json => "json-error",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct ImageRef {
    scheme: String,
    registry: String, // host[:port], lowercased, no scheme
    repo: String,
    tag: String,
}

impl ImageRef {
    /// `registry/repo:tag`, used as the cache key argument.
    fn canonical(&self) -> String {
        format!("{}/{}:{}", self.registry, self.repo, self.tag)
    }
}

/// Resolve the manifest digest a registry currently serves for `reference`.
///
/// `Ok(None)` means the registry answered but has no such manifest. Results
/// (including negative ones) go through the shared response cache so a burst
/// of image listings does not hammer the registry.
pub(crate) fn get_remote_digest(
    cache: &CacheStore,
    runtime: &Runtime,
    reference: &str,
) -> Result<Option<String>, RegistryDigestError> {
    // Digest-pinned references already name their content.
    if let Some((_, digest)) = reference.split_once('@') {
        let digest = digest.trim();
        if digest.starts_with("sha256:") {
            return Ok(Some(digest.to_string()));
        }
        return Err(RegistryDigestError::InvalidReference);
    }

    let parsed = parse_image_ref(reference)?;
    let canonical = parsed.canonical();
    let key = OP_REMOTE_DIGEST.key(&[&canonical], &[]);

    match cache.get_with_ttl(&key) {
        Ok(Some((_, data))) => {
            if let Ok(value) = serde_json::from_str::<Value>(&data) {
                return Ok(value
                    .get("digest")
                    .and_then(|v| v.as_str())
                    .map(str::to_string));
            }
        }
        Ok(None) => {}
        Err(err) => {
            crate::log_message(&format!(
                "digest cache read degraded ({}): {}",
                err.code(),
                err.detail()
            ));
        }
    }

    let digest = runtime.block_on(fetch_digest(&parsed))?;

    let payload = json!({ "digest": digest }).to_string();
    if let Err(err) = cache.set(&key, &payload, digest_cache_ttl_secs()) {
        crate::log_message(&format!(
            "digest cache write degraded ({}): {}",
            err.code(),
            err.detail()
        ));
    }

    Ok(digest)
}

async fn fetch_digest(image: &ImageRef) -> Result<Option<String>, RegistryDigestError> {
    let client = registry_http_client().map_err(|_| RegistryDigestError::BadResponse)?;
    let manifest_url = format!(
        "{}://{}/v2/{}/manifests/{}",
        image.scheme, image.registry, image.repo, image.tag
    );

    let response = client
        .head(&manifest_url)
        .headers(manifest_accept_headers())
        .send()
        .await
        .map_err(map_reqwest_error)?;

    if response.status() == StatusCode::NOT_FOUND {
        return Ok(None);
    }
    if response.status().is_success() {
        return read_digest_header(response.headers()).map(Some);
    }
    if response.status() != StatusCode::UNAUTHORIZED {
        return Err(map_status_to_error(response.status()));
    }

    let challenges: Vec<String> = response
        .headers()
        .get_all(reqwest::header::WWW_AUTHENTICATE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(str::to_string)
        .collect();
    let creds = load_basic_credentials_for_registry(&image.registry)?;

    let retry = if let Some(challenge) = challenges
        .iter()
        .find(|h| h.trim_start().to_ascii_lowercase().starts_with("bearer "))
    {
        let bearer = parse_www_authenticate_bearer(challenge)?;
        let token = fetch_bearer_token(&client, &bearer, &creds).await?;
        client
            .head(&manifest_url)
            .headers(manifest_accept_headers())
            .bearer_auth(token)
            .send()
            .await
            .map_err(map_reqwest_error)?
    } else if challenges
        .iter()
        .any(|h| h.trim_start().to_ascii_lowercase().starts_with("basic "))
    {
        client
            .head(&manifest_url)
            .headers(manifest_accept_headers())
            .basic_auth(&creds.username, Some(&creds.password))
            .send()
            .await
            .map_err(map_reqwest_error)?
    } else {
        return Err(RegistryDigestError::Unauthorized);
    };

    if retry.status() == StatusCode::NOT_FOUND {
        return Ok(None);
    }
    if retry.status().is_success() {
        return read_digest_header(retry.headers()).map(Some);
    }
    Err(map_status_to_error(retry.status()))
}

fn map_reqwest_error(err: reqwest::Error) -> RegistryDigestError {
    if err.is_timeout() {
        return RegistryDigestError::Timeout;
    }
    RegistryDigestError::BadResponse
}

fn map_status_to_error(status: StatusCode) -> RegistryDigestError {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return RegistryDigestError::Unauthorized;
    }
    RegistryDigestError::BadResponse
}

fn registry_http_client() -> Result<Client, reqwest::Error> {
    Client::builder()
        .timeout(Duration::from_secs(3))
        .pool_max_idle_per_host(0)
        .build()
}

fn manifest_accept_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    let accept = "application/vnd.oci.image.manifest.v1+json, application/vnd.oci.image.index.v1+json, application/vnd.docker.distribution.manifest.v2+json, application/vnd.docker.distribution.manifest.list.v2+json";
    headers.insert(
        reqwest::header::ACCEPT,
        HeaderValue::from_str(accept).unwrap_or_else(|_| HeaderValue::from_static("*/*")),
    );
    headers
}

fn read_digest_header(headers: &HeaderMap) -> Result<String, RegistryDigestError> {
    headers
        .get(DIGEST_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or(RegistryDigestError::DigestMissing)
}

#[derive(Clone, Debug)]
struct BearerChallenge {
    realm: String,
    service: Option<String>,
    scope: Option<String>,
}

fn parse_www_authenticate_bearer(header: &str) -> Result<BearerChallenge, RegistryDigestError> {
    let rest = header
        .trim()
        .splitn(2, ' ')
        .nth(1)
        .unwrap_or("")
        .trim()
        .to_string();

    let params = parse_auth_params(&rest);
    let realm = params
        .get("realm")
        .cloned()
        .filter(|v| !v.is_empty())
        .ok_or(RegistryDigestError::ChallengeParse)?;

    Ok(BearerChallenge {
        realm,
        service: params.get("service").cloned().filter(|v| !v.is_empty()),
        scope: params.get("scope").cloned().filter(|v| !v.is_empty()),
    })
}

fn parse_auth_params(input: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for raw in input.split(',') {
        let Some((k, v)) = raw.trim().split_once('=') else {
            continue;
        };
        let key = k.trim().to_ascii_lowercase();
        let value = v.trim().trim_matches('"').to_string();
        out.insert(key, value);
    }
    out
}

async fn fetch_bearer_token(
    client: &Client,
    challenge: &BearerChallenge,
    creds: &BasicCredentials,
) -> Result<String, RegistryDigestError> {
    let mut url = Url::parse(&challenge.realm).map_err(|_| RegistryDigestError::ChallengeParse)?;
    {
        let mut query = url.query_pairs_mut();
        if let Some(service) = &challenge.service {
            query.append_pair("service", service);
        }
        if let Some(scope) = &challenge.scope {
            query.append_pair("scope", scope);
        }
    }

    let response = client
        .get(url)
        .basic_auth(&creds.username, Some(&creds.password))
        .send()
        .await
        .map_err(map_reqwest_error)?;

    if !response.status().is_success() {
        return Err(map_status_to_error(response.status()));
    }

    let body: Value = response
        .json()
        .await
        .map_err(|_| RegistryDigestError::Json)?;
    body.get("token")
        .and_then(|v| v.as_str())
        .or_else(|| body.get("access_token").and_then(|v| v.as_str()))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or(RegistryDigestError::BadResponse)
}

#[derive(Clone, Debug)]
struct BasicCredentials {
    username: String,
    password: String,
}

fn load_basic_credentials_for_registry(
    registry: &str,
) -> Result<BasicCredentials, RegistryDigestError> {
    let auths = load_containers_auth_json()?;
    let registry = normalize_registry_host(registry).ok_or(RegistryDigestError::AuthMissing)?;
    auths
        .get(&registry)
        .cloned()
        .ok_or(RegistryDigestError::AuthMissing)
}

/// Credentials come from the containers-auth `auth.json` under $HOME. Each
/// entry carries either a base64 `auth` blob or a username/password pair.
fn load_containers_auth_json() -> Result<HashMap<String, BasicCredentials>, RegistryDigestError> {
    let home = env::var("HOME").map_err(|_| RegistryDigestError::Io)?;
    let path: PathBuf = Path::new(&home).join(AUTH_JSON_REL_PATH);
    let raw = match fs::read_to_string(&path) {
        Ok(v) => v,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(_) => return Err(RegistryDigestError::Io),
    };

    let json: Value = serde_json::from_str(&raw).map_err(|_| RegistryDigestError::AuthParse)?;
    let mut out = HashMap::new();
    let Some(auths) = json.get("auths").and_then(|v| v.as_object()) else {
        return Ok(out);
    };

    for (key, entry) in auths {
        let Some(registry) = normalize_registry_host(key) else {
            continue;
        };
        let Some(obj) = entry.as_object() else {
            continue;
        };

        if let Some(creds) = obj
            .get("auth")
            .and_then(|v| v.as_str())
            .and_then(decode_auth_blob)
        {
            out.insert(registry, creds);
            continue;
        }

        let username = obj
            .get("username")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty());
        let password = obj
            .get("password")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty());
        if let (Some(username), Some(password)) = (username, password) {
            out.insert(
                registry,
                BasicCredentials {
                    username: username.to_string(),
                    password: password.to_string(),
                },
            );
        }
    }

    Ok(out)
}

fn decode_auth_blob(blob: &str) -> Option<BasicCredentials> {
    let decoded = BASE64_STANDARD.decode(blob.trim().as_bytes()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    if user.is_empty() {
        return None;
    }
    Some(BasicCredentials {
        username: user.to_string(),
        password: pass.to_string(),
    })
}

fn normalize_registry_host(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        if let Ok(url) = Url::parse(trimmed) {
            if let Some(host) = url.host_str() {
                let host = host.to_ascii_lowercase();
                return Some(match url.port() {
                    Some(port) => format!("{host}:{port}"),
                    None => host,
                });
            }
        }
        let without_scheme = trimmed.splitn(2, "://").nth(1).unwrap_or(trimmed);
        let host_port = without_scheme.split('/').next().unwrap_or(without_scheme);
        return Some(host_port.to_ascii_lowercase());
    }

    Some(
        trimmed
            .split('/')
            .next()
            .unwrap_or(trimmed)
            .to_ascii_lowercase(),
    )
}

/// Accepts the forms `docker image ls` produces (`repo:tag`, with or without
/// a registry host) plus explicit `http(s)://host/repo:tag` for registries
/// that only speak plain HTTP. Docker-style shorthand is normalized: a bare
/// repo goes to the default registry under `library/`, a missing tag means
/// `latest`.
fn parse_image_ref(input: &str) -> Result<ImageRef, RegistryDigestError> {
    let raw = input.trim();
    if raw.is_empty() {
        return Err(RegistryDigestError::InvalidReference);
    }

    if raw.starts_with("http://") || raw.starts_with("https://") {
        let url = Url::parse(raw).map_err(|_| RegistryDigestError::InvalidReference)?;
        let scheme = url.scheme().to_string();
        let host = url
            .host_str()
            .ok_or(RegistryDigestError::InvalidReference)?
            .to_ascii_lowercase();
        let registry = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host,
        };
        let path = url.path().trim_start_matches('/');
        let (repo, tag) = split_repo_tag(path)?;
        return Ok(ImageRef {
            scheme,
            registry,
            repo,
            tag,
        });
    }

    // `host/...` only when the first segment looks like a host.
    let (registry, rest) = match raw.split_once('/') {
        Some((first, rest))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            (
                normalize_registry_host(first).ok_or(RegistryDigestError::InvalidReference)?,
                rest,
            )
        }
        _ => (DEFAULT_REGISTRY.to_string(), raw),
    };

    let (mut repo, tag) = split_repo_tag(rest)?;
    if registry == DEFAULT_REGISTRY && !repo.contains('/') {
        repo = format!("library/{repo}");
    }

    Ok(ImageRef {
        scheme: "https".to_string(),
        registry,
        repo,
        tag,
    })
}

fn split_repo_tag(path: &str) -> Result<(String, String), RegistryDigestError> {
    let trimmed = path.trim().trim_start_matches('/');
    if trimmed.is_empty() {
        return Err(RegistryDigestError::InvalidReference);
    }

    // Only a colon after the last slash separates the tag; earlier colons
    // belong to a registry port.
    let last_slash = trimmed.rfind('/').unwrap_or(0);
    match trimmed[last_slash..].rfind(':') {
        Some(idx) => {
            let sep = last_slash + idx;
            let repo = trimmed[..sep].trim().to_string();
            let tag = trimmed[sep + 1..].trim().to_string();
            if repo.is_empty() || tag.is_empty() {
                return Err(RegistryDigestError::InvalidReference);
            }
            Ok((repo, tag))
        }
        None => Ok((trimmed.to_string(), "latest".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
    use tempfile::TempDir;
    use tokio::runtime::Builder;

    static ENV_MUTEX: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> MutexGuard<'static, ()> {
        ENV_MUTEX
            .get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|err| err.into_inner())
    }

    struct HomeGuard {
        original: Option<String>,
    }

    impl HomeGuard {
        fn set(path: &Path) -> Self {
            let original = env::var("HOME").ok();
            unsafe {
                env::set_var("HOME", path);
            }
            HomeGuard { original }
        }
    }

    impl Drop for HomeGuard {
        fn drop(&mut self) {
            if let Some(value) = self.original.take() {
                unsafe {
                    env::set_var("HOME", value);
                }
            }
        }
    }

    fn test_store() -> (CacheStore, Arc<Runtime>) {
        let runtime = Arc::new(Builder::new_current_thread().enable_all().build().unwrap());
        let pool = runtime.block_on(async {
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .connect("sqlite::memory:")
                .await
                .unwrap();
            crate::MIGRATOR.run(&pool).await.unwrap();
            pool
        });
        (CacheStore::new(pool, runtime.clone()), runtime)
    }

    struct MockResponse {
        status: u16,
        headers: Vec<(&'static str, String)>,
        body: Option<String>,
    }

    struct MockServer {
        addr: String,
        hits: Arc<AtomicUsize>,
    }

    impl MockServer {
        fn start(responses: Vec<MockResponse>) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let addr = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
            let hits = Arc::new(AtomicUsize::new(0));
            let hits_thread = hits.clone();
            let mut responses = responses;
            responses.reverse();

            std::thread::spawn(move || {
                while let Some(response) = responses.pop() {
                    let Ok((mut stream, _)) = listener.accept() else {
                        break;
                    };
                    hits_thread.fetch_add(1, Ordering::SeqCst);
                    let _ = read_request_head(&mut stream);

                    let body = response.body.as_deref().unwrap_or("");
                    let mut out = format!("HTTP/1.1 {} X\r\nConnection: close\r\n", response.status);
                    out.push_str(&format!("Content-Length: {}\r\n", body.len()));
                    for (k, v) in &response.headers {
                        out.push_str(&format!("{k}: {v}\r\n"));
                    }
                    out.push_str("\r\n");
                    out.push_str(body);
                    let _ = stream.write_all(out.as_bytes());
                }
            });

            MockServer { addr, hits }
        }

        fn hits(&self) -> usize {
            self.hits.load(Ordering::SeqCst)
        }
    }

    fn read_request_head(stream: &mut TcpStream) -> String {
        let _ = stream.set_read_timeout(Some(Duration::from_secs(1)));
        let mut buf = Vec::new();
        let mut tmp = [0u8; 4096];
        loop {
            match stream.read(&mut tmp) {
                Ok(0) => break,
                Ok(n) => {
                    buf.extend_from_slice(&tmp[..n]);
                    if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        String::from_utf8_lossy(&buf).to_string()
    }

    fn write_auth_json(home: &Path, registry: &str, username: &str, password: &str) {
        let dir = home.join(".config/containers");
        fs::create_dir_all(&dir).unwrap();
        let auth = BASE64_STANDARD.encode(format!("{username}:{password}"));
        fs::write(
            dir.join("auth.json"),
            json!({ "auths": { registry: { "auth": auth } } }).to_string(),
        )
        .unwrap();
    }

    #[test]
    fn image_ref_normalization() {
        let short = parse_image_ref("redis:7").unwrap();
        assert_eq!(short.registry, DEFAULT_REGISTRY);
        assert_eq!(short.repo, "library/redis");
        assert_eq!(short.tag, "7");
        assert_eq!(short.canonical(), "registry-1.docker.io/library/redis:7");

        let hosted = parse_image_ref("ghcr.io/org/app:v1").unwrap();
        assert_eq!(hosted.registry, "ghcr.io");
        assert_eq!(hosted.repo, "org/app");
        assert_eq!(hosted.scheme, "https");

        let ported = parse_image_ref("localhost:5000/app").unwrap();
        assert_eq!(ported.registry, "localhost:5000");
        assert_eq!(ported.repo, "app");
        assert_eq!(ported.tag, "latest");

        assert_eq!(
            parse_image_ref(""),
            Err(RegistryDigestError::InvalidReference)
        );
        assert_eq!(
            parse_image_ref("ghcr.io/org/app:"),
            Err(RegistryDigestError::InvalidReference)
        );
    }

    #[test]
    fn pinned_reference_short_circuits() {
        let (cache, runtime) = test_store();
        let digest =
            get_remote_digest(&cache, &runtime, "ghcr.io/org/app@sha256:abcd").unwrap();
        assert_eq!(digest.as_deref(), Some("sha256:abcd"));

        let err = get_remote_digest(&cache, &runtime, "ghcr.io/org/app@md5:nope")
            .expect_err("non-sha256 pin must be rejected");
        assert_eq!(err, RegistryDigestError::InvalidReference);
    }

    #[test]
    fn digest_header_is_cached_across_calls() {
        let _lock = env_lock();
        let temp = TempDir::new().unwrap();
        let _home = HomeGuard::set(temp.path());
        let (cache, runtime) = test_store();

        let server = MockServer::start(vec![MockResponse {
            status: 200,
            headers: vec![("Docker-Content-Digest", "sha256:feed".to_string())],
            body: None,
        }]);

        let reference = format!("http://{}/repo:tag", server.addr);
        let digest = get_remote_digest(&cache, &runtime, &reference).unwrap();
        assert_eq!(digest.as_deref(), Some("sha256:feed"));
        assert_eq!(server.hits(), 1);

        // Second call is served from the cache.
        let digest = get_remote_digest(&cache, &runtime, &reference).unwrap();
        assert_eq!(digest.as_deref(), Some("sha256:feed"));
        assert_eq!(server.hits(), 1);
    }

    #[test]
    fn missing_manifest_is_negative_cached() {
        let _lock = env_lock();
        let temp = TempDir::new().unwrap();
        let _home = HomeGuard::set(temp.path());
        let (cache, runtime) = test_store();

        let server = MockServer::start(vec![MockResponse {
            status: 404,
            headers: vec![],
            body: None,
        }]);

        let reference = format!("http://{}/repo:gone", server.addr);
        assert_eq!(get_remote_digest(&cache, &runtime, &reference).unwrap(), None);
        assert_eq!(get_remote_digest(&cache, &runtime, &reference).unwrap(), None);
        assert_eq!(server.hits(), 1);
    }

    #[test]
    fn missing_digest_header_is_an_error_and_not_cached() {
        let _lock = env_lock();
        let temp = TempDir::new().unwrap();
        let _home = HomeGuard::set(temp.path());
        let (cache, runtime) = test_store();

        let server = MockServer::start(vec![MockResponse {
            status: 200,
            headers: vec![],
            body: None,
        }]);

        let reference = format!("http://{}/repo:tag", server.addr);
        let err = get_remote_digest(&cache, &runtime, &reference)
            .expect_err("200 without the digest header must fail");
        assert_eq!(err, RegistryDigestError::DigestMissing);

        let key = OP_REMOTE_DIGEST.key(&[&format!("{}/repo:tag", server.addr)], &[]);
        assert!(cache.get_with_ttl(&key).unwrap().is_none());
    }

    #[test]
    fn bearer_challenge_round_trip() {
        let _lock = env_lock();
        let temp = TempDir::new().unwrap();
        let _home = HomeGuard::set(temp.path());
        let (cache, runtime) = test_store();

        // One scripted server plays all three roles: 401 with a bearer
        // challenge pointing back at itself, token grant, then 200.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
        write_auth_json(temp.path(), &addr, "station", "secret");
        let challenge = format!(
            "Bearer realm=\"http://{addr}/token\",service=\"mock\",scope=\"repository:repo:pull\""
        );

        let expected_basic = BASE64_STANDARD.encode("station:secret");
        std::thread::spawn(move || {
            // 1: unauthenticated HEAD.
            if let Ok((mut stream, _)) = listener.accept() {
                let _ = read_request_head(&mut stream);
                let _ = stream.write_all(
                    format!(
                        "HTTP/1.1 401 X\r\nConnection: close\r\nContent-Length: 0\r\nWWW-Authenticate: {challenge}\r\n\r\n"
                    )
                    .as_bytes(),
                );
            }
            // 2: token request with basic auth.
            if let Ok((mut stream, _)) = listener.accept() {
                let head = read_request_head(&mut stream);
                assert!(
                    head.contains(&format!("Basic {expected_basic}")),
                    "token request missing basic auth: {head}"
                );
                let body = "{\"token\":\"t-42\"}";
                let _ = stream.write_all(
                    format!(
                        "HTTP/1.1 200 X\r\nConnection: close\r\nContent-Length: {}\r\n\r\n{body}",
                        body.len()
                    )
                    .as_bytes(),
                );
            }
            // 3: authenticated HEAD.
            if let Ok((mut stream, _)) = listener.accept() {
                let head = read_request_head(&mut stream);
                assert!(
                    head.contains("Bearer t-42"),
                    "retry missing bearer token: {head}"
                );
                let _ = stream.write_all(
                    "HTTP/1.1 200 X\r\nConnection: close\r\nContent-Length: 0\r\nDocker-Content-Digest: sha256:auth\r\n\r\n"
                        .as_bytes(),
                );
            }
        });

        let reference = format!("http://{addr}/repo:tag");
        let digest = get_remote_digest(&cache, &runtime, &reference).unwrap();
        assert_eq!(digest.as_deref(), Some("sha256:auth"));
    }

    #[test]
    fn missing_credentials_surface_auth_missing() {
        let _lock = env_lock();
        let temp = TempDir::new().unwrap();
        let _home = HomeGuard::set(temp.path());
        let (cache, runtime) = test_store();

        let server = MockServer::start(vec![MockResponse {
            status: 401,
            headers: vec![(
                "WWW-Authenticate",
                "Bearer realm=\"http://127.0.0.1/token\",service=\"mock\"".to_string(),
            )],
            body: None,
        }]);

        let reference = format!("http://{}/repo:tag", server.addr);
        let err = get_remote_digest(&cache, &runtime, &reference)
            .expect_err("missing credentials must fail");
        assert_eq!(err, RegistryDigestError::AuthMissing);
        assert_eq!(err.code(), "auth-missing");
    }
}
