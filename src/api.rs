use std::fs::File;
use std::io::Read;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Result, anyhow};
use log::{debug, error, info, warn};
use mdns_sd::{ServiceDaemon, ServiceInfo};
use mime::Mime;
use multipart::server::Multipart;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tiny_http::{Header, Method, Response, Server, StatusCode};

use crate::alarm::model::{AlarmDraft, AlarmId};
use crate::alarm::registry::{AlarmRegistry, RegistryError};
use crate::alarm::scheduler::{SchedulerError, SchedulerHandle, TimerKey, WorkerMessage};
use crate::notify::Broadcaster;
use crate::sounds::{MAX_UPLOAD_BYTES, SoundError, SoundLibrary, sound_url};

pub const MDNS_SERVICE_TYPE: &str = "_alarmclock._tcp.local.";
pub const MAX_JSON_BODY_BYTES: usize = 64 * 1024;
/// Upload limit plus room for the multipart envelope.
pub const MAX_UPLOAD_BODY_BYTES: usize = MAX_UPLOAD_BYTES + 64 * 1024;

/// Everything a request handler can reach.
pub struct ApiState {
    pub registry: AlarmRegistry,
    pub scheduler: SchedulerHandle,
    pub broadcaster: Arc<Broadcaster>,
    pub sounds: SoundLibrary,
}

#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    pub bind_addr: String,
    pub port: u16,
    pub mdns_enabled: bool,
    pub mdns_instance: String,
}

pub struct ApiServer {
    local_addr: Option<SocketAddr>,
    stop: Arc<AtomicBool>,
    http_join: Option<JoinHandle<()>>,
    mdns: Option<ServiceDaemon>,
}

impl ApiServer {
    pub fn start(config: ApiServerConfig, state: Arc<ApiState>) -> Result<Self> {
        let bind = format!("{}:{}", config.bind_addr, config.port);
        let server = Server::http(&bind)
            .map_err(|err| anyhow!("failed to start API server on {bind}: {err}"))?;
        let local_addr = server.server_addr().to_ip();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_for_thread = Arc::clone(&stop);
        let http_join = thread::Builder::new()
            .name("api-server".to_string())
            .spawn(move || run_server_loop(server, state, stop_for_thread))?;

        let port = local_addr.map_or(config.port, |addr| addr.port());
        info!("API listening on {}", local_addr.map_or(bind, |addr| addr.to_string()));

        let mdns = if config.mdns_enabled {
            match start_mdns_advertisement(port, &config.mdns_instance) {
                Ok(daemon) => Some(daemon),
                Err(err) => {
                    warn!("mDNS advertisement disabled: {err}");
                    None
                }
            }
        } else {
            None
        };

        Ok(Self {
            local_addr,
            stop,
            http_join: Some(http_join),
            mdns,
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Blocks until the server thread exits.
    pub fn wait(mut self) {
        if let Some(join) = self.http_join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for ApiServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(join) = self.http_join.take() {
            let _ = join.join();
        }
        if let Some(mdns) = self.mdns.take() {
            let _ = mdns.shutdown();
        }
    }
}

fn run_server_loop(server: Server, state: Arc<ApiState>, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::Relaxed) {
        match server.recv_timeout(Duration::from_millis(200)) {
            Ok(Some(request)) => handle_request(request, &state),
            Ok(None) => continue,
            Err(err) => debug!("accept failed: {err}"),
        }
    }
}

fn start_mdns_advertisement(api_port: u16, instance_prefix: &str) -> Result<ServiceDaemon> {
    let daemon = ServiceDaemon::new().map_err(|err| anyhow!("could not create mDNS daemon: {err}"))?;

    let hostname = detect_hostname();
    let instance = if instance_prefix.trim().is_empty() {
        hostname.clone()
    } else {
        format!("{}-{}", instance_prefix.trim(), hostname)
    };
    let host_name = format!("{hostname}.local.");
    let mut addresses = detect_mdns_addresses();
    if addresses.is_empty() {
        addresses.push(Ipv4Addr::LOCALHOST.into());
    }

    let service = ServiceInfo::new(
        MDNS_SERVICE_TYPE,
        &instance,
        &host_name,
        addresses.as_slice(),
        api_port,
        None,
    )
    .map_err(|err| anyhow!("could not create mDNS service info: {err}"))?;
    daemon
        .register(service)
        .map_err(|err| anyhow!("could not register mDNS service: {err}"))?;
    info!("advertising {instance} as {MDNS_SERVICE_TYPE} on port {api_port}");
    Ok(daemon)
}

fn detect_hostname() -> String {
    let candidate = std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::env::var("COMPUTERNAME").ok())
        .unwrap_or_default();
    let trimmed = candidate.trim();
    if trimmed.is_empty() {
        "alarmclock".to_string()
    } else {
        trimmed
            .chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() || ch == '-' {
                    ch.to_ascii_lowercase()
                } else {
                    '-'
                }
            })
            .collect::<String>()
    }
}

fn detect_mdns_addresses() -> Vec<IpAddr> {
    let mut addresses = Vec::<IpAddr>::new();
    if let Ok(socket) = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        && socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80)).is_ok()
        && let Ok(local) = socket.local_addr()
    {
        let ip = local.ip();
        if ip.is_ipv4() && !ip.is_loopback() {
            addresses.push(ip);
        }
    }
    addresses.sort();
    addresses.dedup();
    addresses
}

fn handle_request(request: tiny_http::Request, state: &ApiState) {
    let method = request.method().clone();
    let url = request.url().to_string();
    debug!("{method} {url}");
    if let Err(err) = route(request, state) {
        warn!("failed to answer {method} {url}: {err:#}");
    }
}

fn route(request: tiny_http::Request, state: &ApiState) -> Result<()> {
    let method = request.method().clone();
    let url = request.url().to_string();
    let (path, query) = split_path_query(&url);
    let segments = path.trim_matches('/').split('/').collect::<Vec<_>>();

    match (method, segments.as_slice()) {
        (Method::Get, [""]) => send_index(request),
        (Method::Get, ["healthz"]) => send_text(request, StatusCode(200), "ok"),
        (Method::Get, ["api", "alarms"]) => {
            send_json(request, StatusCode(200), &state.registry.list())
        }
        (Method::Post, ["api", "alarms"]) => create_alarm(request, state),
        (Method::Post, ["api", "alarms", "clear-past"]) => clear_past(request, state),
        (Method::Get, ["api", "alarms", "history"]) => send_json(
            request,
            StatusCode(200),
            &state.broadcaster.events().entries(),
        ),
        (Method::Post, ["api", "alarms", "history", "clear"]) => {
            let removed = state.broadcaster.events().clear();
            send_json(
                request,
                StatusCode(200),
                &json!({ "message": "History cleared", "removed": removed }),
            )
        }
        (Method::Delete, ["api", "alarms", target]) => delete_alarm(request, state, target),
        (Method::Post, ["api", "alarms", id, "toggle"]) => toggle_alarm(request, state, id),
        (Method::Post, ["api", "alarms", id, "snooze"]) => snooze_alarm(request, state, id),
        (Method::Get, ["api", "events"]) => {
            let since = query_param(query, "since")
                .and_then(|raw| raw.parse::<u64>().ok())
                .unwrap_or(0);
            let events = state.broadcaster.events();
            send_json(
                request,
                StatusCode(200),
                &json!({ "latest": events.latest(), "events": events.since(since) }),
            )
        }
        (Method::Get, ["api", "sounds"]) => match state.sounds.list() {
            Ok(names) => send_json(request, StatusCode(200), &names),
            Err(err) => {
                error!("failed to list sounds: {err:#}");
                send_error(request, StatusCode(500), "failed to list sounds")
            }
        },
        (Method::Post, ["api", "sounds"]) => upload_sound(request, state),
        (Method::Get, ["sounds", name]) => serve_sound(request, state, name),
        (Method::Post, ["api", "worker"]) => worker_message(request, state),
        _ => send_error(request, StatusCode(404), "not found"),
    }
}

fn send_index(request: tiny_http::Request) -> Result<()> {
    #[derive(Serialize)]
    struct ApiIndexResponse {
        api_base: String,
        alarms_url: String,
        history_url: String,
        events_url: String,
        sounds_url: String,
        worker_url: String,
        health_url: String,
    }

    let base_url = request_base_url(&request);
    let payload = ApiIndexResponse {
        alarms_url: format!("{base_url}/api/alarms"),
        history_url: format!("{base_url}/api/alarms/history"),
        events_url: format!("{base_url}/api/events"),
        sounds_url: format!("{base_url}/api/sounds"),
        worker_url: format!("{base_url}/api/worker"),
        health_url: format!("{base_url}/healthz"),
        api_base: base_url,
    };
    send_json(request, StatusCode(200), &payload)
}

fn create_alarm(mut request: tiny_http::Request, state: &ApiState) -> Result<()> {
    let draft = match read_json::<AlarmDraft>(&mut request) {
        Ok(draft) => draft,
        Err((status, message)) => return send_error(request, status, &message),
    };
    match state.registry.submit_alarm(draft) {
        Ok(alarm) => send_json(
            request,
            StatusCode(200),
            &json!({ "message": "Alarm set successfully", "alarm": alarm }),
        ),
        Err(err) => send_registry_error(request, err),
    }
}

/// `{target}` is a position when it is all digits and an alarm id otherwise.
fn delete_alarm(request: tiny_http::Request, state: &ApiState, target: &str) -> Result<()> {
    let result = if !target.is_empty() && target.bytes().all(|b| b.is_ascii_digit()) {
        match target.parse::<usize>() {
            Ok(position) => state.registry.delete_at(position),
            Err(_) => {
                return send_error(request, StatusCode(404), &format!("invalid alarm index {target}"));
            }
        }
    } else {
        match AlarmId::parse(target) {
            Some(id) => state.registry.delete_alarm(id),
            None => return send_error(request, StatusCode(404), &format!("no alarm with id {target}")),
        }
    };
    match result {
        Ok(_) => send_json(
            request,
            StatusCode(200),
            &json!({ "message": "Alarm deleted successfully" }),
        ),
        Err(err) => send_registry_error(request, err),
    }
}

fn toggle_alarm(request: tiny_http::Request, state: &ApiState, id: &str) -> Result<()> {
    let Some(id) = AlarmId::parse(id) else {
        return send_error(request, StatusCode(404), &format!("no alarm with id {id}"));
    };
    match state.registry.toggle_alarm(id) {
        Ok(alarm) => {
            let message = if alarm.active {
                "Alarm enabled"
            } else {
                "Alarm disabled"
            };
            send_json(
                request,
                StatusCode(200),
                &json!({ "message": message, "alarm": alarm }),
            )
        }
        Err(err) => send_registry_error(request, err),
    }
}

fn snooze_alarm(request: tiny_http::Request, state: &ApiState, id: &str) -> Result<()> {
    let Some(id) = AlarmId::parse(id) else {
        return send_error(request, StatusCode(404), &format!("no alarm with id {id}"));
    };
    match state.registry.snooze(id) {
        Ok(until) => send_json(
            request,
            StatusCode(200),
            &json!({
                "message": format!("Alarm snoozed until {}", until.format("%H:%M")),
                "until": until.to_rfc3339(),
            }),
        ),
        Err(err) => send_registry_error(request, err),
    }
}

fn clear_past(request: tiny_http::Request, state: &ApiState) -> Result<()> {
    match state.registry.clear_past() {
        Ok(removed) => send_json(
            request,
            StatusCode(200),
            &json!({
                "message": format!("Removed {} past alarm(s)", removed.len()),
                "removed": removed.len(),
            }),
        ),
        Err(err) => send_registry_error(request, err),
    }
}

fn worker_message(mut request: tiny_http::Request, state: &ApiState) -> Result<()> {
    let message = match read_json::<WorkerMessage>(&mut request) {
        Ok(message) => message,
        Err((status, message)) => return send_error(request, status, &message),
    };
    match message {
        WorkerMessage::SetAlarm(set_alarm) => {
            let key = set_alarm.key();
            match state.scheduler.set_alarm(set_alarm) {
                Ok(()) => send_json(
                    request,
                    StatusCode(200),
                    &json!({ "message": "Alarm request accepted", "key": key }),
                ),
                Err(
                    err @ (SchedulerError::InvalidSchedule(_)
                    | SchedulerError::NonexistentLocalTime(_)),
                ) => send_error(request, StatusCode(400), &err.to_string()),
                Err(err) => send_error(request, StatusCode(503), &err.to_string()),
            }
        }
        WorkerMessage::CancelAlarm { key } => {
            match state.scheduler.cancel(&TimerKey::new(key)) {
                Ok(cancelled) => {
                    let message = if cancelled {
                        "Alarm cancelled"
                    } else {
                        "No pending alarm"
                    };
                    send_json(
                        request,
                        StatusCode(200),
                        &json!({ "message": message, "cancelled": cancelled }),
                    )
                }
                Err(err) => send_error(request, StatusCode(503), &err.to_string()),
            }
        }
    }
}

fn upload_sound(mut request: tiny_http::Request, state: &ApiState) -> Result<()> {
    let Some(boundary) = header_value(&request, "Content-Type")
        .as_deref()
        .and_then(multipart_boundary)
    else {
        return send_error(request, StatusCode(400), "expected multipart/form-data");
    };
    if request
        .body_length()
        .is_some_and(|len| len > MAX_UPLOAD_BODY_BYTES)
    {
        let message = format!("request body exceeds {MAX_UPLOAD_BODY_BYTES} bytes");
        return send_error(request, StatusCode(413), &message);
    }
    let body = request.as_reader().take(MAX_UPLOAD_BODY_BYTES as u64);
    let upload = match read_multipart_file(body, &boundary, "sound") {
        Ok(Some(upload)) => upload,
        Ok(None) => return send_error(request, StatusCode(400), "no sound part in request"),
        Err((status, message)) => return send_error(request, status, &message),
    };
    match state.sounds.save_upload(&upload.filename, &upload.data) {
        Ok(name) => send_json(
            request,
            StatusCode(200),
            &json!({
                "message": "Sound uploaded successfully",
                "filename": name,
                "url": sound_url(&name),
            }),
        ),
        Err(err) => {
            let status = match err {
                SoundError::MissingFile | SoundError::InvalidType => StatusCode(400),
                SoundError::TooLarge => StatusCode(413),
                SoundError::Io(_) => {
                    error!("{err}");
                    StatusCode(500)
                }
            };
            send_error(request, status, &err.to_string())
        }
    }
}

fn serve_sound(request: tiny_http::Request, state: &ApiState, name: &str) -> Result<()> {
    let Some(path) = state.sounds.resolve(name) else {
        return send_error(request, StatusCode(404), "not found");
    };
    let file = File::open(&path)?;
    let content_type = Header::from_str(&format!("Content-Type: {}", audio_mime(&path)))
        .map_err(|_| anyhow!("failed to build content-type header"))?;
    request.respond(Response::from_file(file).with_header(content_type))?;
    Ok(())
}

fn audio_mime(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("wav") => "audio/wav",
        Some("mp3") => "audio/mpeg",
        Some("ogg") => "audio/ogg",
        _ => "application/octet-stream",
    }
}

type Rejection = (StatusCode, String);

fn read_body(request: &mut tiny_http::Request, limit: usize) -> Result<Vec<u8>, Rejection> {
    let too_large = || (StatusCode(413), format!("request body exceeds {limit} bytes"));
    if request.body_length().is_some_and(|len| len > limit) {
        return Err(too_large());
    }
    let mut body = Vec::new();
    request
        .as_reader()
        .take(limit as u64 + 1)
        .read_to_end(&mut body)
        .map_err(|err| (StatusCode(400), format!("failed to read request body: {err}")))?;
    if body.len() > limit {
        return Err(too_large());
    }
    Ok(body)
}

fn read_json<T: DeserializeOwned>(request: &mut tiny_http::Request) -> Result<T, Rejection> {
    let body = read_body(request, MAX_JSON_BODY_BYTES)?;
    serde_json::from_slice(&body)
        .map_err(|err| (StatusCode(400), format!("invalid JSON body: {err}")))
}

fn send_registry_error(request: tiny_http::Request, err: RegistryError) -> Result<()> {
    let status = match &err {
        RegistryError::Validation(_) => StatusCode(400),
        RegistryError::NotFound(_) | RegistryError::IndexOutOfRange { .. } => StatusCode(404),
        RegistryError::Inactive(_) => StatusCode(409),
        RegistryError::Scheduler(
            SchedulerError::InvalidSchedule(_) | SchedulerError::NonexistentLocalTime(_),
        ) => StatusCode(400),
        RegistryError::Scheduler(_) => StatusCode(503),
        RegistryError::Store(_) => {
            error!("{err}");
            StatusCode(500)
        }
    };
    send_error(request, status, &err.to_string())
}

fn send_error(request: tiny_http::Request, status: StatusCode, message: &str) -> Result<()> {
    send_json(request, status, &json!({ "error": message }))
}

fn send_json<T: Serialize>(
    request: tiny_http::Request,
    status: StatusCode,
    payload: &T,
) -> Result<()> {
    let body = serde_json::to_vec(payload)?;
    let content_type = Header::from_str("Content-Type: application/json; charset=utf-8")
        .map_err(|_| anyhow!("failed to build content-type header"))?;
    request.respond(
        Response::from_data(body)
            .with_status_code(status)
            .with_header(content_type),
    )?;
    Ok(())
}

fn send_text(request: tiny_http::Request, status: StatusCode, body: &str) -> Result<()> {
    let content_type = Header::from_str("Content-Type: text/plain; charset=utf-8")
        .map_err(|_| anyhow!("failed to build content-type header"))?;
    request.respond(
        Response::from_string(body.to_string())
            .with_status_code(status)
            .with_header(content_type),
    )?;
    Ok(())
}

fn split_path_query(url: &str) -> (&str, &str) {
    match url.split_once('?') {
        Some((path, query)) => (path, query),
        None => (url, ""),
    }
}

fn request_base_url(request: &tiny_http::Request) -> String {
    match header_value(request, "Host") {
        Some(host) if !host.trim().is_empty() => format!("http://{}", host.trim()),
        _ => "http://localhost".to_string(),
    }
}

fn header_value(request: &tiny_http::Request, name: &'static str) -> Option<String> {
    request
        .headers()
        .iter()
        .find(|header| header.field.equiv(name))
        .map(|header| header.value.as_str().to_string())
}

fn query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (k, v) = match pair.split_once('=') {
            Some((k, v)) => (k, v),
            None => (pair, ""),
        };
        if k == key {
            return Some(v);
        }
    }
    None
}

fn multipart_boundary(content_type: &str) -> Option<String> {
    let parsed = content_type.parse::<Mime>().ok()?;
    if parsed.type_() != mime::MULTIPART || parsed.subtype() != mime::FORM_DATA {
        return None;
    }
    parsed
        .get_param(mime::BOUNDARY)
        .map(|boundary| boundary.as_str().trim_matches('"').to_string())
        .filter(|boundary| !boundary.is_empty())
}

#[derive(Debug, PartialEq, Eq)]
struct UploadedFile {
    filename: String,
    data: Vec<u8>,
}

/// Streams a `multipart/form-data` body and returns the named file field.
///
/// Field data is capped one byte past `MAX_UPLOAD_BYTES` so the sound library
/// can still report an oversized upload.
fn read_multipart_file<R: Read>(
    body: R,
    boundary: &str,
    field: &str,
) -> Result<Option<UploadedFile>, Rejection> {
    let mut multipart = Multipart::with_body(body, boundary);
    while let Some(mut entry) = multipart
        .read_entry()
        .map_err(|err| (StatusCode(400), format!("malformed multipart body: {err}")))?
    {
        if &*entry.headers.name != field {
            continue;
        }
        let mut data = Vec::new();
        entry
            .data
            .by_ref()
            .take(MAX_UPLOAD_BYTES as u64 + 1)
            .read_to_end(&mut data)
            .map_err(|err| (StatusCode(400), format!("failed to read upload: {err}")))?;
        return Ok(Some(UploadedFile {
            filename: entry.headers.filename.clone().unwrap_or_default(),
            data,
        }));
    }
    Ok(None)
}
