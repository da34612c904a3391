use std::collections::{HashMap, VecDeque};
use std::io::Read;
use std::net::{IpAddr, Ipv6Addr};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Result, bail};
use chrono::Local;
use serde::Serialize;
use tiny_http::{Header, Method, Response, Server, StatusCode};
use tracing::{debug, info, warn};

use crate::alarm::scheduler::{ClientHandle, ClientRegistry, SchedulerHandle, SchedulerSnapshot};
use crate::protocol::{ClientMessage, Mailbox, ServerMessage};

pub const DEFAULT_CONNECTED_CLIENT_TTL_MS: i64 = 15_000;
const MAILBOX_CAPACITY: usize = 32;
const MAX_BODY_BYTES: u64 = 4 * 1024;

#[derive(Debug, Clone, Serialize)]
pub struct PublicClient {
    pub id: String,
    pub instance_id: String,
    pub ip: String,
    pub request_count: u64,
    pub first_seen_unix_ms: i64,
    pub last_seen_unix_ms: i64,
    pub pending_messages: usize,
}

#[derive(Debug, Clone)]
struct ClientRecord {
    id: String,
    instance_id: String,
    ip: String,
    request_count: u64,
    first_seen_unix_ms: i64,
    last_seen_unix_ms: i64,
    mailbox: VecDeque<ServerMessage>,
}

#[derive(Debug)]
pub struct ApiSharedState {
    clients: HashMap<String, ClientRecord>,
    total_requests: u64,
    server_started_unix_ms: i64,
}

impl Default for ApiSharedState {
    fn default() -> Self {
        Self {
            clients: HashMap::new(),
            total_requests: 0,
            server_started_unix_ms: Local::now().timestamp_millis(),
        }
    }
}

impl ApiSharedState {
    /// Contexts seen within `ttl_ms`, longest-connected first.
    pub fn connected_clients(&self, now_ms: i64, ttl_ms: i64) -> Vec<PublicClient> {
        let mut clients = self
            .clients
            .values()
            .filter(|client| now_ms.saturating_sub(client.last_seen_unix_ms) <= ttl_ms)
            .map(|entry| PublicClient {
                id: entry.id.clone(),
                instance_id: entry.instance_id.clone(),
                ip: entry.ip.clone(),
                request_count: entry.request_count,
                first_seen_unix_ms: entry.first_seen_unix_ms,
                last_seen_unix_ms: entry.last_seen_unix_ms,
                pending_messages: entry.mailbox.len(),
            })
            .collect::<Vec<_>>();
        clients.sort_by(|a, b| {
            a.first_seen_unix_ms
                .cmp(&b.first_seen_unix_ms)
                .then_with(|| b.last_seen_unix_ms.cmp(&a.last_seen_unix_ms))
                .then_with(|| a.id.cmp(&b.id))
                .then_with(|| a.instance_id.cmp(&b.instance_id))
        });
        clients
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests
    }

    pub fn server_started_unix_ms(&self) -> i64 {
        self.server_started_unix_ms
    }

    pub fn disconnect_client(&mut self, client_id: &str, instance_id: &str) -> bool {
        let key = client_key(client_id, instance_id);
        self.clients.remove(&key).is_some()
    }

    /// Queues a message for a registered context, dropping the oldest one
    /// when the mailbox is full. Returns false for unknown contexts.
    pub fn enqueue(&mut self, client_id: &str, instance_id: &str, message: ServerMessage) -> bool {
        let key = client_key(client_id, instance_id);
        let Some(record) = self.clients.get_mut(&key) else {
            return false;
        };
        if record.mailbox.len() >= MAILBOX_CAPACITY {
            let _ = record.mailbox.pop_front();
        }
        record.mailbox.push_back(message);
        true
    }

    fn touch_client(&mut self, client_id: &str, instance_id: &str, remote_ip: IpAddr, now_ms: i64) {
        let key = client_key(client_id, instance_id);
        let entry = self.clients.entry(key).or_insert_with(|| ClientRecord {
            id: client_id.to_string(),
            instance_id: instance_id.to_string(),
            ip: remote_ip.to_string(),
            request_count: 0,
            first_seen_unix_ms: now_ms,
            last_seen_unix_ms: now_ms,
            mailbox: VecDeque::new(),
        });
        entry.ip = remote_ip.to_string();
        entry.request_count = entry.request_count.saturating_add(1);
        entry.last_seen_unix_ms = now_ms;
    }

    fn drain_mailbox(&mut self, client_id: &str, instance_id: &str) -> Vec<ServerMessage> {
        let key = client_key(client_id, instance_id);
        self.clients
            .get_mut(&key)
            .map(|record| record.mailbox.drain(..).collect())
            .unwrap_or_default()
    }
}

/// Registry view over the API state: live contexts are the ones that polled
/// their mailbox within the TTL.
#[derive(Clone)]
pub struct SharedClientRegistry {
    state: Arc<Mutex<ApiSharedState>>,
    ttl_ms: i64,
}

impl SharedClientRegistry {
    pub fn new(state: Arc<Mutex<ApiSharedState>>, ttl_ms: i64) -> Self {
        Self { state, ttl_ms }
    }
}

impl ClientRegistry for SharedClientRegistry {
    fn match_all(&self) -> Vec<ClientHandle> {
        let Ok(guard) = self.state.lock() else {
            warn!("client registry lock poisoned; treating as no live contexts");
            return Vec::new();
        };
        guard
            .connected_clients(Local::now().timestamp_millis(), self.ttl_ms)
            .into_iter()
            .map(|client| ClientHandle {
                id: client.id,
                instance_id: client.instance_id,
            })
            .collect()
    }

    fn post_message(&self, client: &ClientHandle, message: &ServerMessage) -> Result<()> {
        let Ok(mut guard) = self.state.lock() else {
            bail!("client registry lock poisoned");
        };
        if !guard.enqueue(&client.id, &client.instance_id, *message) {
            bail!(
                "client {}::{} is no longer registered",
                client.id,
                client.instance_id
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    pub bind_addr: String,
    pub port: u16,
    pub client_ttl_ms: i64,
}

pub struct ApiServer {
    port: u16,
    stop: Arc<AtomicBool>,
    http_join: Option<JoinHandle<()>>,
}

impl ApiServer {
    pub fn start(
        config: ApiServerConfig,
        state: Arc<Mutex<ApiSharedState>>,
        scheduler: SchedulerHandle,
    ) -> Result<Self> {
        let bind = format!("{}:{}", config.bind_addr, config.port);
        let server = Server::http(&bind)
            .map_err(|err| anyhow::anyhow!("failed to start API server on {bind}: {err}"))?;
        let port = server
            .server_addr()
            .to_ip()
            .map(|addr| addr.port())
            .unwrap_or(config.port);
        let stop = Arc::new(AtomicBool::new(false));
        let stop_for_thread = Arc::clone(&stop);
        let client_ttl_ms = config.client_ttl_ms;
        let http_join = thread::spawn(move || {
            run_server_loop(
                server,
                state,
                scheduler,
                client_ttl_ms,
                stop_for_thread,
            )
        });
        info!(%bind, port, "alarm API listening");

        Ok(Self {
            port,
            stop,
            http_join: Some(http_join),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Blocks until the HTTP loop exits.
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
    }
}

fn run_server_loop(
    server: Server,
    state: Arc<Mutex<ApiSharedState>>,
    scheduler: SchedulerHandle,
    client_ttl_ms: i64,
    stop: Arc<AtomicBool>,
) {
    while !stop.load(Ordering::Relaxed) {
        match server.recv_timeout(Duration::from_millis(200)) {
            Ok(Some(request)) => handle_request(request, &state, &scheduler, client_ttl_ms),
            Ok(None) => continue,
            Err(_) => continue,
        }
    }
}

fn handle_request(
    mut request: tiny_http::Request,
    state: &Arc<Mutex<ApiSharedState>>,
    scheduler: &SchedulerHandle,
    client_ttl_ms: i64,
) {
    let Some(remote_addr) = request.remote_addr() else {
        let _ = send_text(request, StatusCode(400), "missing remote address");
        return;
    };
    let remote_ip = remote_addr.ip();
    if !is_local_network_ip(remote_ip) {
        let _ = send_text(request, StatusCode(403), "forbidden: local network only");
        return;
    }
    let request_received_unix_ms = Local::now().timestamp_millis();

    let url = request.url().to_string();
    let (path, query) = split_path_query(&url);
    let method = request.method().clone();
    let client_id = extract_client_id(query, &request).unwrap_or_else(|| remote_ip.to_string());
    let client_instance =
        extract_client_instance(query, &request).unwrap_or_else(|| "default".to_string());
    debug!(%method, path, %client_id, "api request");

    let mut guard = match state.lock() {
        Ok(guard) => guard,
        Err(_) => {
            let _ = send_text(request, StatusCode(500), "internal state lock error");
            return;
        }
    };
    guard.total_requests = guard.total_requests.saturating_add(1);

    match (&method, path) {
        (Method::Get, "/healthz") => {
            let _ = send_text(request, StatusCode(200), "ok");
        }
        (Method::Post, "/v1/messages") => {
            drop(guard);
            let body = match read_body(&mut request) {
                Ok(body) => body,
                Err(err) => {
                    let _ = send_text(request, StatusCode(400), &format!("unreadable body: {err}"));
                    return;
                }
            };
            match serde_json::from_str::<ClientMessage>(&body) {
                Ok(message) => {
                    #[derive(Serialize)]
                    struct AcceptedResponse {
                        accepted: bool,
                    }

                    // Command validity is decided by the scheduler and never reported back.
                    match scheduler.send(message) {
                        Ok(()) => {
                            let _ = send_json(
                                request,
                                StatusCode(202),
                                &AcceptedResponse { accepted: true },
                            );
                        }
                        Err(err) => {
                            let _ = send_text(request, StatusCode(503), &format!("{err:#}"));
                        }
                    }
                }
                Err(err) => {
                    let _ = send_text(request, StatusCode(400), &format!("invalid message: {err}"));
                }
            }
        }
        (Method::Get, "/v1/client/messages") => {
            guard.touch_client(
                &client_id,
                &client_instance,
                remote_ip,
                request_received_unix_ms,
            );
            let payload = Mailbox {
                messages: guard.drain_mailbox(&client_id, &client_instance),
            };
            let _ = send_json(request, StatusCode(200), &payload);
        }
        (Method::Post, "/v1/client/disconnect") => {
            #[derive(Serialize)]
            struct DisconnectResponse {
                disconnected: bool,
                client_id: String,
                instance_id: String,
            }

            let disconnected = guard.disconnect_client(&client_id, &client_instance);
            let payload = DisconnectResponse {
                disconnected,
                client_id,
                instance_id: client_instance,
            };
            let _ = send_json(request, StatusCode(200), &payload);
        }
        (Method::Get, "/v1/clients") => {
            #[derive(Serialize)]
            struct ClientsResponse {
                count: usize,
                clients: Vec<PublicClient>,
            }

            let clients =
                guard.connected_clients(Local::now().timestamp_millis(), client_ttl_ms);
            let payload = ClientsResponse {
                count: clients.len(),
                clients,
            };
            let _ = send_json(request, StatusCode(200), &payload);
        }
        (Method::Get, "/" | "/v1/state") => {
            #[derive(Serialize)]
            struct StateResponse {
                scheduler: SchedulerSnapshot,
                clients_seen: usize,
                total_requests: u64,
                server_started_unix_ms: i64,
                response_unix_ms: i64,
            }

            let clients_seen = guard
                .connected_clients(Local::now().timestamp_millis(), client_ttl_ms)
                .len();
            let total_requests = guard.total_requests();
            let server_started_unix_ms = guard.server_started_unix_ms();
            drop(guard);

            match scheduler.snapshot() {
                Ok(snapshot) => {
                    let payload = StateResponse {
                        scheduler: snapshot,
                        clients_seen,
                        total_requests,
                        server_started_unix_ms,
                        response_unix_ms: Local::now().timestamp_millis(),
                    };
                    let _ = send_json(request, StatusCode(200), &payload);
                }
                Err(err) => {
                    let _ = send_text(request, StatusCode(503), &format!("{err:#}"));
                }
            }
        }
        (
            _,
            "/healthz" | "/v1/messages" | "/v1/client/messages" | "/v1/client/disconnect"
            | "/v1/clients" | "/" | "/v1/state",
        ) => {
            let _ = send_text(request, StatusCode(405), "method not allowed");
        }
        _ => {
            let _ = send_text(request, StatusCode(404), "not found");
        }
    }
}

fn read_body(request: &mut tiny_http::Request) -> Result<String> {
    let mut body = String::new();
    request
        .as_reader()
        .take(MAX_BODY_BYTES)
        .read_to_string(&mut body)?;
    Ok(body)
}

fn client_key(client_id: &str, instance_id: &str) -> String {
    format!("{client_id}::{instance_id}")
}

fn send_json<T: Serialize>(
    request: tiny_http::Request,
    status: StatusCode,
    body: &T,
) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    let content_type = Header::from_str("Content-Type: application/json; charset=utf-8")
        .map_err(|_| anyhow::anyhow!("failed to build content-type header"))?;
    request.respond(
        Response::from_data(payload)
            .with_status_code(status)
            .with_header(content_type),
    )?;
    Ok(())
}

fn send_text(request: tiny_http::Request, status: StatusCode, body: &str) -> Result<()> {
    let content_type = Header::from_str("Content-Type: text/plain; charset=utf-8")
        .map_err(|_| anyhow::anyhow!("failed to build content-type header"))?;
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

fn extract_client_id(query: &str, request: &tiny_http::Request) -> Option<String> {
    extract_identity(query, "client_id", request, "X-Client-Id")
}

fn extract_client_instance(query: &str, request: &tiny_http::Request) -> Option<String> {
    extract_identity(query, "instance_id", request, "X-Client-Instance")
}

fn extract_identity(
    query: &str,
    param: &str,
    request: &tiny_http::Request,
    header_name: &'static str,
) -> Option<String> {
    if let Some(value) = query_param(query, param) {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return Some(trimmed.to_string());
        }
    }

    for header in request.headers() {
        if header.field.equiv(header_name) {
            let value = header.value.as_str().trim();
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
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

fn is_local_network_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || is_ipv4_mapped_local(v6)
        }
    }
}

fn is_ipv4_mapped_local(v6: Ipv6Addr) -> bool {
    match v6.to_ipv4_mapped() {
        Some(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        None => false,
    }
}
