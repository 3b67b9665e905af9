//! HTTP surface for node agents
//!
//! Uses hyper http1 with TokioIo for async handling. Three routes matter:
//! one-shot registration, the persistent channel upgrade, and health/status
//! probes. Admin consoles and tenant APIs live outside the core.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::registry::NodeRegistration;
use crate::server::auth;
use crate::services::Services;
use crate::types::{HelmsmanError, Result};

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    node_id: String,
    host: String,
    capacity_mb: u64,
    agent_version: String,
}

#[derive(Debug, Serialize)]
struct RegisterResponse {
    node_id: String,
    status: String,
    /// Only present on first-run enrollment with the registration token
    #[serde(skip_serializing_if = "Option::is_none")]
    node_secret: Option<String>,
}

/// Start the HTTP server
pub async fn run(services: Arc<Services>) -> Result<()> {
    let listener = TcpListener::bind(services.args.listen).await?;
    info!(
        "Helmsman listening on {} as instance {}",
        services.args.listen, services.args.instance_id
    );
    if services.args.dev_mode {
        warn!("Development mode enabled - registration token not enforced");
    }

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let services = Arc::clone(&services);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req| {
                        let services = Arc::clone(&services);
                        async move { handle_request(services, req).await }
                    });
                    if let Err(err) = http1::Builder::new()
                        .serve_connection(io, service)
                        .with_upgrades()
                        .await
                    {
                        error!("Error serving connection from {}: {:?}", addr, err);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {:?}", e);
            }
        }
    }
}

async fn handle_request(
    services: Arc<Services>,
    req: Request<Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = match (method, path.as_str()) {
        (Method::POST, "/agent/register") => handle_register(&services, req).await,
        (Method::GET, "/agent/channel") => return Ok(handle_channel(&services, req).await),
        (Method::GET, "/healthz") => handle_healthz(&services),
        (Method::GET, "/status") => handle_status(&services).await,
        _ => Err(HelmsmanError::NotFound(format!("no route for {}", path))),
    };

    Ok(response.unwrap_or_else(error_response))
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .expect("static response")
}

fn error_response(err: HelmsmanError) -> Response<Full<Bytes>> {
    json_response(err.status_code(), &err.to_body())
}

/// One-shot node registration with a bearer credential: the shared
/// registration token on first run (returns a persistent per-node secret)
/// or the node's stored secret on reconnect.
async fn handle_register(
    services: &Arc<Services>,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>> {
    let bearer = auth::extract_bearer(&req);
    let body = req
        .into_body()
        .collect()
        .await
        .map_err(|e| HelmsmanError::BadRequest(format!("body read failed: {}", e)))?
        .to_bytes();
    let request: RegisterRequest = serde_json::from_slice(&body)?;
    if request.node_id.is_empty() || request.capacity_mb == 0 {
        return Err(HelmsmanError::BadRequest(
            "node_id and capacity_mb are required".to_string(),
        ));
    }

    let enrollment = check_registration_auth(services, &request.node_id, bearer.as_deref()).await?;

    let registration = NodeRegistration {
        node_id: request.node_id.clone(),
        host: request.host,
        capacity_mb: request.capacity_mb,
        agent_version: request.agent_version,
    };
    let node = services.fabric.register_node(&registration).await?;

    let node_secret = if enrollment {
        let secret = auth::generate_node_secret();
        services
            .nodes
            .set_secret_hash(
                &node.id,
                &auth::secret_fingerprint(&secret),
                services.clock.now_ms(),
            )
            .await?;
        Some(secret)
    } else {
        None
    };

    Ok(json_response(
        StatusCode::OK,
        &RegisterResponse {
            node_id: node.id,
            status: node.status.as_str().to_string(),
            node_secret,
        },
    ))
}

/// Returns true when this is a first-run enrollment (token auth) that needs
/// a fresh per-node secret issued
async fn check_registration_auth(
    services: &Arc<Services>,
    node_id: &str,
    bearer: Option<&str>,
) -> Result<bool> {
    if let (Some(expected), Some(presented)) =
        (services.args.registration_token.as_deref(), bearer)
    {
        if expected == presented {
            return Ok(true);
        }
    }

    if let Some(presented) = bearer {
        if let Some(node) = services.nodes.get(node_id).await? {
            if let Some(ref stored) = node.secret_hash {
                if auth::verify_secret(presented, stored) {
                    return Ok(false);
                }
            }
        }
    }

    if services.args.dev_mode && services.args.registration_token.is_none() {
        // Dev mode without a token accepts anyone; issue a secret anyway so
        // the channel upgrade has something to check
        return Ok(true);
    }

    Err(HelmsmanError::Unauthorized(
        "invalid registration credential".to_string(),
    ))
}

/// Persistent channel upgrade, authenticated with the per-node secret
async fn handle_channel(
    services: &Arc<Services>,
    mut req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    let auth_result = authorize_channel(services, &req).await;
    let node_id = match auth_result {
        Ok(node_id) => node_id,
        Err(e) => {
            warn!(error = %e, "Channel upgrade rejected");
            return error_response(e);
        }
    };

    if !hyper_tungstenite::is_upgrade_request(&req) {
        return error_response(HelmsmanError::BadRequest(
            "expected a WebSocket upgrade".to_string(),
        ));
    }

    match hyper_tungstenite::upgrade(&mut req, None) {
        Ok((response, websocket)) => {
            let fabric = Arc::clone(&services.fabric);
            tokio::spawn(async move {
                match websocket.await {
                    Ok(ws) => fabric.attach(&node_id, ws),
                    Err(e) => error!(node_id = %node_id, "WebSocket upgrade failed: {:?}", e),
                }
            });

            let (parts, _) = response.into_parts();
            Response::from_parts(parts, Full::new(Bytes::new()))
        }
        Err(e) => {
            error!("WebSocket upgrade error: {:?}", e);
            error_response(HelmsmanError::WebSocket(e.to_string()))
        }
    }
}

async fn authorize_channel(
    services: &Arc<Services>,
    req: &Request<Incoming>,
) -> Result<String> {
    let node_id = auth::query_param(req, "node_id")
        .ok_or_else(|| HelmsmanError::BadRequest("node_id query parameter required".to_string()))?;
    let bearer = auth::extract_bearer(req)
        .ok_or_else(|| HelmsmanError::Unauthorized("missing channel credential".to_string()))?;

    let node = services
        .nodes
        .get(&node_id)
        .await?
        .ok_or_else(|| HelmsmanError::NotFound(format!("node {}", node_id)))?;
    let stored = node.secret_hash.as_deref().ok_or_else(|| {
        HelmsmanError::Unauthorized(format!("node {} has no enrolled secret", node_id))
    })?;
    if !auth::verify_secret(&bearer, stored) {
        return Err(HelmsmanError::Unauthorized(
            "invalid channel credential".to_string(),
        ));
    }
    Ok(node_id)
}

fn handle_healthz(services: &Arc<Services>) -> Result<Response<Full<Bytes>>> {
    Ok(json_response(
        StatusCode::OK,
        &serde_json::json!({
            "status": "ok",
            "connected_nodes": services.fabric.connected_nodes().len(),
        }),
    ))
}

async fn handle_status(services: &Arc<Services>) -> Result<Response<Full<Bytes>>> {
    let nodes = services.nodes.list().await?;
    let connected = services.fabric.connected_nodes();
    let summary: Vec<_> = nodes
        .iter()
        .map(|n| {
            serde_json::json!({
                "id": n.id,
                "status": n.status.as_str(),
                "capacity_mb": n.capacity_mb,
                "used_mb": n.used_mb,
                "last_heartbeat_at": n.last_heartbeat_at,
                "connected": connected.contains(&n.id),
            })
        })
        .collect();
    Ok(json_response(
        StatusCode::OK,
        &serde_json::json!({ "nodes": summary }),
    ))
}
