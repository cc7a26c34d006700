//! NAT punch-through signaling.
//!
//! The punch server is an external HTTP+UDP service: hosts register their
//! endpoints, clients request an introduction and receive a token, then both
//! sides fire a UDP introduce at the punch server through their transports
//! ([`Transport::nat_introduce`](crate::transport::Transport::nat_introduce)).
//! Success surfaces as
//! [`TransportEvent::NatPunchSuccess`](crate::transport::TransportEvent::NatPunchSuccess)
//! and the runtime connects to the punched endpoint normally.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::PunchError;

// ── Wire types ──────────────────────────────────────────────────────

/// Answer to `GET <base>/api/punch/info`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PunchInfoResponse {
    pub available: bool,
    pub address: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl PunchInfoResponse {
    /// The punch server's UDP endpoint.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        format!("{}:{}", self.address, self.port).parse().ok()
    }
}

/// Body for `POST <base>/api/punch/register`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PunchRegisterRequest {
    pub lobby_id: String,
    pub internal_endpoint: String,
    pub external_port: u16,
}

/// Body for `POST <base>/api/punch/request`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PunchRequest {
    pub lobby_id: String,
    pub client_internal_endpoint: String,
    pub client_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_token: Option<String>,
}

/// Answer to `POST <base>/api/punch/request`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PunchRequestResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub punch_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Everything a client needs to fire its introduce request.
#[derive(Debug, Clone, PartialEq)]
pub struct PunchTicket {
    /// The punch server's UDP endpoint.
    pub punch_server: SocketAddr,
    /// Token binding this introduce to the host's registration.
    pub token: String,
}

// ── Client ──────────────────────────────────────────────────────────

/// HTTP signaling client for the punch server.
pub struct NatPunchClient {
    http: reqwest::Client,
    base_url: String,
}

impl NatPunchClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            http: reqwest::Client::new(),
            base_url,
        }
    }

    /// Query the punch server's availability and endpoint.
    pub async fn info(&self) -> Result<PunchInfoResponse, PunchError> {
        let info: PunchInfoResponse = self
            .http
            .get(format!("{}/api/punch/info", self.base_url))
            .send()
            .await?
            .json()
            .await?;
        if !info.available {
            return Err(PunchError::Unavailable(
                info.message.unwrap_or_else(|| "punch server offline".to_string()),
            ));
        }
        Ok(info)
    }

    /// Host side: publish this lobby's endpoints.
    pub async fn register_host(&self, request: &PunchRegisterRequest) -> Result<(), PunchError> {
        let response = self
            .http
            .post(format!("{}/api/punch/register", self.base_url))
            .json(request)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(PunchError::Rejected(format!(
                "registration returned HTTP {}",
                response.status().as_u16()
            )));
        }
        debug!(lobby_id = %request.lobby_id, "punch registration published");
        Ok(())
    }

    /// Host side: withdraw the registration, best-effort.
    pub async fn unregister_host(&self, lobby_id: &str) {
        let result = self
            .http
            .delete(format!("{}/api/punch/register/{lobby_id}", self.base_url))
            .send()
            .await;
        if let Err(error) = result {
            debug!(%error, "punch unregistration failed");
        }
    }

    /// Client side: request an introduction, returning the punch token.
    pub async fn request_punch(&self, request: &PunchRequest) -> Result<String, PunchError> {
        let response: PunchRequestResponse = self
            .http
            .post(format!("{}/api/punch/request", self.base_url))
            .json(request)
            .send()
            .await?
            .json()
            .await?;
        match (response.success, response.punch_token) {
            (true, Some(token)) => Ok(token),
            _ => Err(PunchError::Rejected(
                response
                    .message
                    .unwrap_or_else(|| "punch request refused".to_string()),
            )),
        }
    }

    /// Client convenience: info + request in one call, yielding the ticket
    /// for [`ClientRuntime::connect_punched`](crate::client::ClientRuntime::connect_punched).
    pub async fn acquire_ticket(&self, request: &PunchRequest) -> Result<PunchTicket, PunchError> {
        let info = self.info().await?;
        let punch_server = info.socket_addr().ok_or_else(|| {
            PunchError::Unavailable(format!("bad punch endpoint {}:{}", info.address, info.port))
        })?;
        let token = self.request_punch(request).await?;
        Ok(PunchTicket {
            punch_server,
            token,
        })
    }
}
