//! HTTP lobby directory (the "introducer"): advertisement heartbeat, lobby
//! list polling and lobby-code mapping.
//!
//! Only the client behavior lives here; the directory server is an external
//! service. Transient HTTP failures inside the heartbeat and poll loops are
//! logged and retried, never surfaced — the loops exit only on cancellation.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::DirectoryError;

// ── Wire types ──────────────────────────────────────────────────────

/// Body POSTed to `<base>/lobbies` on every heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LobbyAdvertisementRequest {
    pub lobby_id: String,
    pub lobby_name: String,
    pub host_name: String,
    pub address: String,
    pub port: u16,
    pub current_players: u32,
    pub max_players: u32,
    pub has_password: bool,
    pub version: String,
}

/// One lobby as listed by `GET <base>/lobbies`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LobbyDirectoryEntry {
    pub lobby_id: String,
    pub lobby_name: String,
    pub host_name: String,
    pub address: String,
    pub port: u16,
    pub current_players: u32,
    pub max_players: u32,
    pub has_password: bool,
    pub version: String,
    pub last_heartbeat_utc: DateTime<Utc>,
}

impl LobbyDirectoryEntry {
    /// Whether the host's heartbeat is fresher than `ttl` as of `now`.
    pub fn is_active(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.last_heartbeat_utc);
        age.num_milliseconds() <= ttl.as_millis() as i64
    }
}

/// Answer to `POST <base>/api/lobbies/code`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LobbyCodeResponse {
    /// Six uppercase hex characters.
    pub code: String,
    pub lobby_id: String,
}

/// Body for `POST <base>/api/lobbies/code/register`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LobbyCodeRegistration {
    pub code: String,
    pub lobby_id: String,
    pub host_address: String,
    pub host_port: u16,
}

// ── Advertiser ──────────────────────────────────────────────────────

/// Keeps this host's lobby listed in the directory.
pub struct LobbyAdvertiser {
    http: reqwest::Client,
    base_url: String,
}

impl LobbyAdvertiser {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: trim_base(base_url.into()),
        }
    }

    /// POST one advertisement.
    pub async fn advertise(&self, request: &LobbyAdvertisementRequest) -> Result<(), DirectoryError> {
        let response = self
            .http
            .post(format!("{}/lobbies", self.base_url))
            .json(request)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(DirectoryError::Status(response.status().as_u16()));
        }
        Ok(())
    }

    /// DELETE this lobby's listing, best-effort.
    pub async fn withdraw(&self, lobby_id: &str) {
        let result = self
            .http
            .delete(format!("{}/lobbies/{lobby_id}", self.base_url))
            .send()
            .await;
        if let Err(error) = result {
            debug!(%error, "directory withdraw failed");
        }
    }

    /// Heartbeat loop: POST `provider()` every `interval`, swallowing
    /// transient failures. On cancellation, withdraw best-effort and exit.
    pub async fn run<F>(&self, interval: Duration, provider: F, cancel: CancellationToken)
    where
        F: Fn() -> LobbyAdvertisementRequest + Send,
    {
        let mut ticker = tokio::time::interval(interval);
        let lobby_id = loop {
            tokio::select! {
                _ = cancel.cancelled() => break provider().lobby_id,
                _ = ticker.tick() => {
                    let request = provider();
                    if let Err(error) = self.advertise(&request).await {
                        warn!(%error, "lobby advertisement failed, will retry");
                    }
                }
            }
        };
        self.withdraw(&lobby_id).await;
        debug!("lobby advertiser stopped");
    }
}

// ── Directory client ────────────────────────────────────────────────

/// Polls the directory's lobby list and reports only genuine changes.
pub struct LobbyDirectoryClient {
    http: reqwest::Client,
    base_url: String,
    ttl: Duration,
    last: Mutex<Option<Vec<LobbyDirectoryEntry>>>,
}

impl LobbyDirectoryClient {
    /// `ttl` filters out lobbies whose last heartbeat is older.
    pub fn new(base_url: impl Into<String>, ttl: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: trim_base(base_url.into()),
            ttl,
            last: Mutex::new(None),
        }
    }

    /// GET the lobby list, stale entries filtered out.
    pub async fn fetch(&self) -> Result<Vec<LobbyDirectoryEntry>, DirectoryError> {
        let response = self
            .http
            .get(format!("{}/lobbies", self.base_url))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(DirectoryError::Status(response.status().as_u16()));
        }
        let entries: Vec<LobbyDirectoryEntry> = response.json().await?;
        let now = Utc::now();
        Ok(entries
            .into_iter()
            .filter(|entry| entry.is_active(self.ttl, now))
            .collect())
    }

    /// Fetch and compare against the previously seen list; `Some` iff the
    /// filtered list is structurally different.
    pub async fn refresh(&self) -> Result<Option<Vec<LobbyDirectoryEntry>>, DirectoryError> {
        let entries = self.fetch().await?;
        let Ok(mut last) = self.last.lock() else {
            return Ok(None);
        };
        if last.as_ref() == Some(&entries) {
            return Ok(None);
        }
        *last = Some(entries.clone());
        Ok(Some(entries))
    }

    /// Poll loop: refresh every `interval`, pushing changed lists into
    /// `changed_tx`. Transient failures are logged and retried; exits on
    /// cancellation.
    pub async fn run(
        &self,
        interval: Duration,
        changed_tx: mpsc::UnboundedSender<Vec<LobbyDirectoryEntry>>,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.refresh().await {
                        Ok(Some(entries)) => {
                            if changed_tx.send(entries).is_err() {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(error) => warn!(%error, "directory poll failed, will retry"),
                    }
                }
            }
        }
        debug!("directory poll loop stopped");
    }

    // ── Lobby codes ─────────────────────────────────────────────────

    /// Mint a share code for a lobby.
    pub async fn mint_code(&self, lobby_id: &str) -> Result<LobbyCodeResponse, DirectoryError> {
        let response = self
            .http
            .post(format!("{}/api/lobbies/code", self.base_url))
            .json(&serde_json::json!({ "lobbyId": lobby_id }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(DirectoryError::Status(response.status().as_u16()));
        }
        Ok(response.json().await?)
    }

    /// Bind a code to a host endpoint.
    pub async fn register_code(
        &self,
        registration: &LobbyCodeRegistration,
    ) -> Result<(), DirectoryError> {
        let response = self
            .http
            .post(format!("{}/api/lobbies/code/register", self.base_url))
            .json(registration)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(DirectoryError::Status(response.status().as_u16()));
        }
        Ok(())
    }

    /// Resolve a code to its lobby; `None` when the code is unknown.
    pub async fn resolve_code(
        &self,
        code: &str,
    ) -> Result<Option<LobbyDirectoryEntry>, DirectoryError> {
        let response = self
            .http
            .get(format!("{}/api/lobbies/code/{code}", self.base_url))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(DirectoryError::Status(response.status().as_u16()));
        }
        Ok(Some(response.json().await?))
    }

    /// Release a code, best-effort.
    pub async fn release_code(&self, code: &str) {
        let result = self
            .http
            .delete(format!("{}/api/lobbies/code/{code}", self.base_url))
            .send()
            .await;
        if let Err(error) = result {
            debug!(%error, "lobby code release failed");
        }
    }
}

fn trim_base(mut base: String) -> String {
    while base.ends_with('/') {
        base.pop();
    }
    base
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    fn entry(lobby_id: &str, heartbeat: DateTime<Utc>) -> LobbyDirectoryEntry {
        LobbyDirectoryEntry {
            lobby_id: lobby_id.into(),
            lobby_name: "lobby".into(),
            host_name: "host".into(),
            address: "203.0.113.9".into(),
            port: 7777,
            current_players: 1,
            max_players: 8,
            has_password: false,
            version: "0.1.0".into(),
            last_heartbeat_utc: heartbeat,
        }
    }

    #[test]
    fn stale_entries_are_inactive() {
        let now = Utc::now();
        let ttl = Duration::from_secs(30);
        assert!(entry("a", now).is_active(ttl, now));
        assert!(entry("b", now - chrono::Duration::seconds(29)).is_active(ttl, now));
        assert!(!entry("c", now - chrono::Duration::seconds(31)).is_active(ttl, now));
    }

    #[test]
    fn advertisement_uses_camel_case() {
        let request = LobbyAdvertisementRequest {
            lobby_id: "lob-1".into(),
            lobby_name: "Friday Night".into(),
            host_name: "Alice".into(),
            address: "203.0.113.9".into(),
            port: 7777,
            current_players: 2,
            max_players: 8,
            has_password: true,
            version: "0.1.0".into(),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("lobbyId").is_some());
        assert!(json.get("hasPassword").is_some());
        assert!(json.get("lobby_id").is_none());
    }
}
