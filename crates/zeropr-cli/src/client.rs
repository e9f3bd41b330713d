//! HTTP client for a running agent

use anyhow::{bail, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use zeropr_core::{Peer, Session};
use zeropr_daemon::DaemonStatus;

#[derive(Deserialize)]
struct PeerList {
    peers: Vec<Peer>,
}

#[derive(Deserialize)]
struct SessionList {
    sessions: Vec<Session>,
}

pub struct AgentClient {
    base: String,
    http: reqwest::Client,
}

impl AgentClient {
    pub fn new(port: u16) -> Self {
        Self {
            base: format!("http://127.0.0.1:{}", port),
            http: reqwest::Client::new(),
        }
    }

    async fn get(&self, path: &str) -> Result<Option<Value>> {
        let resp = match self.http.get(format!("{}{}", self.base, path)).send().await {
            Ok(resp) => resp,
            Err(e) if e.is_connect() => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Self::body(resp).await.map(Some)
    }

    async fn post(&self, path: &str, body: Value) -> Result<Option<Value>> {
        let resp = match self
            .http
            .post(format!("{}{}", self.base, path))
            .json(&body)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) if e.is_connect() => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Self::body(resp).await.map(Some)
    }

    async fn body(resp: reqwest::Response) -> Result<Value> {
        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            let message = body["error"].as_str().unwrap_or("request failed");
            bail!("{} ({})", message, status);
        }
        Ok(body)
    }

    fn not_running() -> Result<()> {
        println!("❌ Agent not running (start it with: zeropr daemon)");
        Ok(())
    }

    pub async fn status(&self) -> Result<()> {
        let Some(body) = self.get("/api/status").await? else {
            return Self::not_running();
        };
        let status: DaemonStatus = serde_json::from_value(body)?;

        println!("📊 ZeroPR Agent v{}", status.version);
        println!("   Device: {}", status.device_name);
        println!(
            "   Broadcasting: {}",
            if status.broadcasting { "yes" } else { "no" }
        );
        println!("   Peers: {}", status.peers_count);
        println!("   Sessions: {}", status.active_sessions);
        println!("   Presence: {}", status.presence.status);
        if let Some(file) = &status.presence.active_file {
            println!("   Active file: {}", file);
        }
        if !status.branch.is_empty() {
            println!("   Branch: {}", status.branch);
        }
        Ok(())
    }

    pub async fn peers(&self) -> Result<()> {
        let Some(body) = self.get("/api/peers").await? else {
            return Self::not_running();
        };
        let list: PeerList = serde_json::from_value(body)?;

        if list.peers.is_empty() {
            println!("🔍 No peers found yet");
            return Ok(());
        }

        println!("👥 Peers ({}):", list.peers.len());
        for peer in list.peers {
            let file = peer.active_file.as_deref().unwrap_or("-");
            println!(
                "   • {} [{}] {}:{} {} on {}",
                peer.name, peer.status, peer.address, peer.port, file, peer.branch
            );
        }
        Ok(())
    }

    pub async fn broadcast(&self, start: bool) -> Result<()> {
        let path = if start {
            "/api/broadcast/start"
        } else {
            "/api/broadcast/stop"
        };
        if self.post(path, json!({})).await?.is_none() {
            return Self::not_running();
        }

        if start {
            println!("📡 Broadcasting on the local network");
        } else {
            println!("🛑 Broadcast stopped");
        }
        Ok(())
    }

    pub async fn sessions(&self) -> Result<()> {
        let Some(body) = self.get("/api/sessions").await? else {
            return Self::not_running();
        };
        let list: SessionList = serde_json::from_value(body)?;

        if list.sessions.is_empty() {
            println!("📭 No active sessions");
            return Ok(());
        }

        println!("🤝 Sessions ({}):", list.sessions.len());
        for session in list.sessions {
            println!(
                "   • {} {} [{}]",
                session.id,
                session.file_path,
                session.participants.join(", ")
            );
        }
        Ok(())
    }

    pub async fn create_session(&self, file: &str, initiator: &str) -> Result<()> {
        let body = json!({ "filePath": file, "initiator": initiator });
        let Some(created) = self.post("/api/session/create", body).await? else {
            return Self::not_running();
        };

        println!("✅ Session created: {}", created["sessionId"].as_str().unwrap_or(""));
        println!("   Sync: {}", created["wsUrl"].as_str().unwrap_or(""));
        Ok(())
    }

    pub async fn join_session(&self, session_id: &str, participant: &str) -> Result<()> {
        let body = json!({ "sessionId": session_id, "participantId": participant });
        if self.post("/api/session/join", body).await?.is_none() {
            return Self::not_running();
        }
        println!("✅ Joined {} as {}", session_id, participant);
        Ok(())
    }

    pub async fn leave_session(&self, session_id: &str, participant: &str) -> Result<()> {
        let body = json!({ "sessionId": session_id, "participantId": participant });
        let Some(left) = self.post("/api/session/leave", body).await? else {
            return Self::not_running();
        };

        if left["sessionClosed"].as_bool().unwrap_or(false) {
            println!("👋 Left {}; session closed", session_id);
        } else {
            println!("👋 Left {}", session_id);
        }
        Ok(())
    }
}
