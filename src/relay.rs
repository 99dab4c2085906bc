//! Chat relay collaborator.
//!
//! The control plane forwards `matrix.*` calls to a [`ChatRelay`]. The bundled
//! [`MatrixRelay`] covers the handful of Matrix client-server endpoints the
//! bridge needs: password login, token refresh, sending a room message, and a
//! non-blocking sync used to drain new timeline events.

use std::collections::VecDeque;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::config::MatrixConfig;
use crate::error::RelayError;

/// Connection summary for `matrix.status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayStatus {
    pub connected: bool,
    pub logged_in: bool,
    pub user_id: Option<String>,
}

/// A timeline event as handed back to `matrix.receive`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub room_id: String,
    pub sender: String,
    pub event_id: String,
    pub content: serde_json::Value,
}

#[async_trait]
pub trait ChatRelay: Send + Sync {
    async fn status(&self) -> RelayStatus;

    /// Log in and return the user id.
    async fn login(&self, username: &str, password: SecretString) -> Result<String, RelayError>;

    /// Send a message and return the event id.
    async fn send(&self, room_id: &str, message: &str, msgtype: &str) -> Result<String, RelayError>;

    /// Return up to `limit` new events.
    async fn receive(&self, limit: usize) -> Result<Vec<RelayEvent>, RelayError>;

    /// Rotate the access token and return the user id.
    async fn refresh_token(&self) -> Result<String, RelayError>;
}

struct MatrixSession {
    user_id: String,
    access_token: SecretString,
    refresh_token: Option<SecretString>,
}

/// Matrix client-server relay over HTTPS.
pub struct MatrixRelay {
    client: reqwest::Client,
    homeserver_url: String,
    device_id: String,
    session: RwLock<Option<MatrixSession>>,
    since: Mutex<Option<String>>,
    queue: Mutex<VecDeque<RelayEvent>>,
}

#[derive(Deserialize)]
struct LoginResponse {
    user_id: String,
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Deserialize)]
struct SendResponse {
    event_id: String,
}

#[derive(Deserialize, Default)]
struct MatrixErrorBody {
    #[serde(default)]
    errcode: String,
}

#[derive(Deserialize)]
struct SyncResponse {
    next_batch: String,
    #[serde(default)]
    rooms: SyncRooms,
}

#[derive(Deserialize, Default)]
struct SyncRooms {
    #[serde(default)]
    join: std::collections::HashMap<String, JoinedRoom>,
}

#[derive(Deserialize, Default)]
struct JoinedRoom {
    #[serde(default)]
    timeline: Timeline,
}

#[derive(Deserialize, Default)]
struct Timeline {
    #[serde(default)]
    events: Vec<TimelineEvent>,
}

#[derive(Deserialize)]
struct TimelineEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    sender: String,
    #[serde(default)]
    event_id: String,
    #[serde(default)]
    content: serde_json::Value,
}

impl MatrixRelay {
    pub fn new(config: &MatrixConfig) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            homeserver_url: config.homeserver_url.trim_end_matches('/').to_string(),
            device_id: config.device_id.clone(),
            session: RwLock::new(None),
            since: Mutex::new(None),
            queue: Mutex::new(VecDeque::new()),
        }
    }

    fn endpoint(&self, segments: &[&str]) -> Result<reqwest::Url, RelayError> {
        let mut url =
            reqwest::Url::parse(&self.homeserver_url).map_err(|e| RelayError::Http {
                context: "url",
                reason: e.to_string(),
            })?;
        url.path_segments_mut()
            .map_err(|_| RelayError::Http {
                context: "url",
                reason: "homeserver URL cannot be a base".to_string(),
            })?
            .pop_if_empty()
            .extend(["_matrix", "client", "v3"])
            .extend(segments);
        Ok(url)
    }

    async fn access_token(&self) -> Result<String, RelayError> {
        self.session
            .read()
            .await
            .as_ref()
            .map(|s| s.access_token.expose_secret().to_string())
            .ok_or(RelayError::NotLoggedIn)
    }

    /// Check the status and decode the body, never echoing the body on failure.
    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
        context: &'static str,
    ) -> Result<T, RelayError> {
        let status = response.status();
        if !status.is_success() {
            let body: MatrixErrorBody = response.json().await.unwrap_or_default();
            return Err(RelayError::Rejected {
                context,
                status: status.as_u16(),
                errcode: body.errcode,
            });
        }
        response.json().await.map_err(|e| RelayError::Decode {
            context,
            reason: e.to_string(),
        })
    }

    async fn sync_once(&self) -> Result<(), RelayError> {
        let token = self.access_token().await?;
        let mut url = self.endpoint(&["sync"])?;
        {
            let since = self.since.lock().await;
            let mut query = url.query_pairs_mut();
            query.append_pair("timeout", "0");
            if let Some(ref since) = *since {
                query.append_pair("since", since);
            }
        }

        let response = self
            .client
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| RelayError::Http {
                context: "sync",
                reason: e.to_string(),
            })?;
        let sync: SyncResponse = Self::decode(response, "sync").await?;

        let mut queue = self.queue.lock().await;
        for (room_id, room) in sync.rooms.join {
            for event in room.timeline.events {
                queue.push_back(RelayEvent {
                    event_type: event.event_type,
                    room_id: room_id.clone(),
                    sender: event.sender,
                    event_id: event.event_id,
                    content: event.content,
                });
            }
        }
        *self.since.lock().await = Some(sync.next_batch);
        Ok(())
    }
}

#[async_trait]
impl ChatRelay for MatrixRelay {
    async fn status(&self) -> RelayStatus {
        let session = self.session.read().await;
        RelayStatus {
            connected: session.is_some(),
            logged_in: session.is_some(),
            user_id: session.as_ref().map(|s| s.user_id.clone()),
        }
    }

    async fn login(&self, username: &str, password: SecretString) -> Result<String, RelayError> {
        let body = serde_json::json!({
            "type": "m.login.password",
            "identifier": { "type": "m.id.user", "user": username },
            "password": password.expose_secret(),
            "device_id": self.device_id,
            "refresh_token": true,
        });

        let response = self
            .client
            .post(self.endpoint(&["login"])?)
            .json(&body)
            .send()
            .await
            .map_err(|e| RelayError::Http {
                context: "login",
                reason: e.to_string(),
            })?;
        let login: LoginResponse = Self::decode(response, "login").await?;

        let user_id = login.user_id.clone();
        *self.session.write().await = Some(MatrixSession {
            user_id: login.user_id,
            access_token: SecretString::from(login.access_token),
            refresh_token: login.refresh_token.map(SecretString::from),
        });
        *self.since.lock().await = None;

        tracing::info!(user_id = %user_id, "Logged in to Matrix homeserver");
        Ok(user_id)
    }

    async fn send(&self, room_id: &str, message: &str, msgtype: &str) -> Result<String, RelayError> {
        let token = self.access_token().await?;
        let txn_id = format!("armorclaw-{}", uuid::Uuid::new_v4().simple());
        let url = self.endpoint(&["rooms", room_id, "send", "m.room.message", &txn_id])?;

        let response = self
            .client
            .put(url)
            .bearer_auth(token)
            .json(&serde_json::json!({ "msgtype": msgtype, "body": message }))
            .send()
            .await
            .map_err(|e| RelayError::Http {
                context: "send",
                reason: e.to_string(),
            })?;
        let sent: SendResponse = Self::decode(response, "send").await?;

        tracing::debug!(room_id = %room_id, event_id = %sent.event_id, "Sent Matrix message");
        Ok(sent.event_id)
    }

    async fn receive(&self, limit: usize) -> Result<Vec<RelayEvent>, RelayError> {
        if self.queue.lock().await.len() < limit {
            self.sync_once().await?;
        }
        let mut queue = self.queue.lock().await;
        let take = limit.min(queue.len());
        Ok(queue.drain(..take).collect())
    }

    async fn refresh_token(&self) -> Result<String, RelayError> {
        let refresh = {
            let session = self.session.read().await;
            let session = session.as_ref().ok_or(RelayError::NotLoggedIn)?;
            session
                .refresh_token
                .as_ref()
                .map(|t| t.expose_secret().to_string())
                .ok_or(RelayError::Http {
                    context: "refresh",
                    reason: "homeserver issued no refresh token".to_string(),
                })?
        };

        let response = self
            .client
            .post(self.endpoint(&["refresh"])?)
            .json(&serde_json::json!({ "refresh_token": refresh }))
            .send()
            .await
            .map_err(|e| RelayError::Http {
                context: "refresh",
                reason: e.to_string(),
            })?;
        let refreshed: RefreshResponse = Self::decode(response, "refresh").await?;

        let mut session = self.session.write().await;
        let session = session.as_mut().ok_or(RelayError::NotLoggedIn)?;
        session.access_token = SecretString::from(refreshed.access_token);
        if let Some(next) = refreshed.refresh_token {
            session.refresh_token = Some(SecretString::from(next));
        }
        tracing::info!(user_id = %session.user_id, "Refreshed Matrix access token");
        Ok(session.user_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relay() -> MatrixRelay {
        MatrixRelay::new(&MatrixConfig {
            homeserver_url: "https://matrix.example.org/".to_string(),
            device_id: "armorclaw-bridge".to_string(),
        })
    }

    #[test]
    fn test_endpoint_escapes_room_ids() {
        let url = relay()
            .endpoint(&["rooms", "!abc:example.org", "send", "m.room.message", "t1"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://matrix.example.org/_matrix/client/v3/rooms/!abc:example.org/send/m.room.message/t1"
        );
        let slashy = relay().endpoint(&["rooms", "a/b"]).unwrap();
        assert!(slashy.as_str().ends_with("/rooms/a%2Fb"));
    }

    #[tokio::test]
    async fn test_status_before_login() {
        let status = relay().status().await;
        assert!(!status.logged_in);
        assert_eq!(status.user_id, None);
    }

    #[tokio::test]
    async fn test_send_requires_login() {
        let err = relay().send("!r:x", "hi", "m.text").await.unwrap_err();
        assert!(matches!(err, RelayError::NotLoggedIn));
    }

    #[test]
    fn test_sync_response_parses_timeline() {
        let raw = serde_json::json!({
            "next_batch": "s1",
            "rooms": { "join": { "!r:x": { "timeline": { "events": [
                { "type": "m.room.message", "sender": "@a:x", "event_id": "$1",
                  "content": { "msgtype": "m.text", "body": "hello" } }
            ]}}}}
        });
        let sync: SyncResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(sync.next_batch, "s1");
        assert_eq!(sync.rooms.join["!r:x"].timeline.events.len(), 1);
    }
}
