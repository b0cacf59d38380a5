//! HTTP implementation of the remote seams.
//!
//! Talks to a REST backend: lecture documents under
//! `/users/{user}/lectures`, blobs under `/blobs/{path}`, anonymous auth
//! under `/auth`. The live feed is a polling loop; each poll result is
//! delivered as one ordered snapshot.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::{Folder, Lecture, LectureDocument, LecturePatch, UsageQuota};

use super::{AuthProvider, BlobStore, DocumentStore, RemoteError};

/// Poll interval for the snapshot feed
const FEED_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// REST client for the document store, blob store and auth provider
pub struct HttpRemote {
    base_url: String,
    client: reqwest::Client,
    /// Cached bearer token from the last sign-in/refresh
    token: Arc<Mutex<Option<String>>>,
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    user_id: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct DownloadUrlResponse {
    url: String,
}

impl HttpRemote {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
            token: Arc::new(Mutex::new(None)),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    /// Map a transport-level failure to the remote taxonomy
    fn transport_error(e: reqwest::Error) -> RemoteError {
        if e.is_timeout() {
            RemoteError::Timeout(e.to_string())
        } else if e.is_connect() || e.is_request() {
            RemoteError::Network(e.to_string())
        } else {
            RemoteError::Unknown(e.to_string())
        }
    }

    /// Map a non-success status to the remote taxonomy
    async fn status_error(response: reqwest::Response) -> RemoteError {
        let status = response.status();
        let message = response.text().await.unwrap_or_default();

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::Auth(message),
            StatusCode::TOO_MANY_REQUESTS | StatusCode::PAYMENT_REQUIRED => RemoteError::Quota {
                reason: if message.is_empty() {
                    "quota_exceeded".to_string()
                } else {
                    message
                },
            },
            s if s.is_server_error() => RemoteError::Server {
                status: s.as_u16(),
                message,
            },
            s => RemoteError::Client {
                status: s.as_u16(),
                message,
            },
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(Self::status_error(response).await)
        }
    }

    /// Delete all server-side user data.
    ///
    /// Any non-200 response is a failure; callers must not clear local
    /// state until this returns Ok.
    pub async fn delete_account(&self, token: &str) -> Result<(), RemoteError> {
        let response = self
            .client
            .post(self.url("account/delete"))
            .bearer_auth(token)
            .send()
            .await
            .map_err(Self::transport_error)?;

        if response.status() != StatusCode::OK {
            return Err(Self::status_error(response).await);
        }

        Ok(())
    }
}

#[async_trait]
impl DocumentStore for HttpRemote {
    async fn put_lecture(
        &self,
        user_id: &str,
        lecture_id: Uuid,
        patch: &LecturePatch,
    ) -> Result<(), RemoteError> {
        let response = self
            .client
            .patch(self.url(&format!("users/{}/lectures/{}", user_id, lecture_id)))
            .json(patch)
            .send()
            .await
            .map_err(Self::transport_error)?;

        Self::check(response).await.map(|_| ())
    }

    async fn delete_lecture(&self, user_id: &str, lecture_id: Uuid) -> Result<(), RemoteError> {
        let response = self
            .client
            .delete(self.url(&format!("users/{}/lectures/{}", user_id, lecture_id)))
            .send()
            .await
            .map_err(Self::transport_error)?;

        Self::check(response).await.map(|_| ())
    }

    async fn fetch_lectures(&self, user_id: &str) -> Result<Vec<Lecture>, RemoteError> {
        let response = self
            .client
            .get(self.url(&format!("users/{}/lectures", user_id)))
            .query(&[("order", "created_at.desc")])
            .send()
            .await
            .map_err(Self::transport_error)?;

        let documents: Vec<LectureDocument> = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| RemoteError::Unknown(e.to_string()))?;

        // Strict decode: malformed documents are dropped, not crashed on
        let total = documents.len();
        let lectures: Vec<Lecture> = documents.into_iter().filter_map(|d| d.decode()).collect();
        if lectures.len() < total {
            debug!(
                dropped = total - lectures.len(),
                "Dropped malformed lecture documents"
            );
        }

        Ok(lectures)
    }

    fn subscribe(&self, user_id: &str) -> mpsc::UnboundedReceiver<Vec<Lecture>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let user_id = user_id.to_string();
        let remote = HttpRemote {
            base_url: self.base_url.clone(),
            client: self.client.clone(),
            token: self.token.clone(),
        };

        tokio::spawn(async move {
            loop {
                match remote.fetch_lectures(&user_id).await {
                    Ok(snapshot) => {
                        if tx.send(snapshot).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Snapshot poll failed"),
                }
                tokio::time::sleep(FEED_POLL_INTERVAL).await;
            }
        });

        rx
    }

    async fn fetch_profile(&self, user_id: &str) -> Result<UsageQuota, RemoteError> {
        let response = self
            .client
            .get(self.url(&format!("users/{}/profile", user_id)))
            .send()
            .await
            .map_err(Self::transport_error)?;

        Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| RemoteError::Unknown(e.to_string()))
    }

    async fn put_folder(&self, user_id: &str, folder: &Folder) -> Result<(), RemoteError> {
        let response = self
            .client
            .put(self.url(&format!("users/{}/folders/{}", user_id, folder.id)))
            .json(folder)
            .send()
            .await
            .map_err(Self::transport_error)?;

        Self::check(response).await.map(|_| ())
    }

    async fn fetch_folders(&self, user_id: &str) -> Result<Vec<Folder>, RemoteError> {
        let response = self
            .client
            .get(self.url(&format!("users/{}/folders", user_id)))
            .send()
            .await
            .map_err(Self::transport_error)?;

        Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| RemoteError::Unknown(e.to_string()))
    }
}

#[async_trait]
impl BlobStore for HttpRemote {
    async fn upload(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), RemoteError> {
        let file_name = path.rsplit('/').next().unwrap_or(path).to_string();

        let part = Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(content_type)
            .map_err(|e| RemoteError::Unknown(e.to_string()))?;
        let form = Form::new().part("content", part);

        let response = self
            .client
            .post(self.url(&format!("blobs/{}", path)))
            .multipart(form)
            .send()
            .await
            .map_err(Self::transport_error)?;

        Self::check(response).await.map(|_| ())
    }

    async fn download_url(&self, path: &str) -> Result<String, RemoteError> {
        let response = self
            .client
            .get(self.url(&format!("blobs/{}/url", path)))
            .send()
            .await
            .map_err(Self::transport_error)?;

        let parsed: DownloadUrlResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| RemoteError::Unknown(e.to_string()))?;

        Ok(parsed.url)
    }
}

#[async_trait]
impl AuthProvider for HttpRemote {
    async fn sign_in_anonymously(&self) -> Result<String, RemoteError> {
        let response = self
            .client
            .post(self.url("auth/anonymous"))
            .send()
            .await
            .map_err(Self::transport_error)?;

        let auth: AuthResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| RemoteError::Unknown(e.to_string()))?;

        *self.token.lock().await = Some(auth.token);
        Ok(auth.user_id)
    }

    async fn id_token(&self, force_refresh: bool) -> Result<String, RemoteError> {
        if !force_refresh {
            if let Some(ref token) = *self.token.lock().await {
                return Ok(token.clone());
            }
        }

        let response = self
            .client
            .post(self.url("auth/token"))
            .send()
            .await
            .map_err(Self::transport_error)?;

        let auth: AuthResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| RemoteError::Unknown(e.to_string()))?;

        *self.token.lock().await = Some(auth.token.clone());
        Ok(auth.token)
    }

    async fn sign_out(&self) -> Result<(), RemoteError> {
        *self.token.lock().await = None;
        Ok(())
    }
}
