//! HTTP client for the friend, group and profile services.
//!
//! Endpoints, relative to the configured base URL:
//!
//! | Call                | Request                              | Response                 |
//! |---------------------|--------------------------------------|--------------------------|
//! | friend status       | `GET /friends/{a}/{b}`               | `{"status": "accepted"}` |
//! | group membership    | `GET /groups/{g}/members/{u}`        | `{"member": true}`       |
//! | group members       | `GET /groups/{g}/members`            | `[1, 2, 3]`              |
//! | user profile        | `GET /users/{u}/profile` (404 = none)| `{"name", "avatar"}`     |

use std::time::Duration;

use async_trait::async_trait;
use reel_core::directory::{FriendStatus, SocialGraph, UserProfile};
use reel_core::{Error, Result, UserId};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;

/// Per-request timeout for directory calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Deserialize)]
struct FriendStatusBody {
    status: FriendStatus,
}

#[derive(Deserialize)]
struct MembershipBody {
    member: bool,
}

/// `SocialGraph` backed by the directory HTTP services.
pub struct HttpDirectory {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDirectory {
    /// Client for the services rooted at `base_url`.
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::InvalidConfig(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::CollaboratorError(format!("GET {} failed: {}", path, e)))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(Error::CollaboratorError(format!(
                "GET {} returned {}",
                path,
                resp.status()
            )));
        }

        resp.json::<T>()
            .await
            .map(Some)
            .map_err(|e| Error::CollaboratorError(format!("Bad response from {}: {}", path, e)))
    }
}

#[async_trait]
impl SocialGraph for HttpDirectory {
    async fn friend_status(&self, a: UserId, b: UserId) -> Result<FriendStatus> {
        Ok(self
            .get::<FriendStatusBody>(&format!("/friends/{}/{}", a, b))
            .await?
            .map(|body| body.status)
            .unwrap_or(FriendStatus::None))
    }

    async fn is_group_member(&self, group_id: i64, user: UserId) -> Result<bool> {
        Ok(self
            .get::<MembershipBody>(&format!("/groups/{}/members/{}", group_id, user))
            .await?
            .map(|body| body.member)
            .unwrap_or(false))
    }

    async fn group_members(&self, group_id: i64) -> Result<Vec<UserId>> {
        Ok(self
            .get::<Vec<UserId>>(&format!("/groups/{}/members", group_id))
            .await?
            .unwrap_or_default())
    }

    async fn user_profile(&self, user: UserId) -> Result<Option<UserProfile>> {
        self.get::<UserProfile>(&format!("/users/{}/profile", user)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;

    async fn serve_stub() -> String {
        let app = Router::new()
            .route(
                "/friends/:a/:b",
                get(|Path((a, b)): Path<(i64, i64)>| async move {
                    let status = if a + b == 3 { "accepted" } else { "none" };
                    Json(json!({ "status": status }))
                }),
            )
            .route("/groups/:g/members", get(|| async { Json(json!([1, 2, 3])) }))
            .route(
                "/groups/:g/members/:u",
                get(|Path((_, u)): Path<(i64, i64)>| async move { Json(json!({ "member": u <= 3 })) }),
            )
            .route(
                "/users/:u/profile",
                get(|Path(u): Path<i64>| async move {
                    if u == 1 {
                        Ok(Json(json!({ "name": "ana" })))
                    } else {
                        Err(AxumStatus::NOT_FOUND)
                    }
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/", addr)
    }

    #[tokio::test]
    async fn test_http_directory_contract() {
        let dir = HttpDirectory::new(&serve_stub().await).unwrap();

        assert_eq!(dir.friend_status(1, 2).await.unwrap(), FriendStatus::Accepted);
        assert_eq!(dir.friend_status(1, 5).await.unwrap(), FriendStatus::None);
        assert!(dir.is_group_member(500, 2).await.unwrap());
        assert!(!dir.is_group_member(500, 9).await.unwrap());
        assert_eq!(dir.group_members(500).await.unwrap(), vec![1, 2, 3]);
        assert_eq!(dir.user_profile(1).await.unwrap().unwrap().name, "ana");
        assert!(dir.user_profile(2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unreachable_directory_is_collaborator_error() {
        let dir = HttpDirectory::new("http://127.0.0.1:1").unwrap();
        let err = dir.friend_status(1, 2).await.unwrap_err();
        assert!(matches!(err, Error::CollaboratorError(_)));
        assert!(err.is_retryable());
    }
}
