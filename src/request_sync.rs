use serde::Serialize;
use serde_json::json;
use surf::{http::Method, Body, Client, RequestBuilder, Url};
use uuid::Uuid;

use crate::{Credential, RemoteError, ToggleState};

pub const DEFAULT_BASE_URL: &str = "https://homegraph.googleapis.com/";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SyncRequestBody<'a> {
    agent_user_id: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReportStateBody<'a> {
    request_id: String,
    agent_user_id: &'a str,
    payload: serde_json::Value,
}

/// The host's device graph: told when the published set changes and when a switch resets.
pub struct HomeGraph {
    client: Client,
    base: Url,
    token: Credential,
    agent_user_id: String,
}

impl HomeGraph {
    pub fn new<T: Into<String>>(base: Url, token: Credential, agent_user_id: T) -> Self {
        HomeGraph {
            client: Client::new(),
            base,
            token,
            agent_user_id: agent_user_id.into(),
        }
    }

    fn post<T: Serialize>(&self, path: &str, body: &T) -> Result<surf::Request, RemoteError> {
        let url = self
            .base
            .join(path)
            .map_err(|e| RemoteError::Url(e.to_string()))?;
        Ok(RequestBuilder::new(Method::Post, url)
            .header("Authorization", self.token.bearer())
            .body(Body::from_json(body).map_err(RemoteError::Transport)?)
            .build())
    }

    pub fn sync_request(&self) -> Result<surf::Request, RemoteError> {
        self.post(
            "v1/devices:requestSync",
            &SyncRequestBody {
                agent_user_id: &self.agent_user_id,
            },
        )
    }

    pub fn report_request(
        &self,
        device_id: &str,
        state: ToggleState,
    ) -> Result<surf::Request, RemoteError> {
        let mut states = serde_json::Map::new();
        states.insert(
            device_id.to_owned(),
            json!({ "on": (state == ToggleState::Active), "online": true }),
        );
        self.post(
            "v1/devices:reportStateAndNotification",
            &ReportStateBody {
                request_id: Uuid::new_v4().to_string(),
                agent_user_id: &self.agent_user_id,
                payload: json!({ "devices": { "states": states } }),
            },
        )
    }

    async fn send(&self, request: surf::Request) -> Result<(), RemoteError> {
        let response = self
            .client
            .send(request)
            .await
            .map_err(RemoteError::Transport)?;
        if !response.status().is_success() {
            return Err(RemoteError::Status(response.status() as u16));
        }
        Ok(())
    }

    pub async fn request_sync(&self) -> Result<(), RemoteError> {
        self.send(self.sync_request()?).await
    }

    pub async fn report_state(
        &self,
        device_id: &str,
        state: ToggleState,
    ) -> Result<(), RemoteError> {
        self.send(self.report_request(device_id, state)?).await
    }
}
