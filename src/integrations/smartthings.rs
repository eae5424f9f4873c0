use futures::future::BoxFuture;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};
use surf::{http::Method, Body, Client, RequestBuilder, Url};
use tracing::debug;

use crate::{Credential, Error, RemoteError, RoutineRef, SceneService};

pub const DEFAULT_BASE_URL: &str = "https://api.smartthings.com/";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scene {
    pub scene_id: String,
    #[serde(default)]
    pub scene_name: Option<String>,
    #[serde(default, deserialize_with = "icon_code")]
    pub scene_icon: Option<String>,
}

impl Scene {
    /// Trimmed scene name, or `Routine {id}` when the scene is unnamed.
    pub fn display_name(&self) -> String {
        match self.scene_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_owned(),
            _ => format!("Routine {}", self.scene_id),
        }
    }
}

// Icon codes show up as strings or bare numbers depending on the account.
fn icon_code<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(code)) => Some(code),
        Some(Value::Number(code)) => Some(code.to_string()),
        _ => None,
    })
}

#[derive(Deserialize)]
struct SceneList {
    #[serde(default)]
    items: Vec<Scene>,
}

pub struct SmartThings {
    client: Client,
    base: Url,
    token: Credential,
}

impl SmartThings {
    pub fn new(base: Url, token: Credential) -> Self {
        SmartThings {
            client: Client::new(),
            base,
            token,
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url, RemoteError> {
        self.base
            .join(path)
            .map_err(|e| RemoteError::Url(e.to_string()))
    }

    pub fn execute_request(&self, routine_id: &str) -> Result<surf::Request, RemoteError> {
        // The id is opaque; push it as one percent-encoded segment.
        let mut url = self.endpoint("v1/scenes/")?;
        url.path_segments_mut()
            .map_err(|_| RemoteError::Url(format!("`{}` cannot be a base", self.base)))?
            .pop_if_empty()
            .push(routine_id)
            .push("execute");
        let body = Body::from_json(&json!({})).map_err(RemoteError::Transport)?;
        Ok(RequestBuilder::new(Method::Post, url)
            .header("Authorization", self.token.bearer())
            .body(body)
            .build())
    }

    pub fn list_request(&self) -> Result<surf::Request, RemoteError> {
        let url = self.endpoint("v1/scenes")?;
        Ok(RequestBuilder::new(Method::Get, url)
            .header("Authorization", self.token.bearer())
            .build())
    }

    pub async fn execute(&self, routine_id: &str) -> Result<(), RemoteError> {
        let request = self.execute_request(routine_id)?;
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

    pub async fn scenes(&self) -> Result<Vec<Scene>, RemoteError> {
        let request = self.list_request()?;
        let mut response = self
            .client
            .send(request)
            .await
            .map_err(RemoteError::Transport)?;
        if !response.status().is_success() {
            return Err(RemoteError::Status(response.status() as u16));
        }
        let SceneList { items } = response
            .body_json()
            .await
            .map_err(RemoteError::Decode)?;
        Ok(items)
    }
}

impl SceneService for SmartThings {
    fn execute<'a>(&'a self, routine_id: &'a str) -> BoxFuture<'a, Result<(), RemoteError>> {
        Box::pin(SmartThings::execute(self, routine_id))
    }

    fn scenes<'a>(&'a self) -> BoxFuture<'a, Result<Vec<Scene>, RemoteError>> {
        Box::pin(SmartThings::scenes(self))
    }
}

/// Lists the account's scenes and keeps those whose icon matches `icon`.
pub async fn discover<S: SceneService + ?Sized>(
    service: &S,
    icon: &str,
) -> Result<Vec<RoutineRef>, Error> {
    let scenes = service.scenes().await.map_err(Error::RemoteFetchFailed)?;
    let total = scenes.len();
    let routines = scenes
        .into_iter()
        .filter(|scene| scene.scene_icon.as_deref() == Some(icon))
        .map(|scene| {
            let name = scene.display_name();
            RoutineRef::with_name(scene.scene_id, name)
        })
        .collect::<Vec<_>>();
    debug!(total, matched = routines.len(), icon, "scenes listed");
    Ok(routines)
}

#[cfg(test)]
mod tests {
    use async_compat::Compat;
    use smol::block_on;

    use super::*;
    use crate::testing::{serve, RecordingService};

    fn scene(id: &str, name: Option<&str>, icon: &str) -> Scene {
        Scene {
            scene_id: id.into(),
            scene_name: name.map(str::to_owned),
            scene_icon: Some(icon.into()),
        }
    }

    #[test]
    fn execute_request_shape() {
        let client = SmartThings::new(
            Url::parse(DEFAULT_BASE_URL).unwrap(),
            Credential::new("abc"),
        );
        let mut request = client.execute_request("xyz").unwrap();
        assert_eq!(request.method(), Method::Post);
        assert_eq!(
            request.url().as_str(),
            "https://api.smartthings.com/v1/scenes/xyz/execute"
        );
        assert_eq!(
            request.header("Authorization").unwrap().last().as_str(),
            "Bearer abc"
        );
        let body = block_on(request.take_body().into_string()).unwrap();
        assert_eq!(body, "{}");
    }

    #[test]
    fn execute_request_encodes_routine_id() {
        let client = SmartThings::new(
            Url::parse(DEFAULT_BASE_URL).unwrap(),
            Credential::new("abc"),
        );
        let request = client.execute_request("a/b?c#d").unwrap();
        assert_eq!(
            request.url().as_str(),
            "https://api.smartthings.com/v1/scenes/a%2Fb%3Fc%23d/execute"
        );
        let request = client.execute_request("../../v2/x").unwrap();
        assert_eq!(
            request.url().as_str(),
            "https://api.smartthings.com/v1/scenes/..%2F..%2Fv2%2Fx/execute"
        );
        assert!(request.url().query().is_none());
    }

    #[test]
    fn execute_with_unsafe_id_stays_on_execute_endpoint() {
        block_on(Compat::new(async {
            let (base, hits) = serve(200, "{}");
            let client = SmartThings::new(base, Credential::new("abc"));
            client.execute("xyz?a").await.unwrap();
            let hits = hits.lock().unwrap();
            assert_eq!(hits.len(), 1);
            assert_eq!(hits[0].1, "/v1/scenes/xyz%3Fa/execute");
        }))
    }

    #[test]
    fn list_request_shape() {
        let client = SmartThings::new(
            Url::parse(DEFAULT_BASE_URL).unwrap(),
            Credential::new("abc"),
        );
        let request = client.list_request().unwrap();
        assert_eq!(request.method(), Method::Get);
        assert_eq!(
            request.url().as_str(),
            "https://api.smartthings.com/v1/scenes"
        );
    }

    #[test]
    fn execute_posts_exactly_once() {
        block_on(Compat::new(async {
            let (base, hits) = serve(200, "{}");
            let client = SmartThings::new(base, Credential::new("abc"));
            client.execute("xyz").await.unwrap();
            let hits = hits.lock().unwrap();
            assert_eq!(hits.len(), 1);
            let (method, path, auth, body) = &hits[0];
            assert_eq!(method, "POST");
            assert_eq!(path, "/v1/scenes/xyz/execute");
            assert_eq!(auth.as_deref(), Some("Bearer abc"));
            assert_eq!(body, "{}");
        }))
    }

    #[test]
    fn execute_rejects_non_success_status() {
        block_on(Compat::new(async {
            let (base, hits) = serve(401, "{}");
            let client = SmartThings::new(base, Credential::new("abc"));
            let result = client.execute("xyz").await;
            assert!(matches!(result, Err(RemoteError::Status(401))));
            assert_eq!(hits.lock().unwrap().len(), 1);
        }))
    }

    #[test]
    fn scenes_decode_listing() {
        block_on(Compat::new(async {
            let (base, _) = serve(
                200,
                r#"{"items":[{"sceneId":"a","sceneName":" Movie ","sceneIcon":"204"},{"sceneId":"b","sceneIcon":204}]}"#,
            );
            let client = SmartThings::new(base, Credential::new("abc"));
            let scenes = client.scenes().await.unwrap();
            assert_eq!(scenes.len(), 2);
            assert_eq!(scenes[0].display_name(), "Movie");
            assert_eq!(scenes[1].scene_icon.as_deref(), Some("204"));
            assert_eq!(scenes[1].display_name(), "Routine b");
        }))
    }

    #[test]
    fn discover_filters_by_icon() {
        let service = RecordingService {
            scenes: vec![
                scene("a", Some("  Movie Night "), "204"),
                scene("b", Some("Lights Out"), "101"),
                scene("c", Some("   "), "204"),
            ],
            ..Default::default()
        };
        let routines = block_on(discover(&service, "204")).unwrap();
        assert_eq!(
            routines,
            vec![
                RoutineRef::with_name("a", "Movie Night"),
                RoutineRef::with_name("c", "Routine c"),
            ]
        );
        assert!(service.executed().is_empty());
    }

    #[test]
    fn discover_reports_fetch_failure() {
        let service = RecordingService {
            fetch_fails: true,
            ..Default::default()
        };
        assert!(matches!(
            block_on(discover(&service, "204")),
            Err(Error::RemoteFetchFailed(_))
        ));
    }
}
