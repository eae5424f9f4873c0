use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub enum Request {
    Enumerate,
    CheckAuth,
    Trigger { id: String },
}

#[derive(Serialize, Deserialize, Debug)]
pub struct EnumerateResponse {
    pub routines: Vec<Routine>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Copy)]
pub enum State {
    Active,
    Inactive,
}

#[derive(Deserialize, Serialize, Debug)]
pub struct Routine {
    /// Device id the routine is published under.
    pub id: String,
    /// Identifier of the scene on the remote service.
    pub routine_id: String,
    pub name: String,
    pub state: State,
    /// Successful executions since the bridge was published.
    pub executions: u64,
}

pub struct Enumerate;

impl IntoRequest for Enumerate {
    type Response = EnumerateResponse;

    fn into_request(self) -> Request {
        Request::Enumerate
    }
}

pub struct Trigger {
    pub id: String,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub enum TriggerResponse {
    Executed,
    Failed { reason: String },
    Absent,
}

impl IntoRequest for Trigger {
    type Response = TriggerResponse;

    fn into_request(self) -> Request {
        Request::Trigger { id: self.id }
    }
}

#[derive(Deserialize, Serialize, Debug)]
pub struct CheckAuthResponse;

pub struct CheckAuth;

impl IntoRequest for CheckAuth {
    type Response = CheckAuthResponse;

    fn into_request(self) -> Request {
        Request::CheckAuth
    }
}

pub trait IntoRequest {
    type Response: for<'de> Deserialize<'de>;

    fn into_request(self) -> Request;
}

/// Sends `request` to the operator API served at `base` (e.g. `http://127.0.0.1:8080`).
pub async fn request<T: IntoRequest>(
    base: &str,
    key: &str,
    request: T,
) -> Result<T::Response, surf::Error> {
    surf::post(format!("{}/api/{}", base.trim_end_matches('/'), key))
        .body(surf::Body::from_json(&request.into_request())?)
        .recv_json()
        .await
}
