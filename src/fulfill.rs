use std::{collections::HashMap, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use smol::lock::RwLock;
use tracing::{debug, warn};
use warp::{filters::BoxedFilter, http::StatusCode, Filter, Reply};

use crate::{App, Error, Linking, ToggleState};

const DEVICE_TYPE: &str = "action.devices.types.TV";
const ON_OFF: &str = "action.devices.traits.OnOff";
const INPUT_SELECTOR: &str = "action.devices.traits.InputSelector";
const INPUT_KEY: &str = "routine";

#[derive(Deserialize, Debug)]
struct Input {
    intent: String,
    payload: Option<IntentPayload>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum IntentPayload {
    Execute { commands: Vec<Command> },
    Query { devices: Vec<CommandDevice> },
    Other(Value),
}

#[derive(Debug, Deserialize)]
struct CommandDevice {
    id: String,
}

#[derive(Debug, Deserialize)]
struct Command {
    devices: Vec<CommandDevice>,
    execution: Vec<CommandCommand>,
}

#[derive(Debug, Deserialize)]
struct CommandCommand {
    command: String,
    #[serde(default)]
    params: Value,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct FulfillmentRequest {
    request_id: String,
    inputs: Vec<Input>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct FulfillmentResponse {
    request_id: String,
    payload: Option<Payload>,
}

#[derive(Serialize, Debug)]
#[serde(untagged)]
enum Payload {
    Sync {
        #[serde(rename = "agentUserId")]
        agent_user_id: String,
        devices: Vec<Device>,
    },
    Query {
        devices: HashMap<String, QueryDevice>,
    },
    Execute {
        commands: Vec<ExecCommand>,
    },
    Disconnect {},
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum Status {
    Success,
    Error,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ExecCommand {
    ids: Vec<String>,
    status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    states: Option<DeviceStates>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_code: Option<&'static str>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct DeviceStates {
    online: bool,
    on: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    current_input: Option<&'static str>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct QueryDevice {
    status: Status,
    #[serde(flatten)]
    states: Option<DeviceStates>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_code: Option<&'static str>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct Device {
    id: String,
    #[serde(rename = "type")]
    ty: String,
    traits: Vec<String>,
    name: Name,
    will_report_state: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    room_hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    attributes: Option<Value>,
    custom_data: Value,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct Name {
    name: String,
    default_names: Vec<String>,
}

fn states(input_source: bool, state: ToggleState) -> DeviceStates {
    DeviceStates {
        online: true,
        on: state == ToggleState::Active,
        current_input: if input_source {
            Some(INPUT_KEY)
        } else {
            None
        },
    }
}

fn sync(app: &App) -> Payload {
    let mut traits = vec![ON_OFF.to_owned()];
    let mut attributes = None;
    if app.input_source() {
        traits.push(INPUT_SELECTOR.to_owned());
        attributes = Some(json!({
            "availableInputs": [{
                "key": INPUT_KEY,
                "names": [{ "lang": "en", "name_synonym": ["Routine"] }],
            }],
            "orderedInputs": false,
        }));
    }
    let room_hint = match app.publish() {
        crate::Publish::Bridged => Some(app.name().to_owned()),
        crate::Publish::External => None,
    };
    Payload::Sync {
        agent_user_id: app.agent_user_id().to_owned(),
        devices: app
            .bridges()
            .map(|bridge| Device {
                id: bridge.id().to_owned(),
                ty: DEVICE_TYPE.into(),
                traits: traits.clone(),
                name: Name {
                    name: bridge.name().to_owned(),
                    default_names: vec![bridge.routine().id().to_owned()],
                },
                will_report_state: app.reports_state(),
                room_hint: room_hint.clone(),
                attributes: attributes.clone(),
                custom_data: json!({ "routineId": bridge.routine().id() }),
            })
            .collect(),
    }
}

fn query(app: &App, devices: &[CommandDevice]) -> Payload {
    Payload::Query {
        devices: devices
            .iter()
            .map(|device| {
                let entry = match app.get_state(&device.id) {
                    Ok(state) => QueryDevice {
                        status: Status::Success,
                        states: Some(states(app.input_source(), state)),
                        error_code: None,
                    },
                    Err(_) => QueryDevice {
                        status: Status::Error,
                        states: None,
                        error_code: Some("deviceNotFound"),
                    },
                };
                (device.id.clone(), entry)
            })
            .collect(),
    }
}

// Each command takes the app lock only long enough to resolve the device.
async fn execute_one(app: &RwLock<App>, id: &str, execution: &[CommandCommand]) -> ExecCommand {
    let input_source = app.read().await.input_source();
    let mut outcome = Ok(());
    for command in execution {
        debug!(device = id, command = %command.command, "execute");
        let result = match command.command.as_str() {
            "action.devices.commands.OnOff" => {
                match command.params.get("on").and_then(Value::as_bool) {
                    Some(on) => {
                        let press = app.read().await.set_state(id, on.into());
                        press.await.map_err(|e| match e {
                            Error::Absent => "deviceNotFound",
                            _ => "transientError",
                        })
                    }
                    None => Err("protocolError"),
                }
            }
            "action.devices.commands.SetInput" if input_source => app
                .read()
                .await
                .get_state(id)
                .map(|_| ())
                .map_err(|_| "deviceNotFound"),
            _ => Err("functionNotSupported"),
        };
        if let Err(code) = result {
            outcome = Err(code);
            break;
        }
    }
    match outcome {
        Ok(()) => ExecCommand {
            ids: vec![id.to_owned()],
            status: Status::Success,
            states: Some(states(input_source, ToggleState::Inactive)),
            error_code: None,
        },
        Err(code) => ExecCommand {
            ids: vec![id.to_owned()],
            status: Status::Error,
            states: None,
            error_code: Some(code),
        },
    }
}

pub async fn fulfill(request: FulfillmentRequest, app: &RwLock<App>) -> FulfillmentResponse {
    let mut payload = None;
    for input in &request.inputs {
        if input.intent == "action.devices.SYNC" {
            payload = Some(sync(&*app.read().await));
            break;
        } else if input.intent == "action.devices.EXECUTE" {
            let mut exec_commands = vec![];
            if let Some(IntentPayload::Execute { commands }) = &input.payload {
                for command in commands {
                    for device in &command.devices {
                        exec_commands.push(execute_one(app, &device.id, &command.execution).await);
                    }
                }
            }
            payload = Some(Payload::Execute {
                commands: exec_commands,
            });
            break;
        } else if input.intent == "action.devices.QUERY" {
            if let Some(IntentPayload::Query { devices }) = &input.payload {
                payload = Some(query(&*app.read().await, devices));
            }
            break;
        } else if input.intent == "action.devices.DISCONNECT" {
            payload = Some(Payload::Disconnect {});
            break;
        } else {
            warn!(intent = %input.intent, "unsupported intent");
        }
    }
    FulfillmentResponse {
        request_id: request.request_id,
        payload,
    }
}

/// `POST /fulfill`, guarded by the linked access token.
pub fn fulfillment(app: Arc<RwLock<App>>, linking: Arc<Linking>) -> BoxedFilter<(impl Reply,)> {
    warp::path("fulfill")
        .and(warp::post())
        .and(warp::header::optional::<String>("authorization"))
        .and(warp::body::json())
        .and_then(move |authorization: Option<String>, request: FulfillmentRequest| {
            let app = app.clone();
            let linking = linking.clone();
            async move {
                if !linking.authorizes(authorization.as_deref()) {
                    warn!("fulfillment request with bad credentials");
                    return Ok::<_, core::convert::Infallible>(
                        warp::reply::with_status(
                            warp::reply::json(&json!({ "error": "unauthorized" })),
                            StatusCode::UNAUTHORIZED,
                        )
                        .into_response(),
                    );
                }
                let response = fulfill(request, &app).await;
                Ok(warp::reply::json(&response).into_response())
            }
        })
        .boxed()
}
