use std::{
    collections::HashMap,
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use futures::future::BoxFuture;
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

mod auth;
pub use auth::{auth, Linking};
pub mod config;
mod fulfill;
pub use fulfill::{fulfill, fulfillment, FulfillmentRequest, FulfillmentResponse};
mod request_sync;
pub use request_sync::HomeGraph;
mod api;
pub use api::api;
mod util;
use util::format_list;

mod integrations;
pub use integrations::smartthings::{discover, Scene, SmartThings};

/// Reported power state of a momentary switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleState {
    Active,
    Inactive,
}

impl From<bool> for ToggleState {
    fn from(data: bool) -> Self {
        match data {
            true => ToggleState::Active,
            false => ToggleState::Inactive,
        }
    }
}

/// A scene on the remote automation service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutineRef {
    id: String,
    display_name: String,
}

impl RoutineRef {
    pub fn new<T: Into<String>>(id: T) -> Self {
        let id = id.into();
        RoutineRef {
            display_name: id.clone(),
            id,
        }
    }

    pub fn with_name<T: Into<String>, U: Into<String>>(id: T, display_name: U) -> Self {
        RoutineRef {
            id: id.into(),
            display_name: display_name.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }
}

/// Bearer token for outbound calls. Never printed.
#[derive(Clone, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    pub fn new<T: Into<String>>(token: T) -> Self {
        Credential(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.0)
    }

    pub(crate) fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("transport error: {0}")]
    Transport(surf::Error),
    #[error("remote returned status {0}")]
    Status(u16),
    #[error("malformed response: {0}")]
    Decode(surf::Error),
    #[error("invalid endpoint: {0}")]
    Url(String),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("missing required configuration field `{0}`")]
    ConfigMissing(&'static str),
    #[error("remote action failed: {0}")]
    RemoteActionFailed(#[source] RemoteError),
    #[error("scene listing failed: {0}")]
    RemoteFetchFailed(#[source] RemoteError),
    #[error("nonexistent device accessed")]
    Absent,
}

/// The remote automation service as seen by a bridge.
pub trait SceneService {
    fn execute<'a>(&'a self, routine_id: &'a str) -> BoxFuture<'a, Result<(), RemoteError>>;

    fn scenes<'a>(&'a self) -> BoxFuture<'a, Result<Vec<Scene>, RemoteError>>;
}

impl<T: SceneService + ?Sized> SceneService for Arc<T> {
    fn execute<'a>(&'a self, routine_id: &'a str) -> BoxFuture<'a, Result<(), RemoteError>> {
        T::execute(self, routine_id)
    }

    fn scenes<'a>(&'a self) -> BoxFuture<'a, Result<Vec<Scene>, RemoteError>> {
        T::scenes(self)
    }
}

pub type SharedService = Arc<dyn SceneService + Send + Sync>;

/// Stable device id for a routine, so the host keeps the same device across restarts.
pub fn device_id(routine_id: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, routine_id.as_bytes()).to_string()
}

/// Momentary power switch that runs one routine per press and always reads back as off.
pub struct ToggleBridge {
    id: String,
    routine: RoutineRef,
    service: SharedService,
    executions: AtomicU64,
}

impl ToggleBridge {
    pub fn new(routine: RoutineRef, service: SharedService) -> Self {
        ToggleBridge {
            id: device_id(routine.id()),
            routine,
            service,
            executions: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        self.routine.display_name()
    }

    pub fn routine(&self) -> &RoutineRef {
        &self.routine
    }

    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::SeqCst)
    }

    /// The switch never holds `Active` past the set call that requested it.
    pub fn get_state(&self) -> ToggleState {
        ToggleState::Inactive
    }

    /// Runs the routine when `requested` is `Active`. Each call issues its own
    /// request; concurrent presses are not coalesced.
    pub async fn set_state(&self, requested: ToggleState) -> Result<(), Error> {
        if requested == ToggleState::Inactive {
            return Ok(());
        }
        match self.service.execute(self.routine.id()).await {
            Ok(()) => {
                self.executions.fetch_add(1, Ordering::SeqCst);
                info!(routine = self.name(), "routine executed");
                Ok(())
            }
            Err(e) => {
                warn!(routine = self.name(), error = %e, "routine execution failed");
                Err(Error::RemoteActionFailed(e))
            }
        }
    }
}

/// How published devices reach the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Publish {
    /// Every routine is its own top-level device, announced to the host as soon as it is published.
    External,
    /// Routines sit behind the bridge and show up on the host's next sync.
    Bridged,
}

impl Default for Publish {
    fn default() -> Self {
        Publish::External
    }
}

#[derive(Hash, PartialEq, Eq, Clone)]
struct Id(String);

pub struct App {
    by_id: HashMap<Id, Arc<ToggleBridge>>,
    name: String,
    agent_user_id: String,
    service: SharedService,
    publish: Publish,
    input_source: bool,
    home_graph: Option<Arc<HomeGraph>>,
}

impl App {
    pub fn new<T: Into<String>>(name: T, service: SharedService) -> App {
        App {
            by_id: HashMap::new(),
            name: name.into(),
            agent_user_id: "routines".to_owned(),
            service,
            publish: Publish::default(),
            input_source: false,
            home_graph: None,
        }
    }

    pub fn with_publish(mut self, publish: Publish) -> Self {
        self.publish = publish;
        self
    }

    pub fn with_input_source(mut self, input_source: bool) -> Self {
        self.input_source = input_source;
        self
    }

    pub fn with_agent_user_id<T: Into<String>>(mut self, agent_user_id: T) -> Self {
        self.agent_user_id = agent_user_id.into();
        self
    }

    pub fn with_home_graph(mut self, home_graph: HomeGraph) -> Self {
        self.home_graph = Some(Arc::new(home_graph));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn agent_user_id(&self) -> &str {
        &self.agent_user_id
    }

    pub fn publish(&self) -> Publish {
        self.publish
    }

    pub fn input_source(&self) -> bool {
        self.input_source
    }

    pub fn reports_state(&self) -> bool {
        self.home_graph.is_some()
    }

    pub fn push_routine(&mut self, routine: RoutineRef) {
        self.push_routines(Some(routine));
    }

    pub fn push_routines<I: IntoIterator<Item = RoutineRef>>(&mut self, routines: I) {
        let mut names = vec![];
        for routine in routines {
            let bridge = Arc::new(ToggleBridge::new(routine, self.service.clone()));
            names.push(bridge.name().to_owned());
            self.by_id.insert(Id(bridge.id().to_owned()), bridge);
        }
        if names.is_empty() {
            return;
        }
        info!("published {}", format_list(&names));
        self.announce();
    }

    /// Swaps the published set for `routines`, keeping bridges (and their counters)
    /// for routines that are still present.
    pub fn replace_routines<I: IntoIterator<Item = RoutineRef>>(&mut self, routines: I) {
        let mut by_id = HashMap::new();
        let mut changed = false;
        for routine in routines {
            let id = Id(device_id(routine.id()));
            if by_id.contains_key(&id) {
                continue;
            }
            let bridge = match self.by_id.remove(&id) {
                Some(bridge) if bridge.routine() == &routine => bridge,
                _ => {
                    changed = true;
                    Arc::new(ToggleBridge::new(routine, self.service.clone()))
                }
            };
            by_id.insert(id, bridge);
        }
        changed |= !self.by_id.is_empty();
        self.by_id = by_id;
        if changed {
            let names = self.bridges().map(ToggleBridge::name).collect::<Vec<_>>();
            if names.is_empty() {
                info!("no routines published");
            } else {
                info!("published {}", format_list(names));
            }
            self.announce();
        }
    }

    fn announce(&self) {
        if self.publish != Publish::External {
            return;
        }
        if let Some(home_graph) = self.home_graph.clone() {
            smol::spawn(async move {
                if let Err(e) = home_graph.request_sync().await {
                    warn!(error = %e, "sync request failed");
                }
            })
            .detach();
        }
    }

    pub fn bridges(&self) -> impl ExactSizeIterator<Item = &ToggleBridge> {
        self.by_id.values().map(|bridge| bridge.as_ref())
    }

    pub fn bridge(&self, id: &str) -> Option<Arc<ToggleBridge>> {
        self.by_id.get(&Id(id.into())).cloned()
    }

    pub fn get_state(&self, id: &str) -> Result<ToggleState, Error> {
        let bridge = self.by_id.get(&Id(id.into())).ok_or(Error::Absent)?;
        Ok(bridge.get_state())
    }

    /// Resolves `id` for a set command. The returned future owns the bridge, so
    /// the caller can release its lock on the app before the remote call runs.
    /// Presses are followed by a report telling the host the switch is off again.
    pub fn set_state(
        &self,
        id: &str,
        state: ToggleState,
    ) -> impl Future<Output = Result<(), Error>> + Send + 'static {
        let bridge = self.bridge(id);
        let home_graph = self.home_graph.clone();
        async move {
            let bridge = bridge.ok_or(Error::Absent)?;
            let result = bridge.set_state(state).await;
            if state == ToggleState::Active {
                if let Some(home_graph) = home_graph {
                    if let Err(e) = home_graph.report_state(bridge.id(), bridge.get_state()).await {
                        warn!(device = bridge.id(), error = %e, "state report failed");
                    }
                }
            }
            result
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{
        sync::{Arc, Mutex},
        time::{Duration, Instant},
    };

    use async_compat::Compat;
    use futures::future::BoxFuture;
    use smol::{channel::Receiver, Timer};
    use surf::Url;
    use warp::Filter;

    use crate::{RemoteError, Scene, SceneService};

    /// Records every execute call and answers with a fixed outcome.
    #[derive(Default)]
    pub struct RecordingService {
        pub executed: Mutex<Vec<String>>,
        pub fail_with: Option<u16>,
        pub scenes: Vec<Scene>,
        pub fetch_fails: bool,
        /// When set, each execute waits for a message after recording itself.
        pub gate: Option<Receiver<()>>,
    }

    impl RecordingService {
        pub fn failing(status: u16) -> Self {
            RecordingService {
                fail_with: Some(status),
                ..Default::default()
            }
        }

        pub fn executed(&self) -> Vec<String> {
            self.executed.lock().unwrap().clone()
        }
    }

    impl SceneService for RecordingService {
        fn execute<'a>(&'a self, routine_id: &'a str) -> BoxFuture<'a, Result<(), RemoteError>> {
            Box::pin(async move {
                smol::future::yield_now().await;
                self.executed.lock().unwrap().push(routine_id.to_owned());
                if let Some(gate) = &self.gate {
                    let _ = gate.recv().await;
                }
                match self.fail_with {
                    Some(status) => Err(RemoteError::Status(status)),
                    None => Ok(()),
                }
            })
        }

        fn scenes<'a>(&'a self) -> BoxFuture<'a, Result<Vec<Scene>, RemoteError>> {
            Box::pin(async move {
                if self.fetch_fails {
                    Err(RemoteError::Status(503))
                } else {
                    Ok(self.scenes.clone())
                }
            })
        }
    }

    /// Method, path, authorization header and body of each request seen.
    pub type Hits = Arc<Mutex<Vec<(String, String, Option<String>, String)>>>;

    /// Serves every request with `status` and `reply` on an ephemeral port.
    /// Must be called with a tokio context entered (inside `Compat`).
    pub fn serve(status: u16, reply: &'static str) -> (Url, Hits) {
        let hits: Hits = Arc::new(Mutex::new(vec![]));
        let route = warp::method()
            .and(warp::path::full())
            .and(warp::header::optional::<String>("authorization"))
            .and(warp::body::bytes())
            .map({
                let hits = hits.clone();
                move |method: warp::http::Method,
                      path: warp::path::FullPath,
                      auth: Option<String>,
                      body: warp::hyper::body::Bytes| {
                    hits.lock().unwrap().push((
                        method.to_string(),
                        path.as_str().to_owned(),
                        auth,
                        String::from_utf8_lossy(&body).into_owned(),
                    ));
                    warp::reply::with_status(
                        warp::reply::with_header(reply, "content-type", "application/json"),
                        warp::http::StatusCode::from_u16(status).unwrap(),
                    )
                }
            });
        let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        smol::spawn(Compat::new(server)).detach();
        (Url::parse(&format!("http://{}/", addr)).unwrap(), hits)
    }

    /// Waits until `hits` holds at least `count` requests, giving up after two seconds.
    pub async fn wait_for(hits: &Hits, count: usize) -> usize {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let seen = hits.lock().unwrap().len();
            if seen >= count || Instant::now() >= deadline {
                return seen;
            }
            Timer::after(Duration::from_millis(10)).await;
        }
    }
}
