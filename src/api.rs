use std::sync::Arc;

use routines_api::{Request, Routine, State, TriggerResponse};
use smol::lock::RwLock;
use tracing::{info, warn};
use warp::{filters::BoxedFilter, Filter, Reply};

use crate::{App, Credential, Error, ToggleState};

impl From<ToggleState> for State {
    fn from(state: ToggleState) -> Self {
        match state {
            ToggleState::Active => State::Active,
            ToggleState::Inactive => State::Inactive,
        }
    }
}

async fn handle(request: Request, app: &RwLock<App>) -> warp::reply::Json {
    match request {
        Request::Enumerate => {
            let mut routines = app
                .read()
                .await
                .bridges()
                .map(|bridge| Routine {
                    id: bridge.id().to_owned(),
                    routine_id: bridge.routine().id().to_owned(),
                    name: bridge.name().to_owned(),
                    state: bridge.get_state().into(),
                    executions: bridge.executions(),
                })
                .collect::<Vec<_>>();
            routines.sort_by(|a, b| a.name.cmp(&b.name));
            warp::reply::json(&routines_api::EnumerateResponse { routines })
        }
        Request::CheckAuth => warp::reply::json(&routines_api::CheckAuthResponse),
        Request::Trigger { id } => {
            info!(device = %id, "manual trigger");
            let press = app.read().await.set_state(&id, ToggleState::Active);
            let response = match press.await {
                Ok(()) => TriggerResponse::Executed,
                Err(Error::Absent) => TriggerResponse::Absent,
                Err(e) => TriggerResponse::Failed {
                    reason: e.to_string(),
                },
            };
            warp::reply::json(&response)
        }
    }
}

pub fn api(app: Arc<RwLock<App>>, key: Credential) -> BoxedFilter<(impl Reply,)> {
    let api = warp::path!("api" / String)
        .and(warp::post())
        .and(warp::body::json())
        .and_then(move |token: String, request: Request| {
            let app = app.clone();
            let key = key.clone();
            async move {
                Ok::<_, core::convert::Infallible>(if token == key.expose() {
                    handle(request, &app).await
                } else {
                    warn!("operator request with bad key");
                    warp::reply::json(&"bad auth")
                })
            }
        });
    api.boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{device_id, testing::RecordingService, RoutineRef};
    use async_compat::Compat;
    use routines_api::{EnumerateResponse, IntoRequest, Trigger};
    use smol::block_on;

    fn filter(service: Arc<RecordingService>) -> BoxedFilter<(impl Reply,)> {
        let mut app = App::new("Bridge", service);
        app.push_routines(vec![
            RoutineRef::with_name("xyz", "Movie Night"),
            RoutineRef::with_name("abc", "Bedtime"),
        ]);
        api(Arc::new(RwLock::new(app)), Credential::new("key"))
    }

    fn call<F>(filter: &F, key: &str, request: Request) -> serde_json::Value
    where
        F: Filter + Clone + Send + Sync + 'static,
        F::Extract: Reply + Send,
    {
        let response = block_on(Compat::new(
            warp::test::request()
                .method("POST")
                .path(&format!("/api/{}", key))
                .json(&request)
                .reply(filter),
        ));
        serde_json::from_slice(response.body()).unwrap()
    }

    #[test]
    fn enumerate_lists_routines_sorted() {
        let filter = filter(Arc::new(RecordingService::default()));
        let body = call(&filter, "key", Request::Enumerate);
        let response: EnumerateResponse = serde_json::from_value(body).unwrap();
        let names = response
            .routines
            .iter()
            .map(|routine| routine.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["Bedtime", "Movie Night"]);
        assert!(response
            .routines
            .iter()
            .all(|routine| routine.state == State::Inactive));
    }

    #[test]
    fn trigger_runs_routine() {
        let service = Arc::new(RecordingService::default());
        let filter = filter(service.clone());
        let body = call(
            &filter,
            "key",
            Trigger {
                id: device_id("xyz"),
            }
            .into_request(),
        );
        assert_eq!(
            serde_json::from_value::<TriggerResponse>(body).unwrap(),
            TriggerResponse::Executed
        );
        assert_eq!(service.executed(), vec!["xyz".to_owned()]);

        let body = call(&filter, "key", Request::Enumerate);
        let response: EnumerateResponse = serde_json::from_value(body).unwrap();
        let movie = response
            .routines
            .iter()
            .find(|routine| routine.routine_id == "xyz")
            .unwrap();
        assert_eq!(movie.executions, 1);
    }

    #[test]
    fn trigger_reports_failure_and_absence() {
        let filter = filter(Arc::new(RecordingService::failing(500)));
        let body = call(
            &filter,
            "key",
            Request::Trigger {
                id: device_id("xyz"),
            },
        );
        assert!(matches!(
            serde_json::from_value::<TriggerResponse>(body).unwrap(),
            TriggerResponse::Failed { .. }
        ));
        let body = call(&filter, "key", Request::Trigger { id: "ghost".into() });
        assert_eq!(
            serde_json::from_value::<TriggerResponse>(body).unwrap(),
            TriggerResponse::Absent
        );
    }

    #[test]
    fn wrong_key_is_refused() {
        let service = Arc::new(RecordingService::default());
        let filter = filter(service.clone());
        let body = call(
            &filter,
            "nope",
            Request::Trigger {
                id: device_id("xyz"),
            },
        );
        assert_eq!(body, serde_json::json!("bad auth"));
        assert!(service.executed().is_empty());
    }
}
