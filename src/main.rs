use std::{error::Error, sync::Arc, time::Duration};

use async_compat::Compat;
use routines::{
    config::{Config, Mode},
    discover, App, HomeGraph, Linking, SharedService, SmartThings,
};
use smol::{block_on, lock::RwLock, Timer};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use warp::Filter;

fn main() -> Result<(), Box<dyn Error>> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "routines.toml".to_string());
    let config = Config::load(&path)?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&config.logging.filter))
        .init();
    info!(config = %path, "routines starting");

    let service: SharedService = Arc::new(SmartThings::new(
        config.base_url()?,
        config.credential()?,
    ));
    let mut app = App::new(config.name()?, service.clone())
        .with_publish(config.publish.strategy)
        .with_input_source(config.publish.input_source)
        .with_agent_user_id(config.linking.agent_user_id.clone());
    if let (Some(home_graph), Some(url)) = (&config.home_graph, config.home_graph_url()) {
        app = app.with_home_graph(HomeGraph::new(
            url?,
            home_graph.token.clone(),
            config.linking.agent_user_id.clone(),
        ));
    }
    let app = Arc::new(RwLock::new(app));
    let linking = Arc::new(Linking::new(
        config.linking.client_id.clone(),
        config.linking.client_secret.clone(),
    ));
    let addr = config.bind_addr()?;

    block_on(async move {
        match config.smartthings.mode {
            Mode::Single => {
                app.write().await.push_routine(config.routine()?);
            }
            Mode::Discovery => {
                let icon = config.smartthings.icon.clone();
                let refresh = config.smartthings.refresh_secs;
                smol::spawn({
                    let app = app.clone();
                    async move {
                        loop {
                            match discover(&*service, &icon).await {
                                Ok(routines) => app.write().await.replace_routines(routines),
                                Err(e) => error!(error = %e, "discovery failed"),
                            }
                            if refresh == 0 {
                                break;
                            }
                            Timer::after(Duration::from_secs(refresh)).await;
                        }
                    }
                })
                .detach();
            }
        }

        let routes = routines::fulfillment(app.clone(), linking.clone())
            .or(routines::auth(linking))
            .or(routines::api(app, config.linking.api_key.clone()))
            .with(warp::trace::request());

        info!(%addr, "listening");
        smol::spawn(Compat::new(warp::serve(routes).run(addr))).await;
        Ok::<(), Box<dyn Error>>(())
    })
}
