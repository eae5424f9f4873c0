use http::Uri;
use serde::{Deserialize, Serialize};
use std::{convert::TryFrom, sync::Arc};
use tracing::{debug, info, warn};
use warp::{filters::BoxedFilter, http::StatusCode, Filter, Reply};

use crate::Credential;

#[derive(Deserialize, Debug)]
struct TokenQuery {
    client_id: String,
    client_secret: String,
    grant_type: Option<String>,
    code: Option<String>,
    redirect_uri: Option<String>,
    refresh_token: Option<String>,
}

#[derive(Serialize)]
struct TokenResponse {
    token_type: String,
    access_token: String,
    refresh_token: String,
    expires_in: u32,
}

#[derive(Serialize)]
struct TokenError {
    error: &'static str,
}

#[derive(Deserialize, Debug)]
struct OauthQuery {
    client_id: String,
    redirect_uri: String,
    state: String,
    response_type: String,
    user_locale: Option<String>,
    scope: Option<String>,
}

/// Account-linking credentials. Codes and tokens are minted once per process.
pub struct Linking {
    client_id: String,
    client_secret: Credential,
    authorization_code: String,
    access_token: String,
    refresh_token: String,
}

impl Linking {
    pub fn new<T: Into<String>>(client_id: T, client_secret: Credential) -> Self {
        Linking {
            client_id: client_id.into(),
            client_secret,
            authorization_code: uuid::Uuid::new_v4().to_string(),
            access_token: uuid::Uuid::new_v4().to_string(),
            refresh_token: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Checks an `Authorization` header against the issued access token.
    pub fn authorizes(&self, header: Option<&str>) -> bool {
        header
            .and_then(|header| header.strip_prefix("Bearer "))
            .map_or(false, |token| token == self.access_token)
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    fn exchange(&self, query: &TokenQuery) -> Result<TokenResponse, &'static str> {
        if query.client_id != self.client_id || query.client_secret != self.client_secret.expose()
        {
            return Err("invalid_client");
        }
        let granted = match query.grant_type.as_deref() {
            Some("refresh_token") => {
                query.refresh_token.as_deref() == Some(self.refresh_token.as_str())
            }
            _ => query.code.as_deref() == Some(self.authorization_code.as_str()),
        };
        if !granted {
            return Err("invalid_grant");
        }
        Ok(TokenResponse {
            token_type: "Bearer".to_owned(),
            access_token: self.access_token.clone(),
            refresh_token: self.refresh_token.clone(),
            expires_in: 3600,
        })
    }
}

pub fn auth(linking: Arc<Linking>) -> BoxedFilter<(impl Reply,)> {
    let auth = warp::path("auth");
    let auth_init = auth
        .and(warp::path("auth"))
        .and(warp::get())
        .and(warp::query())
        .map({
            let linking = linking.clone();
            move |query: OauthQuery| {
                debug!(
                    response_type = %query.response_type,
                    locale = ?query.user_locale,
                    scope = ?query.scope,
                    "authorization requested"
                );
                if query.client_id != linking.client_id {
                    warn!(client_id = %query.client_id, "authorization for unknown client");
                    return StatusCode::FORBIDDEN.into_response();
                }
                match Uri::try_from(format!(
                    "{}?code={}&state={}",
                    query.redirect_uri, linking.authorization_code, query.state
                )) {
                    Ok(uri) => {
                        info!("account linking authorized");
                        warp::redirect::found(uri).into_response()
                    }
                    Err(_) => StatusCode::BAD_REQUEST.into_response(),
                }
            }
        });
    let auth_token = auth
        .and(warp::path("token"))
        .and(warp::post())
        .and(warp::body::form())
        .map(move |query: TokenQuery| {
            debug!(
                grant_type = ?query.grant_type,
                redirect_uri = ?query.redirect_uri,
                "token requested"
            );
            match linking.exchange(&query) {
                Ok(response) => warp::reply::json(&response).into_response(),
                Err(error) => {
                    warn!(error, "token request rejected");
                    let status = if error == "invalid_client" {
                        StatusCode::UNAUTHORIZED
                    } else {
                        StatusCode::BAD_REQUEST
                    };
                    warp::reply::with_status(warp::reply::json(&TokenError { error }), status)
                        .into_response()
                }
            }
        });
    let auth = auth_init.or(auth_token);
    auth.boxed()
}
