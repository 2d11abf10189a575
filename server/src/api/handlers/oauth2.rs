//! OAuth2/OIDC protocol endpoints: token, authorize, UserInfo, and
//! introspection.

use actix_web::http::header;
use actix_web::{web, HttpRequest, HttpResponse};
use shared::errors::ServiceError;
use url::Url;

use crate::api::correlation::trace_id;
use crate::api::dto::{AuthorizeQuery, IntrospectForm, TokenForm};
use crate::service::client_auth::extract_credentials;
use crate::service::token_service::{AuthorizationGrant, TokenRequest};
use crate::AppState;

fn authorization_header(req: &HttpRequest) -> Option<&str> {
    req.headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
}

/// `POST /oauth2/token` (form-urlencoded)
///
/// Client authentication runs first (see the client-auth decision table); the
/// authenticated application is then handed to the grant dispatcher.
pub async fn token(
    req: HttpRequest,
    state: web::Data<AppState>,
    form: web::Form<TokenForm>,
) -> Result<HttpResponse, ServiceError> {
    let form = form.into_inner();
    let trace = trace_id(&req);

    let credentials = extract_credentials(
        authorization_header(&req),
        form.client_id.as_deref(),
        form.client_secret.as_deref(),
    )?;
    let app = state.client_auth.authenticate(credentials, &trace).await?;

    let response = state
        .token_service
        .handle_token_request(
            &app,
            TokenRequest {
                grant_type: form.grant_type,
                code: form.code,
                redirect_uri: form.redirect_uri,
                code_verifier: form.code_verifier,
                refresh_token: form.refresh_token,
                scope: form.scope,
                assertion: form.assertion,
            },
            &trace,
        )
        .await?;
    Ok(HttpResponse::Ok()
        .insert_header((header::CACHE_CONTROL, "no-store"))
        .json(response))
}

/// `GET /oauth2/authorize`
///
/// Without an assertion: validates the request and redirects the browser to
/// the gate client's login page, which drives `/flow/execute`. With an
/// assertion (a completed flow): mints the bound authorization code and
/// redirects back to the client's `redirect_uri`.
pub async fn authorize(
    state: web::Data<AppState>,
    query: web::Query<AuthorizeQuery>,
) -> Result<HttpResponse, ServiceError> {
    let query = query.into_inner();

    if query.response_type != "code" {
        return Err(ServiceError::invalid_request(
            "only the code response_type is supported",
        ));
    }
    let app = state
        .applications
        .get_by_client_id(&query.client_id)
        .await?
        .ok_or_else(|| ServiceError::invalid_client("unknown client"))?;
    if !app.allows_redirect_uri(&query.redirect_uri) {
        return Err(ServiceError::invalid_request("redirect_uri is not registered"));
    }

    if let Some(assertion) = &query.assertion {
        let code = state
            .token_service
            .complete_authorization(
                assertion,
                AuthorizationGrant {
                    client_id: query.client_id.clone(),
                    redirect_uri: query.redirect_uri.clone(),
                    scope: query.scope.clone().unwrap_or_default(),
                    code_challenge: query.code_challenge.clone(),
                    code_challenge_method: query.code_challenge_method.clone(),
                    nonce: query.nonce.clone(),
                },
            )
            .await?;

        let mut location = Url::parse(&query.redirect_uri)
            .map_err(|_| ServiceError::invalid_request("redirect_uri is not a valid URL"))?;
        location.query_pairs_mut().append_pair("code", &code);
        if let Some(state_param) = &query.state {
            location.query_pairs_mut().append_pair("state", state_param);
        }
        return Ok(HttpResponse::Found()
            .insert_header((header::LOCATION, location.to_string()))
            .finish());
    }

    // Hand the browser to the hosted login client.
    let mut login = Url::parse(&state.gate_client.login_url())
        .map_err(|e| ServiceError::server("SRV-1007", format!("bad gate client config: {}", e)))?;
    {
        let mut pairs = login.query_pairs_mut();
        pairs
            .append_pair("client_id", &query.client_id)
            .append_pair("redirect_uri", &query.redirect_uri)
            .append_pair("response_type", "code");
        if let Some(scope) = &query.scope {
            pairs.append_pair("scope", scope);
        }
        if let Some(state_param) = &query.state {
            pairs.append_pair("state", state_param);
        }
        if let Some(nonce) = &query.nonce {
            pairs.append_pair("nonce", nonce);
        }
        if let Some(challenge) = &query.code_challenge {
            pairs.append_pair("code_challenge", challenge);
        }
        if let Some(method) = &query.code_challenge_method {
            pairs.append_pair("code_challenge_method", method);
        }
    }
    Ok(HttpResponse::Found()
        .insert_header((header::LOCATION, login.to_string()))
        .finish())
}

/// `GET /oauth2/userinfo`
pub async fn userinfo(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ServiceError> {
    let bearer = authorization_header(&req)
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or_else(|| ServiceError::invalid_token("missing bearer token"))?;
    let body = state.token_service.userinfo(bearer).await?;
    Ok(HttpResponse::Ok().json(body))
}

/// `POST /oauth2/introspect` (form-urlencoded)
pub async fn introspect(
    req: HttpRequest,
    state: web::Data<AppState>,
    form: web::Form<IntrospectForm>,
) -> Result<HttpResponse, ServiceError> {
    let form = form.into_inner();
    let trace = trace_id(&req);

    // The caller must be a registered client; an unauthenticated party
    // learns nothing about token validity.
    let credentials = extract_credentials(
        authorization_header(&req),
        form.client_id.as_deref(),
        form.client_secret.as_deref(),
    )?;
    state.client_auth.authenticate(credentials, &trace).await?;

    let response = state.token_service.introspect(&form.token).await;
    Ok(HttpResponse::Ok().json(response))
}
