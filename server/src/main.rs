//! # Thunder - Identity & Access Management Server
//!
//! Thunder authenticates end-users against configurable identity sources,
//! issues OAuth2/OIDC tokens to registered client applications, and runs
//! extensible multi-step authentication and registration flows driven by
//! graph definitions.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        HTTP Layer (api/)                         │
//! │   routes · handlers · DTOs · correlation-ID middleware · CORS    │
//! └──────────────┬──────────────────────────────┬────────────────────┘
//!                │                              │
//!                ▼                              ▼
//! ┌───────────────────────────┐   ┌─────────────────────────────────┐
//! │     Service Layer         │   │        Flow Subsystem           │
//! │ client-auth · tokens ·    │◀──│ graph model · engine ·          │
//! │ users · applications ·    │   │ executors (credentials, OTP,    │
//! │ notifications · claims    │   │ federation, provisioning, ...)  │
//! └──────────────┬────────────┘   └──────────────┬──────────────────┘
//!                │                               │
//!                ▼                               ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                   Repository Layer (repository/)                 │
//! │     identity · runtime · user datasources, dialected queries     │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every transition publishes a structured event on the observability bus
//! (console / file / OTLP subscribers). The MCP admin toolset exposes the
//! same management operations the HTTP handlers use.
//!
//! ## Startup Sequence
//!
//! 1. Load layered configuration (defaults ⊕ YAML ⊕ `THUNDER_*` env)
//! 2. Initialize structured logging
//! 3. Build the observability event bus and its subscribers
//! 4. Connect the identity / runtime / user datasources
//! 5. Load key material and construct the crypto services
//! 6. Wire repositories, services, executors, and the flow engine
//! 7. Seed flow-graph definitions and notification senders
//! 8. Serve HTTP until shutdown, then drain the bus and close the pools

use std::path::PathBuf;
use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Context;
use shared::config::{AppConfig, GateClientConfig};
use shared::crypto::{CredentialHasher, JwtService};
use shared::database::DataSources;
use shared::observability::{build_event_bus, EventBus};
use shared::tracing_config;
use shared::transaction::TransactionManager;
use tracing::{info, warn};

mod api;
mod domain;
mod flow;
mod mcp;
mod repository;
mod service;

use api::correlation::Correlation;
use api::routes;
use flow::engine::{AssertionIssuer, FlowContextStore, GraphProvider};
use flow::executors::assert::{AssertionService, AuthAssertExecutor};
use flow::executors::attribute::AttributeCollectorExecutor;
use flow::executors::authorize::AuthorizeExecutor;
use flow::executors::credentials::CredentialsExecutor;
use flow::executors::oidc::OidcExecutor;
use flow::executors::otp::OtpExecutor;
use flow::executors::provision::{ProvisionOuExecutor, ProvisionUserExecutor};
use flow::executors::ExecutorRegistry;
use flow::FlowEngine;
use mcp::ToolRegistry;
use repository::{
    ApplicationRepository, AuthorizationCodeRepository, FlowDefinitionRepository, OtpRepository,
    RefreshTokenRepository, SenderRepository, SqlFlowContextStore, UserRepository,
};
use service::token_service::{CodeStore, DefaultScopeValidator, RefreshTokenStore, SubjectSource};
use service::client_auth::ApplicationLookup;
use service::{
    ApplicationService, ClientAuthService, FlowDefinitionService, NotificationService,
    TokenService, UserService,
};

/// Shared application state injected into all request handlers.
pub struct AppState {
    pub applications: Arc<ApplicationService>,
    pub users: Arc<UserService>,
    pub flow_engine: Arc<FlowEngine>,
    pub token_service: Arc<TokenService>,
    pub client_auth: Arc<ClientAuthService<ApplicationService>>,
    pub notifications: Arc<NotificationService>,
    pub mcp_tools: Arc<ToolRegistry>,
    pub datasources: DataSources,
    pub bus: EventBus,
    pub gate_client: GateClientConfig,
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // ─────────────────────────────────────────────────────────────────────
    // Step 1: Configuration
    // ─────────────────────────────────────────────────────────────────────
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = AppConfig::load(config_path.as_deref()).context("failed to load configuration")?;

    // ─────────────────────────────────────────────────────────────────────
    // Step 2: Logging
    // ─────────────────────────────────────────────────────────────────────
    let json_logs = std::env::var("THUNDER_ENV").as_deref() == Ok("production");
    tracing_config::init_tracing(&config.server.identifier, json_logs);
    info!(
        identifier = %config.server.identifier,
        hostname = %config.server.hostname,
        port = config.server.port,
        "starting thunder"
    );

    // ─────────────────────────────────────────────────────────────────────
    // Step 3: Observability bus
    // ─────────────────────────────────────────────────────────────────────
    let bus = build_event_bus(&config.observability).context("failed to build event bus")?;

    // ─────────────────────────────────────────────────────────────────────
    // Step 4: Datasources
    // ─────────────────────────────────────────────────────────────────────
    let datasources = DataSources::connect(&config.database)
        .await
        .context("failed to connect datasources")?;
    let identity_tm = TransactionManager::new(datasources.identity.clone());
    let runtime_tm = TransactionManager::new(datasources.runtime.clone());
    let user_tm = TransactionManager::new(datasources.user.clone());

    // ─────────────────────────────────────────────────────────────────────
    // Step 5: Crypto
    // ─────────────────────────────────────────────────────────────────────
    let jwt = Arc::new(
        JwtService::from_config(&config.jwt, &config.security)
            .context("failed to load signing keys")?,
    );
    let hasher = Arc::new(CredentialHasher::new());
    let assertions = AssertionService::new(jwt.clone());
    let crypto_key = match std::fs::read_to_string(&config.security.crypto_file) {
        Ok(key) => key.trim().to_string(),
        Err(_) => {
            warn!("security.crypto_file not readable; using the JWT secret for at-rest encryption");
            config.jwt.secret.clone()
        }
    };

    // ─────────────────────────────────────────────────────────────────────
    // Step 6: Services, executors, flow engine
    // ─────────────────────────────────────────────────────────────────────
    let applications = Arc::new(ApplicationService::new(
        identity_tm.clone(),
        ApplicationRepository::new(datasources.identity_dialect),
        hasher.clone(),
        &config.cache,
        bus.clone(),
    ));
    let users = Arc::new(UserService::new(
        user_tm,
        UserRepository::new(datasources.user_dialect),
        hasher.clone(),
        bus.clone(),
    ));
    let client_auth = Arc::new(ClientAuthService::new(
        applications.clone(),
        hasher.clone(),
        bus.clone(),
    ));
    let notifications = Arc::new(NotificationService::new(
        reqwest::Client::new(),
        bus.clone(),
    ));

    let otp_store = Arc::new(OtpRepository::new(runtime_tm.clone(), datasources.runtime_dialect));
    let federation_http = reqwest::Client::new();

    let mut executors = ExecutorRegistry::new();
    executors.register(Arc::new(CredentialsExecutor::new(users.clone())));
    executors.register(Arc::new(OtpExecutor::sms(
        otp_store.clone(),
        notifications.clone(),
        users.clone(),
    )));
    executors.register(Arc::new(OtpExecutor::email(
        otp_store,
        notifications.clone(),
        users.clone(),
    )));
    executors.register(Arc::new(OidcExecutor::standard(
        federation_http.clone(),
        users.clone(),
    )));
    executors.register(Arc::new(OidcExecutor::google(
        federation_http.clone(),
        users.clone(),
    )));
    executors.register(Arc::new(OidcExecutor::github(federation_http, users.clone())));
    executors.register(Arc::new(AttributeCollectorExecutor));
    executors.register(Arc::new(ProvisionUserExecutor::new(users.clone())));
    executors.register(Arc::new(ProvisionOuExecutor::new(users.clone())));
    executors.register(Arc::new(AuthorizeExecutor::new(users.clone())));
    executors.register(Arc::new(AuthAssertExecutor::new(assertions.clone())));
    let executors = Arc::new(executors);

    let flow_definitions = Arc::new(FlowDefinitionService::new(
        identity_tm.clone(),
        FlowDefinitionRepository::new(datasources.identity_dialect),
        applications.clone(),
        executors.names(),
        config.flow.authn.default_flow.clone(),
        &config.cache,
    ));

    let sql_flow_store = Arc::new(SqlFlowContextStore::new(
        runtime_tm.clone(),
        datasources.runtime_dialect,
    ));
    let flow_store: Arc<dyn FlowContextStore> = sql_flow_store.clone();
    let flow_engine = Arc::new(FlowEngine::new(
        flow_definitions.clone() as Arc<dyn GraphProvider>,
        executors,
        flow_store.clone(),
        Arc::new(assertions.clone()) as Arc<dyn AssertionIssuer>,
        bus.clone(),
    ));

    let token_service = Arc::new(TokenService::new(
        jwt,
        assertions,
        Arc::new(AuthorizationCodeRepository::new(
            runtime_tm.clone(),
            datasources.runtime_dialect,
        )) as Arc<dyn CodeStore>,
        Arc::new(RefreshTokenRepository::new(runtime_tm.clone(), datasources.runtime_dialect))
            as Arc<dyn RefreshTokenStore>,
        flow_store,
        users.clone() as Arc<dyn SubjectSource>,
        applications.clone() as Arc<dyn ApplicationLookup>,
        Arc::new(DefaultScopeValidator),
        config.jwt.clone(),
        config.oauth.clone(),
        bus.clone(),
    ));

    // ─────────────────────────────────────────────────────────────────────
    // Step 7: Seeding
    // ─────────────────────────────────────────────────────────────────────
    flow_definitions
        .seed_from_directory(std::path::Path::new(&config.flow.graph_directory))
        .await
        .context("failed to seed flow definitions")?;

    let senders = SenderRepository::new(datasources.identity_dialect, crypto_key);
    let mut session = identity_tm.session();
    for sender in senders.list(&mut session).await.unwrap_or_default() {
        if let Err(e) = notifications.register_sender(sender) {
            warn!(error = %e, "skipping invalid notification sender");
        }
    }

    let mcp_tools = Arc::new(mcp::build_registry(
        applications.clone(),
        flow_definitions.clone(),
    ));

    // Periodic sweeper: abandoned flow contexts past the idle TTL, expired
    // refresh tokens, and unused per-flow locks.
    {
        let engine = flow_engine.clone();
        let contexts = sql_flow_store.clone();
        let tokens =
            RefreshTokenRepository::new(runtime_tm.clone(), datasources.runtime_dialect);
        let idle_ttl = chrono::Duration::seconds(config.cache.ttl.max(300) as i64 * 12);
        let interval = std::time::Duration::from_secs(config.cache.cleanup_interval.max(30));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let cutoff = chrono::Utc::now() - idle_ttl;
                if let Err(e) = contexts.delete_stale(cutoff).await {
                    warn!(error = %e, "flow-context sweep failed");
                }
                if let Err(e) = tokens.delete_expired(chrono::Utc::now()).await {
                    warn!(error = %e, "refresh-token sweep failed");
                }
                engine.prune_locks();
            }
        });
    }

    let state = web::Data::new(AppState {
        applications,
        users,
        flow_engine,
        token_service,
        client_auth,
        notifications,
        mcp_tools,
        datasources: datasources.clone(),
        bus: bus.clone(),
        gate_client: config.gate_client.clone(),
    });

    // ─────────────────────────────────────────────────────────────────────
    // Step 8: HTTP server
    // ─────────────────────────────────────────────────────────────────────
    let bind = (config.server.hostname.clone(), config.server.port);
    let allowed_origins = config.cors.allowed_origins.clone();
    info!("listening on {}:{}", bind.0, bind.1);

    HttpServer::new(move || {
        let cors = if allowed_origins.is_empty() {
            Cors::permissive()
        } else {
            let mut cors = Cors::default()
                .allow_any_method()
                .allow_any_header()
                .max_age(3600);
            for origin in &allowed_origins {
                cors = cors.allowed_origin(origin);
            }
            cors
        };

        App::new()
            .wrap(cors)
            .wrap(Correlation)
            .wrap(tracing_actix_web::TracingLogger::default())
            .app_data(state.clone())
            .configure(routes::configure)
    })
    .bind(bind)?
    .run()
    .await?;

    // In-flight events drain before subscribers close; pools close last.
    bus.shutdown().await;
    datasources.close().await;
    info!("thunder stopped");
    Ok(())
}
