//! Service layer: business logic over the repositories, consumed by the
//! HTTP handlers, the flow executors, and the MCP admin tools.

pub mod application_service;
pub mod claims;
pub mod client_auth;
pub mod flow_definitions;
pub mod notification;
pub mod token_service;
pub mod user_service;

pub use application_service::{ApplicationService, ApplicationUpsert};
pub use client_auth::{extract_credentials, ClientAuthService, ClientCredentials};
pub use flow_definitions::FlowDefinitionService;
pub use notification::{NotificationService, SenderConfig};
pub use token_service::{DefaultScopeValidator, TokenRequest, TokenResponse, TokenService};
pub use user_service::{UserService, UserUpsert};
