//! Repository layer: sqlx data access per logical datasource, behind
//! dialected query records.

pub mod application_repository;
pub mod flow_repository;
pub mod sender_repository;
pub mod token_repository;
pub mod user_repository;

pub use application_repository::ApplicationRepository;
pub use flow_repository::{FlowDefinitionRepository, SqlFlowContextStore};
pub use sender_repository::SenderRepository;
pub use token_repository::{AuthorizationCodeRepository, OtpRepository, RefreshTokenRepository};
pub use user_repository::UserRepository;
