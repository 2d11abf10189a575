//! Domain layer: persistent entities and their invariants.

pub mod entities;

pub use entities::{
    Application, AuthorizationCode, FlowDefinitionRecord, NewApplication, NewUser,
    NotificationSender, OrgUnit, OtpBinding, RefreshTokenRecord, User,
    RESERVED_ATTRIBUTE_KEYS,
};
