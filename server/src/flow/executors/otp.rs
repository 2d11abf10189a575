//! OTP executor: two-phase one-time-password challenge over SMS or email.
//!
//! Phase 1 (no `otp` input): generate a code, store it with an expiry and
//! attempt counter bound to the flow, dispatch it through the notification
//! service, and ask the client for the `otp` input.
//!
//! Phase 2 (`otp` present): count the attempt, fail the node once the
//! attempt cap is exceeded, retry on a wrong code, authenticate on a match.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use shared::crypto::token_digest;
use shared::errors::{ErrorKind, ServiceError, ServiceResult};

use crate::domain::User;
use crate::flow::context::AuthenticatedUser;

use super::{Executor, ExecutorResponse, NodeContext};

const DEFAULT_OTP_LENGTH: u32 = 6;
const DEFAULT_VALIDITY_SECONDS: i64 = 300;
const DEFAULT_MAX_ATTEMPTS: i64 = 3;

// =============================================================================
// Seams
// =============================================================================

/// Insert payload for a pending OTP challenge.
#[derive(Debug, Clone)]
pub struct NewOtpBinding {
    pub flow_id: String,
    pub user_id: uuid::Uuid,
    pub channel: String,
    pub recipient: String,
    pub otp_hash: String,
    pub max_attempts: i32,
    pub expires_at: DateTime<Utc>,
}

/// Snapshot of a pending challenge.
#[derive(Debug, Clone)]
pub struct OtpChallenge {
    pub user_id: uuid::Uuid,
    pub otp_hash: String,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub expires_at: DateTime<Utc>,
}

/// Challenge persistence, implemented by the runtime-datasource repository.
#[async_trait]
pub trait OtpStore: Send + Sync {
    /// Stores a challenge, replacing any prior one for the flow.
    async fn save(&self, binding: NewOtpBinding) -> ServiceResult<()>;
    async fn find(&self, flow_id: &str) -> ServiceResult<Option<OtpChallenge>>;
    /// Increments and returns the attempt counter.
    async fn record_attempt(&self, flow_id: &str) -> ServiceResult<i32>;
    async fn remove(&self, flow_id: &str) -> ServiceResult<()>;
}

/// Outbound message dispatch, implemented by the notification service.
#[async_trait]
pub trait OtpDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        channel: &str,
        sender: &str,
        recipient: &str,
        variables: &HashMap<String, String>,
    ) -> ServiceResult<()>;
}

/// Username → user resolution, implemented by the user service.
#[async_trait]
pub trait OtpUserResolver: Send + Sync {
    async fn resolve_user(&self, username: &str) -> ServiceResult<User>;
}

// =============================================================================
// Executor
// =============================================================================

pub struct OtpExecutor<S, D, R> {
    name: &'static str,
    channel: &'static str,
    /// User attribute holding the delivery address for this channel.
    recipient_attribute: &'static str,
    store: Arc<S>,
    dispatcher: Arc<D>,
    users: Arc<R>,
}

impl<S: OtpStore, D: OtpDispatcher, R: OtpUserResolver> OtpExecutor<S, D, R> {
    pub fn sms(store: Arc<S>, dispatcher: Arc<D>, users: Arc<R>) -> Self {
        Self {
            name: "sms_otp",
            channel: "sms",
            recipient_attribute: "mobileNumber",
            store,
            dispatcher,
            users,
        }
    }

    pub fn email(store: Arc<S>, dispatcher: Arc<D>, users: Arc<R>) -> Self {
        Self {
            name: "email_otp",
            channel: "email",
            recipient_attribute: "email",
            store,
            dispatcher,
            users,
        }
    }

    async fn target_user(&self, ctx: &NodeContext) -> ServiceResult<User> {
        // A flow that already authenticated a user (second factor) keeps it;
        // otherwise the username input identifies the subject.
        if let Some(authenticated) = &ctx.authenticated_user {
            if let Some(username) = authenticated.attributes.get("username") {
                return self.users.resolve_user(username).await;
            }
        }
        let username = ctx.input("username").ok_or_else(|| {
            ServiceError::client("OTP-1001", "username is required for an OTP challenge")
        })?;
        self.users.resolve_user(username).await
    }

    async fn send_challenge(&self, ctx: &NodeContext) -> ServiceResult<ExecutorResponse> {
        let user = match self.target_user(ctx).await {
            Ok(user) => user,
            Err(e) if e.kind == ErrorKind::Client || e.kind == ErrorKind::NotFound => {
                return Ok(ExecutorResponse::failure(e.description));
            }
            Err(e) => return Err(e),
        };

        let recipient = user
            .attribute(self.recipient_attribute)
            .map(str::to_string)
            .ok_or_else(|| {
                ServiceError::client(
                    "OTP-1002",
                    format!("user has no {} attribute", self.recipient_attribute),
                )
            });
        let recipient = match recipient {
            Ok(r) => r,
            Err(e) => return Ok(ExecutorResponse::failure(e.description)),
        };

        let length = ctx.property_u64("otp_length").unwrap_or(DEFAULT_OTP_LENGTH as u64) as u32;
        let validity = ctx
            .property_u64("validity_seconds")
            .map(|v| v as i64)
            .unwrap_or(DEFAULT_VALIDITY_SECONDS);
        let max_attempts = ctx
            .property_u64("max_attempts")
            .map(|v| v as i64)
            .unwrap_or(DEFAULT_MAX_ATTEMPTS) as i32;

        let otp = generate_otp(length);
        self.store
            .save(NewOtpBinding {
                flow_id: ctx.flow_id.clone(),
                user_id: user.id,
                channel: self.channel.to_string(),
                recipient: recipient.clone(),
                otp_hash: token_digest(&otp),
                max_attempts,
                expires_at: Utc::now() + Duration::seconds(validity),
            })
            .await?;

        let sender = ctx.property_str("sender").unwrap_or("default").to_string();
        let mut variables = HashMap::new();
        variables.insert("otp".to_string(), otp);
        variables.insert("validity_minutes".to_string(), (validity / 60).to_string());
        self.dispatcher
            .dispatch(self.channel, &sender, &recipient, &variables)
            .await?;

        Ok(ExecutorResponse::user_input_required(vec!["otp".into()])
            .with_additional_data("recipient", mask_recipient(&recipient)))
    }

    async fn verify_challenge(
        &self,
        ctx: &NodeContext,
        submitted: &str,
    ) -> ServiceResult<ExecutorResponse> {
        let Some(challenge) = self.store.find(&ctx.flow_id).await? else {
            return Ok(ExecutorResponse::failure("no pending OTP for this flow"));
        };

        if challenge.expires_at <= Utc::now() {
            self.store.remove(&ctx.flow_id).await?;
            return Ok(ExecutorResponse::failure("OTP has expired"));
        }

        let attempts = self.store.record_attempt(&ctx.flow_id).await?;
        if attempts > challenge.max_attempts {
            self.store.remove(&ctx.flow_id).await?;
            return Ok(ExecutorResponse::failure("max attempts exceeded"));
        }

        if token_digest(submitted) != challenge.otp_hash {
            return Ok(ExecutorResponse::retry("incorrect OTP"));
        }

        self.store.remove(&ctx.flow_id).await?;
        let mut user = AuthenticatedUser::authenticated(challenge.user_id.to_string());
        if let Some(existing) = &ctx.authenticated_user {
            user.attributes.extend(existing.attributes.clone());
        }
        Ok(ExecutorResponse::complete().with_authenticated_user(user))
    }
}

#[async_trait]
impl<S, D, R> Executor for OtpExecutor<S, D, R>
where
    S: OtpStore + 'static,
    D: OtpDispatcher + 'static,
    R: OtpUserResolver + 'static,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn default_inputs(&self) -> &'static [&'static str] {
        // `otp` is deliberately absent: phase 1 runs without it, and the
        // node's own input spec lists it as optional.
        &["username"]
    }

    async fn execute(&self, ctx: &NodeContext) -> ServiceResult<ExecutorResponse> {
        match ctx.input("otp") {
            Some(submitted) => self.verify_challenge(ctx, submitted).await,
            None => self.send_challenge(ctx).await,
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn generate_otp(length: u32) -> String {
    let length = length.clamp(4, 10);
    let max = 10u64.pow(length);
    let value = rand::thread_rng().gen_range(0..max);
    format!("{:0width$}", value, width = length as usize)
}

/// Keeps the last four characters visible.
fn mask_recipient(recipient: &str) -> String {
    let chars: Vec<char> = recipient.chars().collect();
    if chars.len() <= 4 {
        return "*".repeat(chars.len());
    }
    let visible: String = chars[chars.len() - 4..].iter().collect();
    format!("{}{}", "*".repeat(chars.len() - 4), visible)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::context::FlowType;
    use crate::flow::executors::ExecutorStatus;
    use std::sync::Mutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct MemoryOtpStore {
        challenges: Mutex<HashMap<String, (NewOtpBinding, i32)>>,
    }

    #[async_trait]
    impl OtpStore for MemoryOtpStore {
        async fn save(&self, binding: NewOtpBinding) -> ServiceResult<()> {
            self.challenges
                .lock()
                .unwrap()
                .insert(binding.flow_id.clone(), (binding, 0));
            Ok(())
        }

        async fn find(&self, flow_id: &str) -> ServiceResult<Option<OtpChallenge>> {
            Ok(self.challenges.lock().unwrap().get(flow_id).map(|(b, attempts)| {
                OtpChallenge {
                    user_id: b.user_id,
                    otp_hash: b.otp_hash.clone(),
                    attempt_count: *attempts,
                    max_attempts: b.max_attempts,
                    expires_at: b.expires_at,
                }
            }))
        }

        async fn record_attempt(&self, flow_id: &str) -> ServiceResult<i32> {
            let mut challenges = self.challenges.lock().unwrap();
            let entry = challenges
                .get_mut(flow_id)
                .ok_or_else(|| ServiceError::not_found("OTP-1003", "no pending challenge"))?;
            entry.1 += 1;
            Ok(entry.1)
        }

        async fn remove(&self, flow_id: &str) -> ServiceResult<()> {
            self.challenges.lock().unwrap().remove(flow_id);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingDispatcher {
        sent: Mutex<Vec<HashMap<String, String>>>,
    }

    impl RecordingDispatcher {
        fn last_otp(&self) -> String {
            self.sent.lock().unwrap().last().unwrap()["otp"].clone()
        }
    }

    #[async_trait]
    impl OtpDispatcher for RecordingDispatcher {
        async fn dispatch(
            &self,
            _channel: &str,
            _sender: &str,
            _recipient: &str,
            variables: &HashMap<String, String>,
        ) -> ServiceResult<()> {
            self.sent.lock().unwrap().push(variables.clone());
            Ok(())
        }
    }

    struct StubUsers {
        user: User,
    }

    #[async_trait]
    impl OtpUserResolver for StubUsers {
        async fn resolve_user(&self, username: &str) -> ServiceResult<User> {
            if username == "alice" {
                Ok(self.user.clone())
            } else {
                Err(ServiceError::not_found("USR-1001", "user not found"))
            }
        }
    }

    struct Fixture {
        executor: OtpExecutor<MemoryOtpStore, RecordingDispatcher, StubUsers>,
        dispatcher: Arc<RecordingDispatcher>,
        store: Arc<MemoryOtpStore>,
    }

    fn fixture() -> Fixture {
        let user = User {
            id: Uuid::new_v4(),
            ou_id: Uuid::new_v4(),
            user_type: "person".into(),
            attributes: serde_json::json!({
                "username": "alice",
                "mobileNumber": "+14155550100"
            }),
            credential_hash: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let store = Arc::new(MemoryOtpStore::default());
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let users = Arc::new(StubUsers { user });
        Fixture {
            executor: OtpExecutor::sms(store.clone(), dispatcher.clone(), users),
            dispatcher,
            store,
        }
    }

    fn node_ctx(inputs: &[(&str, &str)]) -> NodeContext {
        NodeContext {
            flow_id: "flow-otp".into(),
            flow_type: FlowType::Authentication,
            app_id: "app-1".into(),
            node_id: "otp".into(),
            properties: serde_json::Map::new(),
            inputs: inputs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            runtime_data: HashMap::new(),
            authenticated_user: None,
            trace_id: "trace-1".into(),
        }
    }

    #[tokio::test]
    async fn phase_one_dispatches_and_requests_the_otp() {
        let f = fixture();
        let response = f
            .executor
            .execute(&node_ctx(&[("username", "alice")]))
            .await
            .unwrap();

        assert_eq!(response.status(), ExecutorStatus::UserInputRequired);
        assert_eq!(response.required_data, vec!["otp".to_string()]);
        // The recipient is masked in the step response.
        assert_eq!(response.additional_data["recipient"], "********0100");
        assert_eq!(f.dispatcher.last_otp().len(), 6);
    }

    #[tokio::test]
    async fn correct_otp_authenticates() {
        let f = fixture();
        f.executor
            .execute(&node_ctx(&[("username", "alice")]))
            .await
            .unwrap();
        let otp = f.dispatcher.last_otp();

        let response = f
            .executor
            .execute(&node_ctx(&[("username", "alice"), ("otp", &otp)]))
            .await
            .unwrap();
        assert_eq!(response.status(), ExecutorStatus::Complete);
        assert!(response.authenticated_user.unwrap().is_authenticated);
    }

    #[tokio::test]
    async fn three_wrong_attempts_then_failure_mentioning_max_attempts() {
        let f = fixture();
        f.executor
            .execute(&node_ctx(&[("username", "alice")]))
            .await
            .unwrap();

        for _ in 0..3 {
            let response = f
                .executor
                .execute(&node_ctx(&[("username", "alice"), ("otp", "000000")]))
                .await
                .unwrap();
            assert_eq!(response.status(), ExecutorStatus::Retry);
        }

        let fourth = f
            .executor
            .execute(&node_ctx(&[("username", "alice"), ("otp", "000000")]))
            .await
            .unwrap();
        assert_eq!(fourth.status(), ExecutorStatus::Failure);
        assert!(fourth.failure_reason.unwrap().contains("max attempts"));
    }

    #[tokio::test]
    async fn expired_challenge_fails() {
        let f = fixture();
        f.executor
            .execute(&node_ctx(&[("username", "alice")]))
            .await
            .unwrap();
        // Force the stored challenge into the past.
        {
            let mut challenges = f.store.challenges.lock().unwrap();
            let entry = challenges.get_mut("flow-otp").unwrap();
            entry.0.expires_at = Utc::now() - Duration::seconds(1);
        }
        let otp = f.dispatcher.last_otp();
        let response = f
            .executor
            .execute(&node_ctx(&[("username", "alice"), ("otp", &otp)]))
            .await
            .unwrap();
        assert_eq!(response.status(), ExecutorStatus::Failure);
        assert!(response.failure_reason.unwrap().contains("expired"));
    }

    #[tokio::test]
    async fn unknown_user_fails_the_node() {
        let f = fixture();
        let response = f
            .executor
            .execute(&node_ctx(&[("username", "mallory")]))
            .await
            .unwrap();
        assert_eq!(response.status(), ExecutorStatus::Failure);
    }
}
