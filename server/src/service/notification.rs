//! # Notification Dispatch
//!
//! Provider-agnostic SMS/email sending with `{{placeholder}}` templating.
//!
//! A sender is selected by name and backed by one of three providers:
//!
//! | Provider | Transport                                             |
//! |----------|-------------------------------------------------------|
//! | `twilio` | Messages API, HTTP Basic (account SID / auth token)   |
//! | `vonage` | SMS API, key/secret form fields                       |
//! | `custom` | arbitrary webhook: url, method, JSON/FORM, headers    |
//!
//! Phone numbers are normalized per provider (Twilio takes E.164 with `+`,
//! Vonage takes bare digits). Non-2xx responses produce an error that
//! includes the response status code; network errors bubble up unchanged.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use shared::errors::{ServiceError, ServiceResult};
use shared::observability::{Event, EventBus, EventStatus};
use tracing::{debug, info};

use crate::flow::executors::otp::OtpDispatcher;

const TWILIO_DEFAULT_BASE: &str = "https://api.twilio.com";
const VONAGE_DEFAULT_BASE: &str = "https://rest.nexmo.com";

const DEFAULT_SMS_TEMPLATE: &str =
    "{{otp}} is your verification code. It expires in {{validity_minutes}} minutes.";
const DEFAULT_EMAIL_TEMPLATE: &str =
    "Your verification code is {{otp}}. It expires in {{validity_minutes}} minutes.";

// =============================================================================
// Sender Registry
// =============================================================================

/// One configured sender. Property bags hold provider-specific settings
/// (credential values are decrypted by the store layer before they get
/// here).
#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub name: String,
    pub provider: String,
    pub properties: HashMap<String, String>,
}

impl SenderConfig {
    fn property(&self, key: &str) -> ServiceResult<&str> {
        self.properties.get(key).map(String::as_str).ok_or_else(|| {
            ServiceError::server(
                "NTF-1001",
                format!("sender '{}' is missing property '{}'", self.name, key),
            )
        })
    }

    fn property_or(&self, key: &str, fallback: &'static str) -> &str {
        self.properties.get(key).map(String::as_str).unwrap_or(fallback)
    }
}

// =============================================================================
// Service
// =============================================================================

pub struct NotificationService {
    http: reqwest::Client,
    senders: RwLock<HashMap<String, SenderConfig>>,
    bus: EventBus,
}

impl NotificationService {
    pub fn new(http: reqwest::Client, bus: EventBus) -> Self {
        Self { http, senders: RwLock::new(HashMap::new()), bus }
    }

    /// Registers (or replaces) a sender.
    pub fn register_sender(&self, config: SenderConfig) -> ServiceResult<()> {
        match config.provider.as_str() {
            "twilio" | "vonage" | "custom" => {}
            other => {
                return Err(ServiceError::client(
                    "NTF-1002",
                    format!("unknown notification provider '{}'", other),
                ))
            }
        }
        info!(sender = %config.name, provider = %config.provider, "notification sender registered");
        self.senders
            .write()
            .expect("sender registry poisoned")
            .insert(config.name.clone(), config);
        Ok(())
    }

    fn sender(&self, name: &str) -> ServiceResult<SenderConfig> {
        self.senders
            .read()
            .expect("sender registry poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| {
                ServiceError::not_found("NTF-1004", format!("no sender named '{}'", name))
            })
    }

    /// Renders the SMS template and dispatches through the named sender.
    pub async fn send_sms(
        &self,
        sender_name: &str,
        to: &str,
        variables: &HashMap<String, String>,
    ) -> ServiceResult<()> {
        let sender = self.sender(sender_name)?;
        let template = sender
            .properties
            .get("sms_template")
            .map(String::as_str)
            .unwrap_or(DEFAULT_SMS_TEMPLATE);
        let body = render_template(template, variables);

        match sender.provider.as_str() {
            "twilio" => self.send_twilio(&sender, to, &body).await,
            "vonage" => self.send_vonage(&sender, to, &body).await,
            "custom" => self.send_custom(&sender, to, &body).await,
            other => Err(ServiceError::server(
                "NTF-1002",
                format!("unknown notification provider '{}'", other),
            )),
        }?;

        self.bus.publish(
            Event::new("user.notification.sent", "notification-service")
                .with_status(EventStatus::Success)
                .with_data(serde_json::json!({"sender": sender_name, "channel": "sms"})),
        );
        Ok(())
    }

    /// Email goes through the custom-webhook provider path.
    pub async fn send_email(
        &self,
        sender_name: &str,
        to: &str,
        variables: &HashMap<String, String>,
    ) -> ServiceResult<()> {
        let sender = self.sender(sender_name)?;
        let template = sender
            .properties
            .get("email_template")
            .map(String::as_str)
            .unwrap_or(DEFAULT_EMAIL_TEMPLATE);
        let body = render_template(template, variables);
        self.send_custom(&sender, to, &body).await?;

        self.bus.publish(
            Event::new("user.notification.sent", "notification-service")
                .with_status(EventStatus::Success)
                .with_data(serde_json::json!({"sender": sender_name, "channel": "email"})),
        );
        Ok(())
    }

    // =========================================================================
    // PROVIDERS
    // =========================================================================

    async fn send_twilio(&self, sender: &SenderConfig, to: &str, body: &str) -> ServiceResult<()> {
        let account_sid = sender.property("account_sid")?;
        let auth_token = sender.property("auth_token")?;
        let from = sender.property("from")?;
        let base = sender.property_or("base_url", TWILIO_DEFAULT_BASE);
        let url = format!("{}/2010-04-01/Accounts/{}/Messages.json", base, account_sid);

        let to = normalize_twilio(to);
        debug!(to = %to, "dispatching SMS via twilio");
        let response = self
            .http
            .post(&url)
            .basic_auth(account_sid, Some(auth_token))
            .form(&[("To", to.as_str()), ("From", from), ("Body", body)])
            .send()
            .await
            .map_err(network_error)?;
        check_status(response)
    }

    async fn send_vonage(&self, sender: &SenderConfig, to: &str, body: &str) -> ServiceResult<()> {
        let api_key = sender.property("api_key")?;
        let api_secret = sender.property("api_secret")?;
        let from = sender.property("from")?;
        let base = sender.property_or("base_url", VONAGE_DEFAULT_BASE);

        let to = normalize_vonage(to);
        debug!(to = %to, "dispatching SMS via vonage");
        let response = self
            .http
            .post(format!("{}/sms/json", base))
            .form(&[
                ("api_key", api_key),
                ("api_secret", api_secret),
                ("from", from),
                ("to", to.as_str()),
                ("text", body),
            ])
            .send()
            .await
            .map_err(network_error)?;
        check_status(response)
    }

    async fn send_custom(&self, sender: &SenderConfig, to: &str, body: &str) -> ServiceResult<()> {
        let url = sender.property("url")?;
        let method = sender.property_or("http_method", "POST").to_uppercase();
        let content_type = sender.property_or("content_type", "JSON").to_uppercase();

        let mut request = match method.as_str() {
            "PUT" => self.http.put(url),
            _ => self.http.post(url),
        };
        for (key, value) in parse_headers(sender.property_or("http_headers", "")) {
            request = request.header(key, value);
        }

        request = match content_type.as_str() {
            "FORM" => request.form(&[("to", to), ("message", body)]),
            _ => request.json(&serde_json::json!({"to": to, "message": body})),
        };

        let response = request.send().await.map_err(network_error)?;
        check_status(response)
    }
}

#[async_trait]
impl OtpDispatcher for NotificationService {
    async fn dispatch(
        &self,
        channel: &str,
        sender: &str,
        recipient: &str,
        variables: &HashMap<String, String>,
    ) -> ServiceResult<()> {
        match channel {
            "email" => self.send_email(sender, recipient, variables).await,
            _ => self.send_sms(sender, recipient, variables).await,
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Replaces `{{key}}` placeholders; unknown placeholders stay verbatim.
fn render_template(template: &str, variables: &HashMap<String, String>) -> String {
    let mut rendered = template.to_string();
    for (key, value) in variables {
        rendered = rendered.replace(&format!("{{{{{}}}}}", key), value);
    }
    rendered
}

/// Twilio takes E.164: a `00` international prefix becomes `+`.
fn normalize_twilio(number: &str) -> String {
    if let Some(rest) = number.strip_prefix("00") {
        return format!("+{}", rest);
    }
    number.to_string()
}

/// Vonage takes bare digits: leading `+` and `00` are stripped.
fn normalize_vonage(number: &str) -> String {
    number
        .strip_prefix('+')
        .or_else(|| number.strip_prefix("00"))
        .unwrap_or(number)
        .to_string()
}

/// Parses a `K:V,K:V` header string; malformed pairs are skipped.
fn parse_headers(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|pair| {
            let (key, value) = pair.split_once(':')?;
            let key = key.trim();
            let value = value.trim();
            (!key.is_empty()).then(|| (key.to_string(), value.to_string()))
        })
        .collect()
}

fn network_error(e: reqwest::Error) -> ServiceError {
    ServiceError::server("NTF-1005", format!("notification request failed: {}", e))
}

fn check_status(response: reqwest::Response) -> ServiceResult<()> {
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(ServiceError::server(
            "NTF-1003",
            format!("notification provider responded with status {}", status.as_u16()),
        ))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn variables() -> HashMap<String, String> {
        HashMap::from([
            ("otp".to_string(), "482913".to_string()),
            ("validity_minutes".to_string(), "5".to_string()),
        ])
    }

    #[test]
    fn template_rendering_replaces_known_placeholders() {
        let rendered = render_template(DEFAULT_SMS_TEMPLATE, &variables());
        assert_eq!(rendered, "482913 is your verification code. It expires in 5 minutes.");

        let partial = render_template("{{otp}} and {{unknown}}", &variables());
        assert_eq!(partial, "482913 and {{unknown}}");
    }

    #[test]
    fn phone_normalization_is_per_provider() {
        assert_eq!(normalize_twilio("0014155550100"), "+14155550100");
        assert_eq!(normalize_twilio("+14155550100"), "+14155550100");
        assert_eq!(normalize_vonage("+14155550100"), "14155550100");
        assert_eq!(normalize_vonage("0014155550100"), "14155550100");
        assert_eq!(normalize_vonage("14155550100"), "14155550100");
    }

    #[test]
    fn header_string_parses_pairs_and_skips_garbage() {
        let headers = parse_headers("X-Api-Key: abc123, Content-Signature :v1 , broken");
        assert_eq!(
            headers,
            vec![
                ("X-Api-Key".to_string(), "abc123".to_string()),
                ("Content-Signature".to_string(), "v1".to_string()),
            ]
        );
        assert!(parse_headers("").is_empty());
    }

    #[test]
    fn unknown_providers_are_rejected_at_registration() {
        let service = NotificationService::new(reqwest::Client::new(), EventBus::new());
        let err = service
            .register_sender(SenderConfig {
                name: "x".into(),
                provider: "carrier-pigeon".into(),
                properties: HashMap::new(),
            })
            .unwrap_err();
        assert_eq!(err.code, "NTF-1002");
    }

    #[tokio::test]
    async fn custom_provider_posts_json_with_configured_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("X-Api-Key", "abc123"))
            .and(body_string_contains("482913"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let service = NotificationService::new(reqwest::Client::new(), EventBus::new());
        service
            .register_sender(SenderConfig {
                name: "webhook".into(),
                provider: "custom".into(),
                properties: HashMap::from([
                    ("url".to_string(), format!("{}/hook", server.uri())),
                    ("http_method".to_string(), "POST".to_string()),
                    ("content_type".to_string(), "JSON".to_string()),
                    ("http_headers".to_string(), "X-Api-Key: abc123".to_string()),
                ]),
            })
            .unwrap();

        service
            .send_sms("webhook", "+14155550100", &variables())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn custom_provider_form_encoding() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("content-type", "application/x-www-form-urlencoded"))
            .and(body_string_contains("message="))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let service = NotificationService::new(reqwest::Client::new(), EventBus::new());
        service
            .register_sender(SenderConfig {
                name: "webhook".into(),
                provider: "custom".into(),
                properties: HashMap::from([
                    ("url".to_string(), format!("{}/hook", server.uri())),
                    ("content_type".to_string(), "FORM".to_string()),
                ]),
            })
            .unwrap();

        service
            .send_sms("webhook", "+14155550100", &variables())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn twilio_provider_uses_basic_auth_and_form_fields() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/2010-04-01/Accounts/AC123/Messages.json"))
            .and(body_string_contains("To=%2B14155550100"))
            .and(body_string_contains("Body=482913"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let service = NotificationService::new(reqwest::Client::new(), EventBus::new());
        service
            .register_sender(SenderConfig {
                name: "twilio-main".into(),
                provider: "twilio".into(),
                properties: HashMap::from([
                    ("account_sid".to_string(), "AC123".to_string()),
                    ("auth_token".to_string(), "token".to_string()),
                    ("from".to_string(), "+15005550006".to_string()),
                    ("base_url".to_string(), server.uri()),
                ]),
            })
            .unwrap();

        service
            .send_sms("twilio-main", "0014155550100", &variables())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn non_2xx_errors_include_the_status_code() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let service = NotificationService::new(reqwest::Client::new(), EventBus::new());
        service
            .register_sender(SenderConfig {
                name: "webhook".into(),
                provider: "custom".into(),
                properties: HashMap::from([(
                    "url".to_string(),
                    format!("{}/hook", server.uri()),
                )]),
            })
            .unwrap();

        let err = service
            .send_sms("webhook", "+14155550100", &variables())
            .await
            .unwrap_err();
        assert!(err.description.contains("503"));
    }

    #[tokio::test]
    async fn unknown_sender_is_not_found() {
        let service = NotificationService::new(reqwest::Client::new(), EventBus::new());
        let err = service
            .send_sms("ghost", "+14155550100", &variables())
            .await
            .unwrap_err();
        assert_eq!(err.code, "NTF-1004");
    }
}
