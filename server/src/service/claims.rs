//! # Claims Builder
//!
//! The pure `(scopes, user attributes, app config) → claims` function shared
//! by the UserInfo endpoint and ID-token issuance.
//!
//! For each granted scope the candidate claims are either the application's
//! scope→claims override or the standard OIDC mapping. A candidate makes it
//! into the result only when (a) the application's `id_token_user_attributes`
//! allow-list contains it (when the list is configured) and (b) the user has
//! a non-null value for it. `sub` is always added by the caller, never here.

use serde_json::{Map, Value};

use crate::domain::Application;

/// Standard OIDC scope → claims mapping (OpenID Connect Core 1.0 §5.4).
fn standard_claims(scope: &str) -> &'static [&'static str] {
    match scope {
        "profile" => &[
            "name",
            "family_name",
            "given_name",
            "middle_name",
            "nickname",
            "preferred_username",
            "profile",
            "picture",
            "website",
            "gender",
            "birthdate",
            "zoneinfo",
            "locale",
            "updated_at",
        ],
        "email" => &["email", "email_verified"],
        "phone" => &["phone_number", "phone_number_verified"],
        "address" => &["address"],
        _ => &[],
    }
}

/// Computes the claims a token or UserInfo response may carry.
pub fn build_claims(scopes: &[&str], user_attributes: &Value, app: &Application) -> Map<String, Value> {
    let mut claims = Map::new();
    let allow_list = &app.id_token_user_attributes;

    for scope in scopes {
        let overridden: Option<Vec<&str>> = app
            .scope_claims
            .get(*scope)
            .and_then(|v| v.as_array())
            .map(|items| items.iter().filter_map(|v| v.as_str()).collect());

        let candidates: Vec<&str> = match &overridden {
            Some(list) => list.clone(),
            None => standard_claims(scope).to_vec(),
        };

        for claim in candidates {
            if !allow_list.is_empty() && !allow_list.iter().any(|a| a == claim) {
                continue;
            }
            match user_attributes.get(claim) {
                Some(value) if !value.is_null() => {
                    claims.insert(claim.to_string(), value.clone());
                }
                _ => {}
            }
        }
    }
    claims
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn app(scope_claims: Value, allow_list: Vec<&str>) -> Application {
        Application {
            id: Uuid::new_v4(),
            name: "Test".into(),
            client_id: "client-1".into(),
            client_secret_hash: None,
            grant_types: vec![],
            token_auth_methods: vec!["none".into()],
            redirect_uris: vec![],
            scopes: vec![],
            scope_claims,
            id_token_user_attributes: allow_list.into_iter().map(String::from).collect(),
            auth_flow_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn attributes() -> Value {
        json!({
            "name": "Alice Example",
            "email": "alice@example.com",
            "email_verified": true,
            "picture": null,
            "phone_number": "+14155550100",
            "department": "engineering"
        })
    }

    #[test]
    fn standard_mapping_selects_non_null_values_only() {
        let claims = build_claims(&["profile", "email"], &attributes(), &app(json!({}), vec![]));
        assert_eq!(claims["name"], "Alice Example");
        assert_eq!(claims["email"], "alice@example.com");
        assert_eq!(claims["email_verified"], true);
        // Null attribute values never appear.
        assert!(!claims.contains_key("picture"));
        // Claims outside the granted scopes never appear.
        assert!(!claims.contains_key("phone_number"));
        assert!(!claims.contains_key("department"));
    }

    #[test]
    fn scope_override_replaces_the_standard_mapping() {
        let app = app(json!({"profile": ["department"]}), vec![]);
        let claims = build_claims(&["profile"], &attributes(), &app);
        assert_eq!(claims["department"], "engineering");
        assert!(!claims.contains_key("name"));
    }

    #[test]
    fn allow_list_filters_every_candidate() {
        let app = app(json!({}), vec!["email"]);
        let claims = build_claims(&["profile", "email"], &attributes(), &app);
        // Every resulting claim is on the allow-list.
        for key in claims.keys() {
            assert_eq!(key, "email");
        }
        assert!(!claims.contains_key("name"));
        assert!(!claims.contains_key("email_verified"));
    }

    #[test]
    fn empty_allow_list_means_no_filtering() {
        let claims = build_claims(&["email"], &attributes(), &app(json!({}), vec![]));
        assert!(claims.contains_key("email"));
        assert!(claims.contains_key("email_verified"));
    }

    #[test]
    fn unknown_scopes_contribute_nothing() {
        let claims = build_claims(&["openid", "orders:read"], &attributes(), &app(json!({}), vec![]));
        assert!(claims.is_empty());
    }

    #[test]
    fn builder_is_pure() {
        let app = app(json!({}), vec![]);
        let a = build_claims(&["profile", "email"], &attributes(), &app);
        let b = build_claims(&["profile", "email"], &attributes(), &app);
        assert_eq!(a, b);
    }
}
