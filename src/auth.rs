//! Credential-type registry consulted by `Session::authenticate`.
//!
//! Read-only after the server protocol is constructed, so it is shared
//! across every session without synchronization beyond the `Arc` that
//! holds it.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

/// Credentials presented by a connecting provider: a type tag plus an
/// arbitrary JSON object of fields, as carried by the `authenticate`
/// method's `[type, creds]` params.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub kind: String,
    pub fields: serde_json::Map<String, Value>,
}

pub type Predicate = Arc<dyn Fn(&Credentials) -> bool + Send + Sync>;

/// `type -> predicate` registry. The empty string is the conventional
/// "anonymous" type: a session authenticated with `creds = None` checks
/// for an authenticator registered under `""` and grants access if one
/// exists and accepts an empty credentials object.
#[derive(Clone, Default)]
pub struct Authenticators {
    by_type: Arc<HashMap<String, Predicate>>,
}

pub struct AuthenticatorsBuilder {
    by_type: HashMap<String, Predicate>,
}

impl AuthenticatorsBuilder {
    pub fn new() -> Self {
        AuthenticatorsBuilder {
            by_type: HashMap::new(),
        }
    }

    pub fn add(
        mut self,
        kind: impl Into<String>,
        predicate: impl Fn(&Credentials) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.by_type.insert(kind.into(), Arc::new(predicate));
        self
    }

    /// Registers an authenticator that accepts any credentials for `kind`.
    pub fn allow_any(self, kind: impl Into<String>) -> Self {
        self.add(kind, |_| true)
    }

    pub fn build(self) -> Authenticators {
        Authenticators {
            by_type: Arc::new(self.by_type),
        }
    }
}

impl Default for AuthenticatorsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Authenticators {
    /// Anonymous grant check: is there an authenticator registered under
    /// the empty type, and does it accept an empty-fields credentials
    /// value?
    pub fn grants_anonymous(&self) -> bool {
        match self.by_type.get("") {
            Some(predicate) => predicate(&Credentials {
                kind: String::new(),
                fields: serde_json::Map::new(),
            }),
            None => false,
        }
    }

    pub fn check(&self, credentials: &Credentials) -> bool {
        match self.by_type.get(&credentials.kind) {
            Some(predicate) => predicate(credentials),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn anonymous_denied_with_no_registration() {
        let auth = AuthenticatorsBuilder::new().build();
        assert!(!auth.grants_anonymous());
    }

    #[test]
    fn anonymous_granted_when_registered() {
        let auth = AuthenticatorsBuilder::new().allow_any("").build();
        assert!(auth.grants_anonymous());
    }

    #[test]
    fn credential_check_consults_matching_type() {
        let auth = AuthenticatorsBuilder::new()
            .add("username", |c| {
                c.fields.get("password").and_then(|v| v.as_str()) == Some("secret")
            })
            .build();

        let ok = Credentials {
            kind: "username".to_string(),
            fields: json!({"username": "Bob", "password": "secret"})
                .as_object()
                .unwrap()
                .clone(),
        };
        assert!(auth.check(&ok));

        let bad = Credentials {
            kind: "username".to_string(),
            fields: json!({"username": "Bob", "password": "wrong"})
                .as_object()
                .unwrap()
                .clone(),
        };
        assert!(!auth.check(&bad));

        let unknown_type = Credentials {
            kind: "ldap".to_string(),
            fields: Default::default(),
        };
        assert!(!auth.check(&unknown_type));
    }
}
