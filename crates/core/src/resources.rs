//! Remote resources managed by the workflow: projects, consent screens,
//! OAuth clients, and client credentials.

use crate::state::Secret;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub project_id: String,
    /// `organizations/{id}` when the project lives under an organization.
    pub parent: Option<String>,
}

/// Requested consent-screen (OAuth brand) settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentScreenSpec {
    pub application_title: String,
    pub support_email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentScreen {
    /// Full resource name, e.g. `projects/123/brands/123`.
    pub name: String,
    pub application_title: String,
    pub support_email: String,
}

impl ConsentScreen {
    pub fn matches(&self, spec: &ConsentScreenSpec) -> bool {
        self.application_title == spec.application_title
            && self.support_email.eq_ignore_ascii_case(&spec.support_email)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthClientSpec {
    pub client_id: String,
    pub display_name: String,
    pub redirect_uris: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthClient {
    pub client_id: String,
    pub display_name: String,
    pub redirect_uris: BTreeSet<String>,
}

impl OAuthClient {
    pub fn allows_all(&self, uris: &BTreeSet<String>) -> bool {
        uris.is_subset(&self.redirect_uris)
    }
}

/// A credential (secret) belonging to an OAuth client.
///
/// The secret value is only returned by the create call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientKey {
    pub key_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<Secret>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consent_screen_match_ignores_email_case() {
        let screen = ConsentScreen {
            name: "projects/1/brands/1".into(),
            application_title: "Demo".into(),
            support_email: "Support@Example.com".into(),
        };
        let spec = ConsentScreenSpec {
            application_title: "Demo".into(),
            support_email: "support@example.com".into(),
        };
        assert!(screen.matches(&spec));

        let other = ConsentScreenSpec {
            application_title: "Other".into(),
            ..spec
        };
        assert!(!screen.matches(&other));
    }

    #[test]
    fn client_allows_subset_of_uris() {
        let client = OAuthClient {
            client_id: "web".into(),
            display_name: "Web".into(),
            redirect_uris: ["https://a.test/cb", "http://localhost:3000/cb"]
                .into_iter()
                .map(String::from)
                .collect(),
        };
        let wanted: BTreeSet<String> = ["https://a.test/cb".to_string()].into();
        assert!(client.allows_all(&wanted));
        let more: BTreeSet<String> = ["https://b.test/cb".to_string()].into();
        assert!(!client.allows_all(&more));
    }
}
