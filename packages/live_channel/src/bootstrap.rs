//! Join credentials scraped from a server-rendered LiveView page.
//!
//! The page carries a `<meta name="csrf-token" content="...">` tag and a
//! container element holding the LiveView's `id`, `data-phx-session` and
//! `data-phx-static` attributes. All four values are required to join.

use std::fmt;

use scraper::{ElementRef, Html};

use crate::error::{ChannelError, CredentialField};

const MAIN_ATTR: &str = "data-phx-main";
const SESSION_ATTR: &str = "data-phx-session";
const STATIC_ATTR: &str = "data-phx-static";

/// Tokens needed to join one channel. Scoped to a single join attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinCredentials {
    pub csrf_token: String,
    pub session_token: String,
    pub static_token: String,
}

/// Channel topic derived from the container element id (`lv:<id>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic(String);

impl Topic {
    pub fn from_element_id(id: &str) -> Self {
        Self(format!("lv:{id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Topic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Everything extracted from one bootstrap document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bootstrap {
    pub credentials: JoinCredentials,
    pub element_id: String,
}

impl Bootstrap {
    /// Extract credentials and the container id from an HTML document.
    ///
    /// Fields are checked in the order csrf token, session token, static
    /// token, element id; the first absent or empty one is reported.
    pub fn extract(html: &str) -> Result<Self, ChannelError> {
        let document = Html::parse_document(html);
        let elements: Vec<ElementRef<'_>> = document
            .root_element()
            .descendants()
            .filter_map(ElementRef::wrap)
            .collect();

        let csrf_token = elements
            .iter()
            .find(|el| {
                el.value().name() == "meta" && el.value().attr("name") == Some("csrf-token")
            })
            .and_then(|el| el.value().attr("content"));
        let csrf_token = required(csrf_token, CredentialField::CsrfToken)?;

        let container = elements
            .iter()
            .find(|el| el.value().attr(MAIN_ATTR).is_some())
            .or_else(|| {
                elements
                    .iter()
                    .find(|el| el.value().attr(SESSION_ATTR).is_some())
            });
        let attr = |name: &str| container.and_then(|el| el.value().attr(name));

        let session_token = required(attr(SESSION_ATTR), CredentialField::SessionToken)?;
        let static_token = required(attr(STATIC_ATTR), CredentialField::StaticToken)?;
        let element_id = required(attr("id"), CredentialField::ElementId)?;

        tracing::debug!(%csrf_token, %element_id, "extracted join credentials");

        Ok(Self {
            credentials: JoinCredentials {
                csrf_token,
                session_token,
                static_token,
            },
            element_id,
        })
    }

    pub fn topic(&self) -> Topic {
        Topic::from_element_id(&self.element_id)
    }
}

fn required(value: Option<&str>, field: CredentialField) -> Result<String, ChannelError> {
    match value {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(ChannelError::MissingCredential(field)),
    }
}
