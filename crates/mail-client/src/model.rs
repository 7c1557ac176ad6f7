//! Upstream resource shapes
//!
//! Only the fields the client reads are typed; everything else the API
//! returns is kept in `extra` and passed through untouched.

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Inbox {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Inbox {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags
            .as_deref()
            .is_some_and(|tags| tags.iter().any(|t| t == tag))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Email {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inbox_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Email {
    /// Replace `body` with the decoded MIME part when the API returned one.
    ///
    /// HTML wins over plain text.
    pub fn apply_mime_body(&mut self) {
        let Some(mime) = self.extra.get("mimeMessage").and_then(Value::as_object) else {
            return;
        };
        let part = ["html", "text"]
            .into_iter()
            .find_map(|field| mime.get(field).and_then(Value::as_str))
            .filter(|s| !s.is_empty());
        if let Some(part) = part {
            self.body = Some(part.to_string());
        }
    }
}

/// Options for creating an inbox.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInboxOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Exempt this inbox from automatic deletion. Local only, never sent.
    #[serde(default, skip_serializing)]
    pub keep: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendEmailOptions {
    pub to: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_html: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WaitOptions {
    /// Server-side wait; the configured email wait timeout when `None`
    pub timeout: Option<Duration>,
    pub unread_only: bool,
}

/// Raw attachment content.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub content_type: Option<String>,
    pub bytes: Bytes,
}

/// Result of probing one pool slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyCheck {
    pub slot: usize,
    pub fingerprint: String,
    pub valid: bool,
    pub exhausted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Parse any of the shapes the email list endpoint has returned: a bare
/// array, `{"content": [...]}` or `{"emails": [...]}`.
pub fn parse_email_list(value: Value) -> Option<Vec<Email>> {
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("content").or_else(|| map.remove("emails")) {
            Some(Value::Array(items)) => items,
            _ => return None,
        },
        _ => return None,
    };
    serde_json::from_value(Value::Array(items)).ok()
}
