//! Caller namespacing for inboxes created through a shared pool
//!
//! Several people can share one pool key, and the upstream account lists
//! every inbox created with it. Inbox names carry a per-user prefix and a
//! `prefix:{prefix}` tag so each user only sees their own.

use tracing::info;

use crate::error::Result;
use crate::model::{CreateInboxOptions, Inbox};
use crate::settings::Settings;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    prefix: String,
}

impl Namespace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Configured prefix, else the persisted one, else a fresh random id
    /// that is persisted for the next session.
    pub async fn resolve(configured: Option<&str>, settings: &Settings) -> Result<Self> {
        if let Some(prefix) = configured.map(str::trim).filter(|p| !p.is_empty()) {
            return Ok(Self::new(prefix));
        }
        if let Some(prefix) = settings.user_prefix().await? {
            return Ok(Self::new(prefix));
        }
        let prefix = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        settings.set_user_prefix(&prefix).await?;
        info!(prefix = %prefix, "generated inbox namespace");
        Ok(Self::new(prefix))
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn tag(&self) -> String {
        format!("prefix:{}", self.prefix)
    }

    /// `{prefix}-{name}`, leaving already-prefixed names alone.
    pub fn inbox_name(&self, name: &str) -> String {
        let lead = format!("{}-", self.prefix);
        if name.starts_with(&lead) {
            name.to_string()
        } else {
            format!("{lead}{name}")
        }
    }

    /// Prefix the name (generating one from `now_millis` if absent) and add
    /// the namespace tag.
    pub fn apply(&self, options: &mut CreateInboxOptions, now_millis: u64) {
        let name = match options.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => self.inbox_name(name),
            _ => self.inbox_name(&format!("inbox-{now_millis}")),
        };
        options.name = Some(name);
        let tag = self.tag();
        if !options.tags.contains(&tag) {
            options.tags.push(tag);
        }
    }

    pub fn owns(&self, inbox: &Inbox) -> bool {
        let lead = format!("{}-", self.prefix);
        inbox
            .name
            .as_deref()
            .is_some_and(|name| name.starts_with(&lead))
            || inbox.has_tag(&self.tag())
    }

    pub fn filter(&self, inboxes: Vec<Inbox>) -> Vec<Inbox> {
        inboxes.into_iter().filter(|i| self.owns(i)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use storage::MemoryStore;

    fn inbox(name: Option<&str>, tags: Option<Vec<&str>>) -> Inbox {
        Inbox {
            id: "id".into(),
            email_address: None,
            name: name.map(str::to_string),
            tags: tags.map(|t| t.into_iter().map(str::to_string).collect()),
            extra: Default::default(),
        }
    }

    #[test]
    fn names_are_prefixed_once() {
        let ns = Namespace::new("a1b2c3d4");
        assert_eq!(ns.inbox_name("tests"), "a1b2c3d4-tests");
        assert_eq!(ns.inbox_name("a1b2c3d4-tests"), "a1b2c3d4-tests");
    }

    #[test]
    fn apply_generates_name_and_tag() {
        let ns = Namespace::new("u1");
        let mut options = CreateInboxOptions::default();
        ns.apply(&mut options, 1_700_000_000_000);
        assert_eq!(options.name.as_deref(), Some("u1-inbox-1700000000000"));
        assert_eq!(options.tags, vec!["prefix:u1".to_string()]);

        ns.apply(&mut options, 0);
        assert_eq!(options.tags.len(), 1);
    }

    #[test]
    fn filter_by_name_or_tag() {
        let ns = Namespace::new("u1");
        let inboxes = vec![
            inbox(Some("u1-mine"), None),
            inbox(Some("renamed"), Some(vec!["prefix:u1"])),
            inbox(Some("u2-theirs"), Some(vec!["prefix:u2"])),
            inbox(None, None),
        ];
        let mine = ns.filter(inboxes);
        assert_eq!(mine.len(), 2);
    }

    #[tokio::test]
    async fn resolve_prefers_config_then_persisted() {
        let settings = Settings::new(Arc::new(MemoryStore::new()));
        let generated = Namespace::resolve(None, &settings).await.unwrap();
        assert_eq!(generated.prefix().len(), 8);
        assert!(generated.prefix().chars().all(|c| c.is_ascii_hexdigit()));

        let again = Namespace::resolve(Some("  "), &settings).await.unwrap();
        assert_eq!(again, generated);

        let configured = Namespace::resolve(Some("team"), &settings).await.unwrap();
        assert_eq!(configured.prefix(), "team");
    }
}
