//! Core announcement model shared by the watcher crates.

use std::fmt;

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "annwatch-core";

/// Tokens tracked when no explicit list is configured.
pub const DEFAULT_TRACKED_TOKENS: &[&str] = &[
    "539594", "VPRPL", "OLECTRA", "TITAGARH", "ASTRAL", "AGI", "JIOFIN", "BLS",
];

/// Canonical unit of comparison and notification.
///
/// Fields are kept exactly as scraped (after trimming); equality is plain field-wise string
/// equality. The serialized names match the state files written by earlier deployments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AnnouncementRecord {
    #[serde(default)]
    pub date: String,
    #[serde(rename = "scrip", alias = "entity_id", default)]
    pub entity_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(rename = "pdf", alias = "document_link", default)]
    pub document_link: String,
}

impl AnnouncementRecord {
    pub fn new(
        date: impl Into<String>,
        entity_id: impl Into<String>,
        title: impl Into<String>,
        document_link: impl Into<String>,
    ) -> Self {
        Self {
            date: date.into(),
            entity_id: entity_id.into(),
            title: title.into(),
            document_link: document_link.into(),
        }
    }

    pub fn fields(&self) -> [&str; 4] {
        [
            &self.date,
            &self.entity_id,
            &self.title,
            &self.document_link,
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Api,
    Html,
    Xbrl,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Api => f.write_str("api"),
            SourceKind::Html => f.write_str("html"),
            SourceKind::Xbrl => f.write_str("xbrl"),
        }
    }
}

/// One row of the JSON announcement listing, scalars already stringified.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiRow {
    pub news_dt: Option<String>,
    pub scrip_cd: Option<String>,
    pub long_name: Option<String>,
    pub subject: Option<String>,
    pub headline: Option<String>,
    pub category: Option<String>,
    pub attachment_url: Option<String>,
    pub attachment_name: Option<String>,
}

/// Fields recovered from the first usable row of the fallback HTML table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtmlRow {
    pub date: Option<String>,
    pub entity_code: String,
    pub title: String,
    pub document_link: Option<String>,
}

/// Latest filing from a per-entity XBRL document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct XbrlRow {
    pub scrip_code: String,
    pub instant: Option<String>,
    pub subject: Option<String>,
    pub attachment_url: Option<String>,
}

/// Source-specific row shape handed from a reader to the normalizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RawAnnouncement {
    Api(ApiRow),
    Html(HtmlRow),
    Xbrl(XbrlRow),
}

impl RawAnnouncement {
    pub fn source(&self) -> SourceKind {
        match self {
            RawAnnouncement::Api(_) => SourceKind::Api,
            RawAnnouncement::Html(_) => SourceKind::Html,
            RawAnnouncement::Xbrl(_) => SourceKind::Xbrl,
        }
    }
}

/// Normalizer output. Past this point nothing branches on `source`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NormalizedAnnouncement {
    pub record: AnnouncementRecord,
    pub category: String,
    pub source: SourceKind,
    pub templated: bool,
}

/// Ordered, de-duplicated set of uppercase identifier tokens.
///
/// Records are matched word by word, so only purely alphanumeric tokens are kept; an entry
/// such as `TATA MOTORS` could never match and is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedEntityList {
    tokens: Vec<String>,
}

impl TrackedEntityList {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out: Vec<String> = Vec::new();
        for token in tokens {
            let token = token.as_ref().trim().to_uppercase();
            if Self::is_matchable(&token) && !out.contains(&token) {
                out.push(token);
            }
        }
        Self { tokens: out }
    }

    pub fn is_matchable(token: &str) -> bool {
        !token.is_empty() && token.chars().all(char::is_alphanumeric)
    }

    /// Non-blank comma-separated entries that `from_csv` would drop.
    pub fn rejected_entries(input: &str) -> Vec<String> {
        input
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty() && !Self::is_matchable(entry))
            .map(str::to_string)
            .collect()
    }

    /// Parses a comma-separated list. Returns `None` when nothing survives trimming.
    pub fn from_csv(input: &str) -> Option<Self> {
        let list = Self::new(input.split(','));
        if list.is_empty() {
            None
        } else {
            Some(list)
        }
    }

    pub fn default_list() -> Self {
        Self::new(DEFAULT_TRACKED_TOKENS.iter().copied())
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn contains(&self, token: &str) -> bool {
        self.tokens.iter().any(|t| t == token)
    }
}

impl Default for TrackedEntityList {
    fn default() -> Self {
        Self::default_list()
    }
}

impl fmt::Display for TrackedEntityList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tokens.join(", "))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn marker(self) -> &'static str {
        match self {
            Severity::High => "🔴",
            Severity::Medium => "🟠",
            Severity::Low => "🟢",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub severity: Severity,
    pub label: String,
}

impl Classification {
    pub fn new(severity: Severity, label: impl Into<String>) -> Self {
        Self {
            severity,
            label: label.into(),
        }
    }

    pub fn marker(&self) -> &'static str {
        self.severity.marker()
    }
}
