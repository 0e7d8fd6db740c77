//! Source readers for the announcement API and the fallback HTML listing, plus the
//! normalizer that turns either row shape into an `AnnouncementRecord`.

use std::sync::LazyLock;

use annwatch_core::{
    AnnouncementRecord, ApiRow, HtmlRow, NormalizedAnnouncement, RawAnnouncement, SourceKind,
    XbrlRow,
};
use annwatch_storage::{Fetch, FetchError, FetchRequest};
use async_trait::async_trait;
use chrono::NaiveDate;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "annwatch-adapters";

pub const DEFAULT_API_URL: &str =
    "https://api.bseindia.com/BseIndiaAPI/api/AnnSubCategoryGetData/w";
pub const DEFAULT_HTML_URL: &str = "https://www.bseindia.com/corporates/ann.html";
pub const DEFAULT_XBRL_URL: &str = "https://www.bseindia.com/Msource/90D/CorpXbrlGen.aspx";
pub const DEFAULT_SITE_ORIGIN: &str = "https://www.bseindia.com";
pub const DEFAULT_ATTACHMENT_BASE: &str =
    "https://www.bseindia.com/xml-data/corpfiling/AttachLive";
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0";

pub const UNKNOWN_DATE: &str = "Unknown";
pub const UNSPECIFIED_CATEGORY: &str = "Unspecified";

/// Substrings that only appear when the listing page shipped its client-side template
/// without data bound into it.
pub const TEMPLATE_MARKERS: &[&str] = &["{{", "}}", "CorpannData", "ng-bind", "ng-repeat"];

static ENTITY_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{5,6}\b").expect("entity code regex"));
static DATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\d{2}[-/]\d{2}[-/]\d{4}(?:\s+\d{2}:\d{2}(?::\d{2})?)?")
        .expect("date regex")
});

static XBRL_SCRIP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]*ScripCode[^>]*>(.*?)</").expect("xbrl scrip regex"));
static XBRL_INSTANT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<xbrli:instant>(.*?)</xbrli:instant>").expect("xbrl instant regex")
});
static XBRL_SUBJECT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<in-bse-co:SubjectOfAnnouncement[^>]*>(.*?)</").expect("xbrl subject regex")
});
static XBRL_ATTACHMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<in-bse-co:AttachmentURL[^>]*>(.*?)</").expect("xbrl attachment regex")
});

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceContext {
    pub run_id: Uuid,
    pub target_date: NaiveDate,
}

#[async_trait]
pub trait AnnouncementSource: Send + Sync {
    fn source_id(&self) -> &'static str;
    fn kind(&self) -> SourceKind;
    fn build_request(&self, ctx: &SourceContext) -> FetchRequest;
    fn parse(&self, body: &str) -> Result<Vec<RawAnnouncement>, AdapterError>;

    async fn fetch(
        &self,
        http: &dyn Fetch,
        ctx: &SourceContext,
    ) -> Result<Vec<RawAnnouncement>, AdapterError> {
        let request = self.build_request(ctx);
        let resp = http.fetch(self.source_id(), &request).await?;
        let rows = self.parse(&resp.text())?;
        debug!(source_id = self.source_id(), rows = rows.len(), "extracted rows");
        Ok(rows)
    }
}

#[derive(Debug, Clone)]
pub struct ApiAnnouncementSource {
    pub url: String,
    pub referer: String,
    pub origin: String,
    pub user_agent: String,
}

impl Default for ApiAnnouncementSource {
    fn default() -> Self {
        Self {
            url: DEFAULT_API_URL.to_string(),
            referer: DEFAULT_HTML_URL.to_string(),
            origin: DEFAULT_SITE_ORIGIN.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

#[async_trait]
impl AnnouncementSource for ApiAnnouncementSource {
    fn source_id(&self) -> &'static str {
        "announcement-api"
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Api
    }

    fn build_request(&self, ctx: &SourceContext) -> FetchRequest {
        let day = ctx.target_date.format("%Y%m%d").to_string();
        FetchRequest::get(&self.url)
            .query("pageno", "1")
            .query("strScrip", "")
            .query("strCat", "-1")
            .query("strPrevDate", day.clone())
            .query("strToDate", day)
            .query("strSearch", "P")
            .query("strType", "C")
            .query("subcategory", "")
            .header("Accept", "application/json")
            .header("Referer", &self.referer)
            .header("Origin", &self.origin)
            .header("User-Agent", &self.user_agent)
    }

    fn parse(&self, body: &str) -> Result<Vec<RawAnnouncement>, AdapterError> {
        extract_api_rows(body)
    }
}

#[derive(Debug, Clone)]
pub struct HtmlAnnouncementSource {
    pub url: String,
    pub user_agent: String,
}

impl Default for HtmlAnnouncementSource {
    fn default() -> Self {
        Self {
            url: DEFAULT_HTML_URL.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

#[async_trait]
impl AnnouncementSource for HtmlAnnouncementSource {
    fn source_id(&self) -> &'static str {
        "announcement-html"
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Html
    }

    fn build_request(&self, _ctx: &SourceContext) -> FetchRequest {
        FetchRequest::get(&self.url).header("User-Agent", &self.user_agent)
    }

    fn parse(&self, body: &str) -> Result<Vec<RawAnnouncement>, AdapterError> {
        extract_html_rows(body)
    }
}

/// Per-entity XBRL filing lookup, used by range sweeps when the listing has no tracked rows.
#[derive(Debug, Clone)]
pub struct XbrlAnnouncementSource {
    pub url: String,
    pub origin: String,
    pub user_agent: String,
}

impl Default for XbrlAnnouncementSource {
    fn default() -> Self {
        Self {
            url: DEFAULT_XBRL_URL.to_string(),
            origin: DEFAULT_SITE_ORIGIN.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl XbrlAnnouncementSource {
    pub fn source_id(&self) -> &'static str {
        "announcement-xbrl"
    }

    pub fn build_request(&self, scrip: &str) -> FetchRequest {
        FetchRequest::get(&self.url)
            .query("Scripcode", scrip)
            .header("Accept", "application/json")
            .header("Referer", &self.origin)
            .header("Origin", &self.origin)
            .header("User-Agent", &self.user_agent)
    }

    /// Latest filing for `scrip`. A document for another entity, or a body that is not XBRL,
    /// yields `None`. A filing without an instant is dated `target_date` (`YYYYMMDD`).
    pub async fn fetch_for(
        &self,
        http: &dyn Fetch,
        scrip: &str,
        target_date: NaiveDate,
    ) -> Result<Option<RawAnnouncement>, AdapterError> {
        let resp = http.fetch(self.source_id(), &self.build_request(scrip)).await?;
        Ok(extract_xbrl_row(&resp.text(), scrip).map(|mut row| {
            row.instant
                .get_or_insert_with(|| target_date.format("%Y%m%d").to_string());
            RawAnnouncement::Xbrl(row)
        }))
    }
}

fn capture(re: &Regex, body: &str) -> Option<String> {
    re.captures(body)
        .and_then(|c| c.get(1))
        .and_then(|m| text_or_none(m.as_str()))
}

pub fn extract_xbrl_row(body: &str, scrip: &str) -> Option<XbrlRow> {
    if !body.contains("<xbrli:xbrl") {
        return None;
    }
    let scrip_code = capture(&XBRL_SCRIP_RE, body)?;
    if !scrip_code.eq_ignore_ascii_case(scrip.trim()) {
        debug!(expected = scrip, found = %scrip_code, "xbrl document is for another entity");
        return None;
    }
    Some(XbrlRow {
        scrip_code,
        instant: capture(&XBRL_INSTANT_RE, body),
        subject: capture(&XBRL_SUBJECT_RE, body).map(|s| collapse_whitespace(&s)),
        attachment_url: capture(&XBRL_ATTACHMENT_RE, body),
    })
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn json_scalar(row: &JsonValue, key: &str) -> Option<String> {
    match row.get(key)? {
        JsonValue::String(s) => text_or_none(s),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Rows of the `Table` array in an API payload. A payload without a table is empty, not an
/// error; a body that is not JSON at all is.
pub fn extract_api_rows(body: &str) -> Result<Vec<RawAnnouncement>, AdapterError> {
    let value: JsonValue = serde_json::from_str(body)?;
    let Some(rows) = value.get("Table").and_then(JsonValue::as_array) else {
        return Ok(Vec::new());
    };
    Ok(rows
        .iter()
        .filter(|row| row.is_object())
        .map(|row| {
            RawAnnouncement::Api(ApiRow {
                news_dt: json_scalar(row, "NEWS_DT"),
                scrip_cd: json_scalar(row, "SCRIP_CD"),
                long_name: json_scalar(row, "SLONGNAME"),
                subject: json_scalar(row, "NEWSSUB"),
                headline: json_scalar(row, "HEADLINE"),
                category: json_scalar(row, "CATEGORYNAME"),
                attachment_url: json_scalar(row, "NSURL"),
                attachment_name: json_scalar(row, "ATTACHMENTNAME"),
            })
        })
        .collect())
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(e.to_string()))
}

fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn element_text(el: &ElementRef<'_>) -> String {
    collapse_whitespace(&el.text().collect::<String>())
}

/// First usable row of the first table on the page.
///
/// The header row is skipped and the first row with at least three cells wins. Within it the
/// longest cell is the title, the first 5-6 digit token is the entity code (else the second
/// cell), the date comes from that row or one of the next three, and the first anchor is the
/// document link.
pub fn extract_html_rows(body: &str) -> Result<Vec<RawAnnouncement>, AdapterError> {
    let document = Html::parse_document(body);
    let table_sel = selector("table")?;
    let row_sel = selector("tr")?;
    let cell_sel = selector("td, th")?;
    let anchor_sel = selector("a[href]")?;

    let Some(table) = document.select(&table_sel).next() else {
        debug!("no table in listing page");
        return Ok(Vec::new());
    };
    let rows: Vec<ElementRef<'_>> = table.select(&row_sel).collect();

    let found = rows.iter().enumerate().skip(1).find_map(|(idx, row)| {
        let cells: Vec<ElementRef<'_>> = row.select(&cell_sel).collect();
        (cells.len() >= 3).then_some((idx, cells))
    });
    let Some((idx, cells)) = found else {
        debug!(rows = rows.len(), "no row with three cells");
        return Ok(Vec::new());
    };

    let texts: Vec<String> = cells.iter().map(element_text).collect();

    let title = texts
        .iter()
        .fold(None::<&String>, |best, t| match best {
            Some(b) if b.chars().count() >= t.chars().count() => Some(b),
            _ => Some(t),
        })
        .cloned()
        .unwrap_or_default();

    let entity_code = texts
        .iter()
        .find_map(|t| ENTITY_CODE_RE.find(t).map(|m| m.as_str().to_string()))
        .unwrap_or_else(|| texts.get(1).cloned().unwrap_or_default());

    let date = rows[idx..rows.len().min(idx + 4)]
        .iter()
        .flat_map(|row| row.select(&cell_sel))
        .find_map(|cell| {
            DATE_RE
                .find(&element_text(&cell))
                .map(|m| m.as_str().to_string())
        });

    let document_link = cells
        .iter()
        .find_map(|cell| cell.select(&anchor_sel).next())
        .and_then(|a| a.value().attr("href"))
        .and_then(text_or_none);

    Ok(vec![RawAnnouncement::Html(HtmlRow {
        date,
        entity_code,
        title,
        document_link,
    })])
}

#[derive(Debug, Clone)]
pub struct NormalizeOptions {
    pub attachment_base: String,
    pub site_origin: String,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            attachment_base: DEFAULT_ATTACHMENT_BASE.to_string(),
            site_origin: DEFAULT_SITE_ORIGIN.to_string(),
        }
    }
}

fn resolve_link(link: &str, options: &NormalizeOptions) -> String {
    let link = link.trim();
    if link.is_empty() || link.starts_with("http://") || link.starts_with("https://") {
        link.to_string()
    } else if let Some(rest) = link.strip_prefix("//") {
        format!("https://{rest}")
    } else if link.starts_with('/') {
        format!("{}{}", options.site_origin.trim_end_matches('/'), link)
    } else {
        link.to_string()
    }
}

pub fn find_template_marker(record: &AnnouncementRecord) -> Option<&'static str> {
    TEMPLATE_MARKERS
        .iter()
        .copied()
        .find(|marker| record.fields().iter().any(|field| field.contains(marker)))
}

pub fn is_templated(record: &AnnouncementRecord) -> bool {
    find_template_marker(record).is_some()
}

pub fn normalize(raw: &RawAnnouncement, options: &NormalizeOptions) -> NormalizedAnnouncement {
    let (record, category) = match raw {
        RawAnnouncement::Api(row) => {
            let link = row
                .attachment_url
                .clone()
                .or_else(|| {
                    row.attachment_name.as_deref().map(|name| {
                        format!("{}/{}", options.attachment_base.trim_end_matches('/'), name.trim())
                    })
                })
                .unwrap_or_default();
            let category = row
                .category
                .as_deref()
                .filter(|c| !c.trim().eq_ignore_ascii_case("null"))
                .and_then(text_or_none)
                .unwrap_or_else(|| UNSPECIFIED_CATEGORY.to_string());
            (
                AnnouncementRecord::new(
                    row.news_dt.as_deref().and_then(text_or_none).unwrap_or_else(|| UNKNOWN_DATE.to_string()),
                    row.scrip_cd
                        .as_deref()
                        .and_then(text_or_none)
                        .or_else(|| row.long_name.as_deref().and_then(text_or_none))
                        .unwrap_or_default(),
                    row.subject
                        .as_deref()
                        .and_then(text_or_none)
                        .or_else(|| row.headline.as_deref().and_then(text_or_none))
                        .unwrap_or_default(),
                    resolve_link(&link, options),
                ),
                category,
            )
        }
        RawAnnouncement::Html(row) => (
            AnnouncementRecord::new(
                row.date.as_deref().and_then(text_or_none).unwrap_or_else(|| UNKNOWN_DATE.to_string()),
                row.entity_code.trim(),
                row.title.trim(),
                resolve_link(row.document_link.as_deref().unwrap_or_default(), options),
            ),
            UNSPECIFIED_CATEGORY.to_string(),
        ),
        RawAnnouncement::Xbrl(row) => (
            AnnouncementRecord::new(
                row.instant.as_deref().and_then(text_or_none).unwrap_or_else(|| UNKNOWN_DATE.to_string()),
                row.scrip_code.trim(),
                row.subject.as_deref().unwrap_or_default().trim(),
                resolve_link(row.attachment_url.as_deref().unwrap_or_default(), options),
            ),
            UNSPECIFIED_CATEGORY.to_string(),
        ),
    };

    let templated = is_templated(&record);
    NormalizedAnnouncement {
        record,
        category,
        source: raw.source(),
        templated,
    }
}
