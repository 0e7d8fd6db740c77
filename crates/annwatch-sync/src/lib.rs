//! Poll-diff-notify pipeline: matching, novelty, classification, delivery and the
//! orchestration that ties the sources, state and notifier together.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use annwatch_adapters::{
    normalize, AdapterError, AnnouncementSource, ApiAnnouncementSource, HtmlAnnouncementSource,
    NormalizeOptions, SourceContext, XbrlAnnouncementSource, DEFAULT_API_URL, DEFAULT_HTML_URL,
    DEFAULT_SITE_ORIGIN, DEFAULT_USER_AGENT, DEFAULT_XBRL_URL,
};
use annwatch_core::{
    AnnouncementRecord, Classification, NormalizedAnnouncement, RawAnnouncement, Severity,
    SourceKind, TrackedEntityList,
};
use annwatch_storage::{Fetch, HttpClientConfig, HttpFetcher, JsonStateStore, StateStore};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "annwatch-sync";

pub const DEFAULT_STATE_FILE: &str = "last_seen.json";
pub const DEFAULT_TELEGRAM_API_BASE: &str = "https://api.telegram.org";
pub const DEFAULT_LODR_EMOJI: &str = "🧪";

/// Exchange local time is UTC+05:30.
const EXCHANGE_UTC_OFFSET_SECS: i32 = 5 * 3600 + 30 * 60;

pub fn exchange_today() -> NaiveDate {
    let offset =
        FixedOffset::east_opt(EXCHANGE_UTC_OFFSET_SECS).expect("exchange offset is in range");
    Utc::now().with_timezone(&offset).date_naive()
}

#[derive(Clone, PartialEq, Eq)]
pub struct BotCredentials {
    pub token: String,
    pub chat_id: String,
}

impl std::fmt::Debug for BotCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotCredentials")
            .field("token", &redact(&self.token))
            .field("chat_id", &self.chat_id)
            .finish()
    }
}

fn redact(secret: &str) -> String {
    let visible: String = secret.chars().take(4).collect();
    if secret.chars().count() <= 4 {
        "****".to_string()
    } else {
        format!("{visible}****")
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Run configuration, read once at startup and passed into the pipeline.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub credentials: Option<BotCredentials>,
    pub tracked: TrackedEntityList,
    pub force_send: bool,
    pub state_path: PathBuf,
    pub api_url: String,
    pub html_url: String,
    pub xbrl_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub heartbeat: bool,
    pub lodr_test_emoji: Option<String>,
    pub rules_file: Option<PathBuf>,
    pub telegram_api_base: String,
}

impl WatchConfig {
    pub fn new(tracked: TrackedEntityList) -> Self {
        Self {
            credentials: None,
            tracked,
            force_send: false,
            state_path: PathBuf::from(DEFAULT_STATE_FILE),
            api_url: DEFAULT_API_URL.to_string(),
            html_url: DEFAULT_HTML_URL.to_string(),
            xbrl_url: DEFAULT_XBRL_URL.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            http_timeout_secs: 15,
            heartbeat: false,
            lodr_test_emoji: None,
            rules_file: None,
            telegram_api_base: DEFAULT_TELEGRAM_API_BASE.to_string(),
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let tracked_raw = lookup("TRACKED_SCRIP");
        if let Some(raw) = &tracked_raw {
            for entry in TrackedEntityList::rejected_entries(raw) {
                warn!(%entry, "ignoring tracked symbol that is not a single alphanumeric token");
            }
        }
        let tracked = tracked_raw
            .and_then(|v| TrackedEntityList::from_csv(&v))
            .unwrap_or_default();
        let credentials = match (non_empty("BOT_TOKEN"), non_empty("CHAT_ID")) {
            (Some(token), Some(chat_id)) => Some(BotCredentials {
                token: token.trim().to_string(),
                chat_id: chat_id.trim().to_string(),
            }),
            _ => None,
        };
        let lodr_test_emoji = lookup("TEMP_LODR_TEST")
            .filter(|v| parse_flag(v))
            .map(|_| non_empty("TEMP_LODR_EMOJI").unwrap_or_else(|| DEFAULT_LODR_EMOJI.to_string()));

        let mut config = Self::new(tracked);
        config.credentials = credentials;
        config.lodr_test_emoji = lodr_test_emoji;
        config.force_send = lookup("FORCE_SEND").is_some_and(|v| parse_flag(&v));
        config.heartbeat = lookup("HEARTBEAT").is_some_and(|v| parse_flag(&v));
        config.rules_file = non_empty("RULES_FILE").map(PathBuf::from);
        if let Some(path) = non_empty("STATE_FILE") {
            config.state_path = PathBuf::from(path);
        }
        if let Some(url) = non_empty("ANN_API_URL") {
            config.api_url = url;
        }
        if let Some(url) = non_empty("ANN_HTML_URL") {
            config.html_url = url;
        }
        if let Some(url) = non_empty("ANN_XBRL_URL") {
            config.xbrl_url = url;
        }
        if let Some(agent) = non_empty("ANN_USER_AGENT") {
            config.user_agent = agent;
        }
        if let Some(secs) = lookup("ANN_HTTP_TIMEOUT_SECS").and_then(|v| v.trim().parse().ok()) {
            config.http_timeout_secs = secs;
        }
        if let Some(base) = non_empty("TELEGRAM_API_BASE") {
            config.telegram_api_base = base;
        }
        config
    }

    pub fn with_force_send(mut self, force: bool) -> Self {
        self.force_send = force;
        self
    }

    pub fn with_state_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_path = path.into();
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: bool) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_lodr_test_emoji(mut self, emoji: Option<String>) -> Self {
        self.lodr_test_emoji = emoji;
        self
    }

    pub fn with_rules_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.rules_file = Some(path.into());
        self
    }

    pub fn log_redacted(&self) {
        info!(
            tracked = %self.tracked,
            credentials = ?self.credentials,
            force_send = self.force_send,
            state_path = %self.state_path.display(),
            api_url = %self.api_url,
            html_url = %self.html_url,
            heartbeat = self.heartbeat,
            lodr_test = self.lodr_test_emoji.is_some(),
            rules_file = ?self.rules_file,
            "effective configuration"
        );
    }
}

fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_uppercase)
        .collect()
}

/// Tracked tokens (in configured order) that occur as whole words in the entity id or title.
pub fn matching_tokens(record: &AnnouncementRecord, tracked: &TrackedEntityList) -> Vec<String> {
    let mut words = tokenize(&record.entity_id);
    words.extend(tokenize(&record.title));
    tracked
        .tokens()
        .iter()
        .filter(|t| words.contains(t.as_str()))
        .cloned()
        .collect()
}

pub fn matches(record: &AnnouncementRecord, tracked: &TrackedEntityList) -> bool {
    !matching_tokens(record, tracked).is_empty()
}

pub fn is_new(candidate: &AnnouncementRecord, persisted: Option<&AnnouncementRecord>) -> bool {
    persisted != Some(candidate)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombinationRule {
    pub label: String,
    pub all_of: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationRules {
    #[serde(default)]
    pub combinations: Vec<CombinationRule>,
    #[serde(default)]
    pub critical: Vec<String>,
    #[serde(default)]
    pub important: Vec<String>,
    #[serde(default)]
    pub ignore: Vec<String>,
}

fn owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

static BUILTIN_RULES: LazyLock<ClassificationRules> = LazyLock::new(|| ClassificationRules {
    combinations: [
        ("AUDITOR EXIT", &["auditor", "resignation"][..]),
        ("CFO EXIT", &["chief financial officer", "resignation"][..]),
        ("CEO EXIT", &["chief executive officer", "resignation"][..]),
        ("RATING DOWNGRADE", &["credit rating", "downgrade"][..]),
        ("PLEDGE INVOKED", &["pledge", "invocation"][..]),
        ("INSOLVENCY ADMITTED", &["insolvency", "admitted"][..]),
    ]
    .into_iter()
    .map(|(label, all_of)| CombinationRule {
        label: label.to_string(),
        all_of: owned(all_of),
    })
    .collect(),
    critical: owned(&[
        "auditor",
        "resignation",
        "fraud",
        "default",
        "insolvency",
        "forensic",
        "search and seizure",
        "suspension",
        "delisting",
        "pledge",
        "sebi order",
        "penalty",
        "nclt",
        "winding up",
    ]),
    important: owned(&[
        "board meeting",
        "financial result",
        "dividend",
        "acquisition",
        "merger",
        "amalgamation",
        "buyback",
        "buy back",
        "bonus",
        "split",
        "rights issue",
        "preferential issue",
        "qip",
        "fund raising",
        "allotment",
        "order",
        "contract",
        "credit rating",
        "outcome",
    ]),
    ignore: owned(&[
        "agm",
        "annual general meeting",
        "newspaper publication",
        "trading window",
        "74(5)",
        "loss of share certificate",
        "duplicate share certificate",
        "analyst",
        "investor meet",
        "compliance certificate",
    ]),
});

impl ClassificationRules {
    pub fn builtin() -> Self {
        BUILTIN_RULES.clone()
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing classification rules")
    }

    pub fn from_yaml_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// `None` means an ignore keyword matched: persist, but stay quiet.
    pub fn classify(&self, title: &str) -> Option<Classification> {
        let lower = title.to_lowercase();
        let contains = |needle: &String| lower.contains(&needle.to_lowercase());

        if let Some(rule) = self
            .combinations
            .iter()
            .find(|rule| !rule.all_of.is_empty() && rule.all_of.iter().all(contains))
        {
            return Some(Classification::new(Severity::High, rule.label.clone()));
        }
        if self.critical.iter().any(contains) {
            return Some(Classification::new(Severity::High, "CRITICAL"));
        }
        if self.important.iter().any(contains) {
            return Some(Classification::new(Severity::Medium, "IMPORTANT"));
        }
        if self.ignore.iter().any(contains) {
            return None;
        }
        Some(Classification::new(Severity::Low, "INFO"))
    }
}

pub fn classify(title: &str) -> Option<Classification> {
    BUILTIN_RULES.classify(title)
}

/// Prefixes the message with the test marker when the title mentions LODR.
pub fn inject_lodr_marker(title: &str, message: String, emoji: Option<&str>) -> String {
    match emoji {
        Some(emoji) if title.to_lowercase().contains("lodr") => format!("{emoji} {message}"),
        _ => message,
    }
}

pub fn format_announcement(
    announcement: &NormalizedAnnouncement,
    classification: &Classification,
    matched: &[String],
) -> String {
    let record = &announcement.record;
    let heading = if matched.is_empty() {
        record.entity_id.clone()
    } else {
        matched.join(", ")
    };
    let mut text = format!(
        "{} {}\n{} : Announcement\nDate : {}\nScrip : {}\nCategory : {}\nTitle : {}",
        classification.marker(),
        classification.label,
        heading,
        record.date,
        record.entity_id,
        announcement.category,
        record.title,
    );
    if !record.document_link.is_empty() {
        text.push_str("\n\n");
        text.push_str(&record.document_link);
    }
    text
}

pub fn format_no_new(tracked: &TrackedEntityList) -> String {
    if tracked.is_empty() {
        "No new announcement: no symbols are being tracked".to_string()
    } else {
        format!("No new announcement for tracked symbols: {tracked}")
    }
}

pub fn format_fetch_failed(tracked: &TrackedEntityList) -> String {
    format!(
        "Unable to fetch announcements from any source. No announcement for tracked symbols: {tracked}"
    )
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

pub fn format_heartbeat(latest: &[AnnouncementRecord]) -> String {
    let mut text = "💓 BOT HEARTBEAT - Top 3 Latest Announcements:\n\n".to_string();
    for (i, record) in latest.iter().take(3).enumerate() {
        text.push_str(&format!(
            "{}. {} ({})\n   {}...\n\n",
            i + 1,
            record.entity_id,
            record.date,
            truncate_chars(&record.title, 60)
        ));
    }
    text.trim_end().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    Sent,
    Skipped,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    /// Carries no URL: the send URL embeds the bot token.
    #[error("notification request failed: {0}")]
    Request(reqwest::Error),
    #[error("notification rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Capability: best-effort, single-attempt message delivery.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, text: &str) -> Result<Delivery, NotifyError>;
}

#[derive(Debug)]
pub struct TelegramNotifier {
    client: reqwest::Client,
    api_base: String,
    credentials: Option<BotCredentials>,
}

impl TelegramNotifier {
    pub fn new(api_base: impl Into<String>, credentials: Option<BotCredentials>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("building notifier client")?;
        Ok(Self {
            client,
            api_base: api_base.into(),
            credentials,
        })
    }

    fn send_url(&self, credentials: &BotCredentials) -> String {
        format!(
            "{}/bot{}/sendMessage",
            self.api_base.trim_end_matches('/'),
            credentials.token
        )
    }

    fn payload(credentials: &BotCredentials, text: &str) -> serde_json::Value {
        let chat_id = match credentials.chat_id.parse::<i64>() {
            Ok(id) => json!(id),
            Err(_) => json!(credentials.chat_id),
        };
        json!({
            "chat_id": chat_id,
            "text": text,
            "disable_web_page_preview": true,
        })
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn deliver(&self, text: &str) -> Result<Delivery, NotifyError> {
        let Some(credentials) = &self.credentials else {
            info!("delivery skipped: no credentials configured");
            return Ok(Delivery::Skipped);
        };
        let resp = self
            .client
            .post(self.send_url(credentials))
            .json(&Self::payload(credentials, text))
            .send()
            .await
            .map_err(|err| NotifyError::Request(err.without_url()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(Delivery::Sent)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Full announcement notice delivered and state persisted.
    Delivered,
    /// Placeholder content: persisted, never announced.
    Templated,
    /// Ignore keyword: persisted, never announced.
    Ignored,
    NotTracked,
    Unchanged,
    NoData,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub outcome: RunOutcome,
    pub source: Option<SourceKind>,
    pub record: Option<AnnouncementRecord>,
    pub classification: Option<Classification>,
    pub persisted: bool,
    pub forced: bool,
    pub notices_sent: usize,
}

impl RunSummary {
    fn new(run_id: Uuid, outcome: RunOutcome) -> Self {
        Self {
            run_id,
            outcome,
            source: None,
            record: None,
            classification: None,
            persisted: false,
            forced: false,
            notices_sent: 0,
        }
    }
}

pub struct WatchPipeline {
    config: WatchConfig,
    http: Box<dyn Fetch>,
    notifier: Box<dyn Notifier>,
    state: Box<dyn StateStore>,
    primary: Box<dyn AnnouncementSource>,
    fallback: Box<dyn AnnouncementSource>,
    xbrl: XbrlAnnouncementSource,
    rules: ClassificationRules,
    normalize_options: NormalizeOptions,
}

impl WatchPipeline {
    pub fn new(config: WatchConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        let notifier =
            TelegramNotifier::new(config.telegram_api_base.clone(), config.credentials.clone())?;
        let state = JsonStateStore::new(config.state_path.clone());
        let primary = ApiAnnouncementSource {
            url: config.api_url.clone(),
            referer: config.html_url.clone(),
            origin: DEFAULT_SITE_ORIGIN.to_string(),
            user_agent: config.user_agent.clone(),
        };
        let fallback = HtmlAnnouncementSource {
            url: config.html_url.clone(),
            user_agent: config.user_agent.clone(),
        };
        let xbrl = XbrlAnnouncementSource {
            url: config.xbrl_url.clone(),
            origin: DEFAULT_SITE_ORIGIN.to_string(),
            user_agent: config.user_agent.clone(),
        };
        let rules = match &config.rules_file {
            Some(path) => ClassificationRules::from_yaml_path(path).unwrap_or_else(|err| {
                warn!(error = %format!("{err:#}"), "falling back to built-in classification rules");
                ClassificationRules::builtin()
            }),
            None => ClassificationRules::builtin(),
        };

        Ok(Self {
            config,
            http: Box::new(http),
            notifier: Box::new(notifier),
            state: Box::new(state),
            primary: Box::new(primary),
            fallback: Box::new(fallback),
            xbrl,
            rules,
            normalize_options: NormalizeOptions::default(),
        })
    }

    pub fn with_fetcher(mut self, http: Box<dyn Fetch>) -> Self {
        self.http = http;
        self
    }

    pub fn with_notifier(mut self, notifier: Box<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_state_store(mut self, state: Box<dyn StateStore>) -> Self {
        self.state = state;
        self
    }

    pub fn with_rules(mut self, rules: ClassificationRules) -> Self {
        self.rules = rules;
        self
    }

    /// One poll-diff-notify cycle. Fetch, extraction and delivery failures end the run
    /// quietly; only a failed state write is returned as an error.
    pub async fn run_once(&self, target_date: NaiveDate) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("watch_run", %run_id, %target_date);
        self.run_inner(SourceContext { run_id, target_date })
            .instrument(span)
            .await
    }

    async fn run_inner(&self, ctx: SourceContext) -> Result<RunSummary> {
        let previous = self.state.load().await;
        let tracked = &self.config.tracked;

        let Some((source, rows)) = self.fetch_rows(&ctx).await else {
            warn!("no announcement data from any source");
            let mut summary = RunSummary::new(ctx.run_id, RunOutcome::NoData);
            if !tracked.is_empty() {
                summary.notices_sent += self.deliver(&format_fetch_failed(tracked)).await;
            }
            return Ok(summary);
        };

        let normalized: Vec<NormalizedAnnouncement> = rows
            .iter()
            .map(|raw| normalize(raw, &self.normalize_options))
            .collect();
        let candidate = normalized
            .iter()
            .find(|n| matches(&n.record, tracked))
            .or_else(|| normalized.first())
            .cloned()
            .context("source returned rows but none normalized")?;

        let mut summary = RunSummary::new(ctx.run_id, RunOutcome::NoData);
        summary.source = Some(source);
        summary.record = Some(candidate.record.clone());

        if candidate.templated {
            warn!(
                %source,
                title = %candidate.record.title,
                "templated content detected; recording state without notifying"
            );
            self.persist(&candidate.record).await?;
            summary.outcome = RunOutcome::Templated;
            summary.persisted = true;
            return Ok(summary);
        }

        let matched = matching_tokens(&candidate.record, tracked);
        if matched.is_empty() {
            info!(entity = %candidate.record.entity_id, "announcement is not for a tracked symbol");
            summary.outcome = RunOutcome::NotTracked;
            summary.notices_sent += self.deliver(&format_no_new(tracked)).await;
            summary.notices_sent += self.maybe_heartbeat(&normalized).await;
            return Ok(summary);
        }

        if !is_new(&candidate.record, previous.as_ref()) {
            if !self.config.force_send {
                info!(entity = %candidate.record.entity_id, "announcement unchanged since last run");
                summary.outcome = RunOutcome::Unchanged;
                summary.notices_sent += self.deliver(&format_no_new(tracked)).await;
                summary.notices_sent += self.maybe_heartbeat(&normalized).await;
                return Ok(summary);
            }
            warn!(entity = %candidate.record.entity_id, "force override active; re-delivering unchanged announcement");
            summary.forced = true;
        }

        let Some(classification) = self.rules.classify(&candidate.record.title) else {
            info!(title = %candidate.record.title, "ignore keyword matched; recording state without notifying");
            self.persist(&candidate.record).await?;
            summary.outcome = RunOutcome::Ignored;
            summary.persisted = true;
            return Ok(summary);
        };

        let message = inject_lodr_marker(
            &candidate.record.title,
            format_announcement(&candidate, &classification, &matched),
            self.config.lodr_test_emoji.as_deref(),
        );
        summary.notices_sent += self.deliver(&message).await;
        self.persist(&candidate.record).await?;
        info!(
            entity = %candidate.record.entity_id,
            label = %classification.label,
            "announcement delivered"
        );

        summary.outcome = RunOutcome::Delivered;
        summary.classification = Some(classification);
        summary.persisted = true;
        Ok(summary)
    }

    /// Primary rows when there are any, else fallback rows, else `None`.
    async fn fetch_rows(&self, ctx: &SourceContext) -> Option<(SourceKind, Vec<RawAnnouncement>)> {
        for source in [&self.primary, &self.fallback] {
            match source.fetch(self.http.as_ref(), ctx).await {
                Ok(rows) if !rows.is_empty() => return Some((source.kind(), rows)),
                Ok(_) => info!(source_id = source.source_id(), "source returned no rows"),
                Err(err) => warn!(source_id = source.source_id(), error = %err, "source failed"),
            }
        }
        None
    }

    async fn deliver(&self, text: &str) -> usize {
        match self.notifier.deliver(text).await {
            Ok(Delivery::Sent) => 1,
            Ok(Delivery::Skipped) => 0,
            Err(err) => {
                warn!(error = %err, "notification delivery failed");
                0
            }
        }
    }

    async fn maybe_heartbeat(&self, normalized: &[NormalizedAnnouncement]) -> usize {
        if !self.config.heartbeat || normalized.is_empty() {
            return 0;
        }
        let latest: Vec<AnnouncementRecord> =
            normalized.iter().take(3).map(|n| n.record.clone()).collect();
        self.deliver(&format_heartbeat(&latest)).await
    }

    async fn persist(&self, record: &AnnouncementRecord) -> Result<()> {
        self.state.save(record).await.context("persisting last-seen state")
    }

    /// Tracked rows for one day; no delivery, no persistence.
    pub async fn scan(&self, target_date: NaiveDate) -> Result<Vec<NormalizedAnnouncement>> {
        self.sweep(target_date, target_date).await
    }

    /// Tracked announcements for every day in `from..=to`, de-duplicated on date, entity and
    /// title. A day whose listing holds no tracked rows falls back to one XBRL lookup per
    /// tracked symbol; a day whose listing cannot be fetched is skipped.
    pub async fn sweep(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<NormalizedAnnouncement>> {
        anyhow::ensure!(from <= to, "sweep range starts after it ends: {from} > {to}");
        let span = info_span!("sweep", %from, %to);
        async {
            let mut seen = HashSet::new();
            let mut found = Vec::new();
            for day in from.iter_days().take_while(|day| *day <= to) {
                for ann in self.sweep_day(day).await {
                    let key = (
                        ann.record.date.clone(),
                        ann.record.entity_id.clone(),
                        ann.record.title.clone(),
                    );
                    if seen.insert(key) {
                        found.push(ann);
                    }
                }
            }
            info!(matches = found.len(), "sweep complete");
            Ok(found)
        }
        .instrument(span)
        .await
    }

    async fn sweep_day(&self, day: NaiveDate) -> Vec<NormalizedAnnouncement> {
        let ctx = SourceContext {
            run_id: Uuid::new_v4(),
            target_date: day,
        };
        let tracked = &self.config.tracked;
        let rows = match self.primary.fetch(self.http.as_ref(), &ctx).await {
            Ok(rows) => rows,
            Err(AdapterError::Fetch(err)) => {
                warn!(%day, source_id = self.primary.source_id(), error = %err, "listing fetch failed");
                return Vec::new();
            }
            Err(err) => {
                warn!(%day, source_id = self.primary.source_id(), error = %err, "unreadable listing");
                Vec::new()
            }
        };
        let listed: Vec<NormalizedAnnouncement> = rows
            .iter()
            .map(|raw| normalize(raw, &self.normalize_options))
            .filter(|n| matches(&n.record, tracked))
            .collect();
        if !listed.is_empty() {
            return listed;
        }

        let mut filed = Vec::new();
        for token in tracked.tokens() {
            match self.xbrl.fetch_for(self.http.as_ref(), token, day).await {
                Ok(Some(raw)) => filed.push(normalize(&raw, &self.normalize_options)),
                Ok(None) => debug!(%day, %token, "no xbrl filing"),
                Err(err) => debug!(%day, %token, error = %err, "xbrl lookup failed"),
            }
        }
        filed
    }
}

pub async fn run_once_from_env() -> Result<RunSummary> {
    let config = WatchConfig::from_env();
    config.log_redacted();
    WatchPipeline::new(config)?.run_once(exchange_today()).await
}
