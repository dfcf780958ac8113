use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::error::{KbError, Result};

/// Opaque tenant identifier. Every persisted entity carries one and every
/// query must be scoped by one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct TenantId(pub String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Site identifier, unique within a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct SiteId(pub String);

impl SiteId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct DocumentId(pub Uuid);

impl DocumentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ChunkId(pub Uuid);

impl ChunkId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ChunkId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The mandatory predicate carrier for every storage query. Constructing
/// one with an empty tenant id fails, so an unscoped query cannot be built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantScope {
    pub tenant_id: TenantId,
    pub site_id: SiteId,
}

impl TenantScope {
    pub fn new(tenant_id: TenantId, site_id: SiteId) -> Result<Self> {
        if tenant_id.as_str().trim().is_empty() || site_id.as_str().trim().is_empty() {
            return Err(KbError::TenantScopeMissing);
        }
        Ok(Self { tenant_id, site_id })
    }

    /// Stable cache/tag key for this scope.
    pub fn tag(&self) -> String {
        format!("{}:{}", self.tenant_id, self.site_id)
    }
}

impl fmt::Display for TenantScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.site_id)
    }
}

/// Embedding model selection; the vector column dimension is fixed by this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EmbeddingModel {
    /// 1536-dimensional model (default).
    Small1536,
    /// 3072-dimensional model.
    Large3072,
}

impl EmbeddingModel {
    pub fn dimensions(&self) -> usize {
        match self {
            EmbeddingModel::Small1536 => 1536,
            EmbeddingModel::Large3072 => 3072,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EmbeddingModel::Small1536 => "text-embedding-3-small",
            EmbeddingModel::Large3072 => "text-embedding-3-large",
        }
    }
}

impl Default for EmbeddingModel {
    fn default() -> Self {
        EmbeddingModel::Small1536
    }
}

/// A canonicalized URL for a site. Exists from first successful fetch
/// until explicit deletion; `(tenant_id, site_id, canonical_url)` is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub tenant_id: TenantId,
    pub site_id: SiteId,
    pub canonical_url: String,
    pub title: Option<String>,
    pub lastmod: Option<DateTime<Utc>>,
    pub etag: Option<String>,
    pub last_modified_header: Option<String>,
    pub locale: Option<String>,
    pub content_hash: String,
    pub fetched_at: DateTime<Utc>,
}

/// A bounded-size semantic fragment of a document, the unit of embedding
/// and retrieval. `(document_id, chunk_index)` and `(site_id, content_hash)`
/// are unique; an unchanged `content_hash` is never re-embedded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub tenant_id: TenantId,
    pub site_id: SiteId,
    pub document_id: DocumentId,
    pub chunk_index: i32,
    pub content: String,
    pub cleaned_content: String,
    pub content_hash: String,
    pub token_count: i32,
    pub locale: Option<String>,
    pub section: Option<String>,
    pub heading: Option<String>,
    pub selector: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub embedding: Option<Vec<f32>>,
}

/// A JSON-LD entity extracted from a page, indexed alongside chunks for
/// structured-query boosts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredEntity {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub site_id: SiteId,
    pub document_id: DocumentId,
    pub entity_type: String,
    pub properties: serde_json::Value,
    pub confidence: f32,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum ActionKind {
    Navigation,
    Form,
    Button,
    Api,
    Custom,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Navigation => "navigation",
            ActionKind::Form => "form",
            ActionKind::Button => "button",
            ActionKind::Api => "api",
            ActionKind::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum SideEffect {
    Safe,
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// A typed parameter of an executable action, mirrored into the action's
/// JSON Schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ActionParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: String,
    pub label: Option<String>,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_length: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_length: Option<u32>,
}

/// A machine-executable interaction derived from the site's DOM.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ActionDescriptor {
    pub id: String,
    pub name: String,
    pub kind: ActionKind,
    pub description: String,
    pub selector: String,
    pub parameters: Vec<ActionParameter>,
    pub side_effecting: SideEffect,
    pub risk_level: RiskLevel,
    pub requires_confirmation: bool,
    pub requires_auth: bool,
    #[cfg_attr(feature = "openapi", schema(value_type = Object))]
    pub json_schema: serde_json::Value,
    /// Category inferred from surrounding context (commerce, booking, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Page the action was discovered on; used for manifest lookups by URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum Capability {
    Navigation,
    Search,
    HasContactForm,
    HasNewsletter,
    HasEcommerce,
    HasBooking,
    HasAuthentication,
    HasSearch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct SecuritySettings {
    pub allowed_origins: Vec<String>,
    pub require_https: bool,
    pub csrf_protection: bool,
    pub allowed_methods: Vec<String>,
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
            require_https: true,
            csrf_protection: true,
            allowed_methods: vec!["GET".to_string(), "POST".to_string()],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct PrivacySettings {
    /// CSS selectors of fields that must never be echoed or logged.
    pub sensitive_selectors: Vec<String>,
}

/// Per-site catalog of executable actions and derived capabilities.
/// Regenerated as the final step of every crawl; `version` doubles as the
/// corpus version surfaced in search responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct SiteManifest {
    pub schema_version: String,
    pub site_id: SiteId,
    pub version: i64,
    pub generated_at: DateTime<Utc>,
    pub actions: Vec<ActionDescriptor>,
    pub capabilities: Vec<Capability>,
    pub security_settings: SecuritySettings,
    pub privacy_settings: PrivacySettings,
}

pub const MANIFEST_SCHEMA_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum SessionType {
    Full,
    Delta,
}

impl SessionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionType::Full => "full",
            SessionType::Delta => "delta",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum SessionState {
    Pending,
    Discovering,
    Fetching,
    Processing,
    Done,
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Pending => "pending",
            SessionState::Discovering => "discovering",
            SessionState::Fetching => "fetching",
            SessionState::Processing => "processing",
            SessionState::Done => "done",
            SessionState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Done | SessionState::Failed)
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(SessionState::Pending),
            "discovering" => Ok(SessionState::Discovering),
            "fetching" => Ok(SessionState::Fetching),
            "processing" => Ok(SessionState::Processing),
            "done" => Ok(SessionState::Done),
            "failed" => Ok(SessionState::Failed),
            other => Err(KbError::InvalidInput(format!(
                "unknown session state: {other}"
            ))),
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct SessionCounters {
    pub urls_discovered: u64,
    pub urls_fetched: u64,
    pub urls_changed: u64,
    pub urls_unchanged: u64,
    pub urls_failed: u64,
    pub chunks_upserted: u64,
    pub chunks_skipped: u64,
    pub embeddings_generated: u64,
}

/// One attempt to synchronize a site with its source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlSession {
    pub id: SessionId,
    pub tenant_id: TenantId,
    pub site_id: SiteId,
    pub session_type: SessionType,
    pub state: SessionState,
    pub counters: SessionCounters,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

/// Quota dimension. Each accumulates over its own window before reset;
/// `Storage` is an absolute gauge with no window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum BudgetDimension {
    Tokens,
    Actions,
    ApiCalls,
    VoiceMinutes,
    Storage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetWindow {
    Hour,
    Day,
    Month,
    None,
}

impl BudgetDimension {
    pub fn window(&self) -> BudgetWindow {
        match self {
            BudgetDimension::Tokens | BudgetDimension::VoiceMinutes => BudgetWindow::Month,
            BudgetDimension::Actions => BudgetWindow::Day,
            BudgetDimension::ApiCalls => BudgetWindow::Hour,
            BudgetDimension::Storage => BudgetWindow::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetDimension::Tokens => "tokens",
            BudgetDimension::Actions => "actions",
            BudgetDimension::ApiCalls => "apiCalls",
            BudgetDimension::VoiceMinutes => "voiceMinutes",
            BudgetDimension::Storage => "storage",
        }
    }

    pub const ALL: [BudgetDimension; 5] = [
        BudgetDimension::Tokens,
        BudgetDimension::Actions,
        BudgetDimension::ApiCalls,
        BudgetDimension::VoiceMinutes,
        BudgetDimension::Storage,
    ];
}

impl fmt::Display for BudgetDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct BudgetLimits {
    pub tokens_per_month: f64,
    pub actions_per_day: f64,
    pub api_calls_per_hour: f64,
    pub voice_minutes_per_month: f64,
    pub storage_bytes: f64,
}

impl BudgetLimits {
    pub fn get(&self, dimension: BudgetDimension) -> f64 {
        match dimension {
            BudgetDimension::Tokens => self.tokens_per_month,
            BudgetDimension::Actions => self.actions_per_day,
            BudgetDimension::ApiCalls => self.api_calls_per_hour,
            BudgetDimension::VoiceMinutes => self.voice_minutes_per_month,
            BudgetDimension::Storage => self.storage_bytes,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct BudgetUsage {
    pub tokens: f64,
    pub actions: f64,
    pub api_calls: f64,
    pub voice_minutes: f64,
    pub storage_bytes: f64,
}

impl BudgetUsage {
    pub fn get(&self, dimension: BudgetDimension) -> f64 {
        match dimension {
            BudgetDimension::Tokens => self.tokens,
            BudgetDimension::Actions => self.actions,
            BudgetDimension::ApiCalls => self.api_calls,
            BudgetDimension::VoiceMinutes => self.voice_minutes,
            BudgetDimension::Storage => self.storage_bytes,
        }
    }

    pub fn set(&mut self, dimension: BudgetDimension, value: f64) {
        match dimension {
            BudgetDimension::Tokens => self.tokens = value,
            BudgetDimension::Actions => self.actions = value,
            BudgetDimension::ApiCalls => self.api_calls = value,
            BudgetDimension::VoiceMinutes => self.voice_minutes = value,
            BudgetDimension::Storage => self.storage_bytes = value,
        }
    }
}

/// Start instants of the currently accumulating window, per dimension.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ResetDates {
    pub tokens: DateTime<Utc>,
    pub actions: DateTime<Utc>,
    pub api_calls: DateTime<Utc>,
    pub voice_minutes: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct OveragePolicy {
    pub allow_overage: bool,
    /// Cost per unit of overage, keyed by dimension name.
    pub unit_costs: HashMap<String, f64>,
}

impl Default for OveragePolicy {
    fn default() -> Self {
        Self {
            allow_overage: false,
            unit_costs: HashMap::new(),
        }
    }
}

/// Per-(tenant, site) quotas and cumulative usage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ResourceBudget {
    pub tenant_id: TenantId,
    pub site_id: SiteId,
    pub limits: BudgetLimits,
    pub usage: BudgetUsage,
    pub reset_dates: ResetDates,
    pub overage_policy: OveragePolicy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_scope_rejects_empty_tenant() {
        let err = TenantScope::new(TenantId::new(""), SiteId::new("site-1"));
        assert!(matches!(err, Err(KbError::TenantScopeMissing)));

        let err = TenantScope::new(TenantId::new("t1"), SiteId::new("  "));
        assert!(matches!(err, Err(KbError::TenantScopeMissing)));
    }

    #[test]
    fn tenant_scope_tag_is_stable() {
        let scope = TenantScope::new(TenantId::new("t1"), SiteId::new("s1")).unwrap();
        assert_eq!(scope.tag(), "t1:s1");
    }

    #[test]
    fn session_state_round_trips() {
        for state in [
            SessionState::Pending,
            SessionState::Discovering,
            SessionState::Fetching,
            SessionState::Processing,
            SessionState::Done,
            SessionState::Failed,
        ] {
            assert_eq!(SessionState::parse(state.as_str()).unwrap(), state);
        }
        assert!(SessionState::parse("bogus").is_err());
    }

    #[test]
    fn budget_dimension_windows() {
        assert_eq!(BudgetDimension::Tokens.window(), BudgetWindow::Month);
        assert_eq!(BudgetDimension::Actions.window(), BudgetWindow::Day);
        assert_eq!(BudgetDimension::ApiCalls.window(), BudgetWindow::Hour);
        assert_eq!(BudgetDimension::Storage.window(), BudgetWindow::None);
    }

    #[test]
    fn embedding_model_dimensions() {
        assert_eq!(EmbeddingModel::Small1536.dimensions(), 1536);
        assert_eq!(EmbeddingModel::Large3072.dimensions(), 3072);
    }
}
