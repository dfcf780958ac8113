use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use sitekb_common::{
    BudgetConfig, BudgetDimension, BudgetLimits, BudgetWindow, ResourceBudget, Result, TenantScope,
};
use sitekb_storage::BudgetStore;

use crate::windows::{next_reset, window_start};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetCheck {
    pub allowed: bool,
    pub remaining: f64,
    pub budget: f64,
    pub overage_allowed: bool,
    pub estimated_cost: f64,
    pub reset_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetRecord {
    pub new_total: f64,
    pub remaining: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationSuggestion {
    pub kind: String,
    pub description: String,
    /// Estimated fraction of the strained budget this could save.
    pub estimated_impact: f64,
}

fn reset_of(budget: &ResourceBudget, dimension: BudgetDimension) -> Option<DateTime<Utc>> {
    match dimension {
        BudgetDimension::Tokens => Some(budget.reset_dates.tokens),
        BudgetDimension::Actions => Some(budget.reset_dates.actions),
        BudgetDimension::ApiCalls => Some(budget.reset_dates.api_calls),
        BudgetDimension::VoiceMinutes => Some(budget.reset_dates.voice_minutes),
        BudgetDimension::Storage => None,
    }
}

/// Quota check/record for tokens, actions, API calls, voice minutes, and
/// storage. Counters roll over lazily on access and eagerly through the
/// background resetter; both paths go through the same conditional SQL
/// update, so a window resets exactly once.
pub struct BudgetController {
    store: BudgetStore,
    config: BudgetConfig,
}

impl BudgetController {
    pub fn new(store: BudgetStore, config: BudgetConfig) -> Self {
        Self { store, config }
    }

    fn default_limits(&self) -> BudgetLimits {
        BudgetLimits {
            tokens_per_month: self.config.default_tokens_per_month,
            actions_per_day: self.config.default_actions_per_day,
            api_calls_per_hour: self.config.default_api_calls_per_hour,
            voice_minutes_per_month: self.config.default_voice_minutes_per_month,
            storage_bytes: self.config.default_storage_bytes,
        }
    }

    /// Roll a dimension's window forward if `now` has crossed its boundary.
    /// Returns true when a reset was applied (by us or lost to a racer).
    async fn maybe_rollover(
        &self,
        scope: &TenantScope,
        budget: &ResourceBudget,
        dimension: BudgetDimension,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let window = dimension.window();
        if window == BudgetWindow::None {
            return Ok(false);
        }
        let Some(stored) = reset_of(budget, dimension) else {
            return Ok(false);
        };
        let current = window_start(now, window);
        if stored >= current {
            return Ok(false);
        }
        let applied = self
            .store
            .reset_window(scope, dimension, stored, current)
            .await?;
        if applied {
            info!(scope = %scope, dimension = %dimension, "budget window reset");
        } else {
            debug!(scope = %scope, dimension = %dimension, "reset raced, already applied");
        }
        Ok(true)
    }

    async fn fresh_budget(
        &self,
        scope: &TenantScope,
        dimension: BudgetDimension,
        now: DateTime<Utc>,
    ) -> Result<ResourceBudget> {
        let budget = self
            .store
            .get_or_create(scope, &self.default_limits(), now)
            .await?;
        if self.maybe_rollover(scope, &budget, dimension, now).await? {
            return self
                .store
                .get_or_create(scope, &self.default_limits(), now)
                .await;
        }
        Ok(budget)
    }

    #[instrument(skip(self), fields(scope = %scope, dimension = %dimension))]
    pub async fn check(
        &self,
        scope: &TenantScope,
        dimension: BudgetDimension,
        amount: f64,
    ) -> Result<BudgetCheck> {
        let now = Utc::now();
        let budget = self.fresh_budget(scope, dimension, now).await?;

        let limit = budget.limits.get(dimension);
        let usage = budget.usage.get(dimension);
        let remaining = (limit - usage).max(0.0);
        let allowed = usage + amount <= limit;

        let overage_units = (usage + amount - limit).max(0.0);
        let unit_cost = budget
            .overage_policy
            .unit_costs
            .get(dimension.as_str())
            .copied()
            .unwrap_or(0.0);

        let reset_time = reset_of(&budget, dimension)
            .map(|start| next_reset(window_start(now, dimension.window()).max(start), dimension.window()));

        Ok(BudgetCheck {
            allowed,
            remaining,
            budget: limit,
            overage_allowed: budget.overage_policy.allow_overage,
            estimated_cost: overage_units * unit_cost,
            reset_time,
        })
    }

    #[instrument(skip(self), fields(scope = %scope, dimension = %dimension, amount))]
    pub async fn record(
        &self,
        scope: &TenantScope,
        dimension: BudgetDimension,
        amount: f64,
    ) -> Result<BudgetRecord> {
        let now = Utc::now();
        let budget = self.fresh_budget(scope, dimension, now).await?;

        let new_total = match dimension {
            BudgetDimension::Storage => self.store.record_gauge(scope, amount).await?,
            _ => self.store.record_delta(scope, dimension, amount).await?,
        };

        let limit = budget.limits.get(dimension);
        let remaining = limit - new_total;
        let warning = if limit > 0.0 && new_total >= self.config.critical_threshold * limit {
            Some("High usage".to_string())
        } else if limit > 0.0 && new_total >= self.config.warn_threshold * limit {
            Some("Approaching budget limit".to_string())
        } else {
            None
        };
        if let Some(w) = &warning {
            warn!(scope = %scope, dimension = %dimension, new_total, limit, "{w}");
        }

        Ok(BudgetRecord {
            new_total,
            remaining,
            warning,
        })
    }

    pub async fn get(&self, scope: &TenantScope) -> Result<ResourceBudget> {
        self.store
            .get_or_create(scope, &self.default_limits(), Utc::now())
            .await
    }

    pub async fn update_limits(
        &self,
        scope: &TenantScope,
        limits: &BudgetLimits,
        overage: Option<&sitekb_common::OveragePolicy>,
    ) -> Result<()> {
        // Materialize first so PATCH works for never-seen pairs.
        self.store
            .get_or_create(scope, &self.default_limits(), Utc::now())
            .await?;
        self.store.update_limits(scope, limits, overage).await
    }

    /// Advisory only: inspect usage ratios and suggest mitigations, most
    /// impactful first.
    pub async fn generate_optimizations(
        &self,
        scope: &TenantScope,
    ) -> Result<Vec<OptimizationSuggestion>> {
        let budget = self.get(scope).await?;
        let mut suggestions = Vec::new();

        let ratio = |dimension: BudgetDimension| {
            let limit = budget.limits.get(dimension);
            if limit > 0.0 {
                budget.usage.get(dimension) / limit
            } else {
                0.0
            }
        };

        let tokens = ratio(BudgetDimension::Tokens);
        if tokens > 0.6 {
            suggestions.push(OptimizationSuggestion {
                kind: "aggressive-caching".to_string(),
                description: "Raise retrieval cache TTLs so repeated queries skip embedding calls"
                    .to_string(),
                estimated_impact: (tokens * 0.4).min(0.9),
            });
            suggestions.push(OptimizationSuggestion {
                kind: "prompt-shortening".to_string(),
                description: "Trim chunk context sent to downstream consumers".to_string(),
                estimated_impact: (tokens * 0.25).min(0.5),
            });
        }
        let api_calls = ratio(BudgetDimension::ApiCalls);
        if api_calls > 0.6 {
            suggestions.push(OptimizationSuggestion {
                kind: "request-batching".to_string(),
                description: "Batch embedding and search requests to cut per-call overhead"
                    .to_string(),
                estimated_impact: (api_calls * 0.3).min(0.6),
            });
        }
        let storage = ratio(BudgetDimension::Storage);
        if storage > 0.7 {
            suggestions.push(OptimizationSuggestion {
                kind: "storage-cleanup".to_string(),
                description: "Delete documents for URLs no longer present in the sitemap"
                    .to_string(),
                estimated_impact: (storage * 0.35).min(0.7),
            });
        }

        suggestions.sort_by(|a, b| {
            b.estimated_impact
                .partial_cmp(&a.estimated_impact)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(suggestions)
    }

    /// Background loop advancing due windows for every budget. Runs until
    /// cancelled; cadence from config.
    pub async fn run_resetter(self: Arc<Self>, cancel: CancellationToken) {
        let interval = std::time::Duration::from_secs(self.config.resetter_interval_secs.max(1));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("budget resetter stopped");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }

            let budgets = match self.store.list_all().await {
                Ok(budgets) => budgets,
                Err(e) => {
                    warn!(error = %e, "budget scan failed");
                    continue;
                }
            };
            let now = Utc::now();
            for budget in budgets {
                let Ok(scope) = TenantScope::new(budget.tenant_id.clone(), budget.site_id.clone())
                else {
                    continue;
                };
                for dimension in BudgetDimension::ALL {
                    if dimension.window() == BudgetWindow::None {
                        continue;
                    }
                    if let Err(e) = self.maybe_rollover(&scope, &budget, dimension, now).await {
                        warn!(scope = %scope, dimension = %dimension, error = %e, "rollover failed");
                    }
                }
            }
        }
    }
}
