use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;

use sitekb_common::{
    BudgetDimension, BudgetLimits, KbError, OveragePolicy, ResetDates, ResourceBudget, Result,
    SiteId, TenantId, TenantScope,
};

use crate::postgres::map_sqlx_err;

/// JSON key of a dimension inside `usage_json` / `reset_dates_json`.
/// Matches the camelCase serde layout of `BudgetUsage` / `ResetDates`.
fn usage_key(dimension: BudgetDimension) -> &'static str {
    match dimension {
        BudgetDimension::Tokens => "tokens",
        BudgetDimension::Actions => "actions",
        BudgetDimension::ApiCalls => "apiCalls",
        BudgetDimension::VoiceMinutes => "voiceMinutes",
        BudgetDimension::Storage => "storageBytes",
    }
}

/// Persistence for per-(tenant, site) budgets. Counter mutation is a single
/// conditional SQL statement so concurrent writers serialize on the row.
pub struct BudgetStore {
    pool: PgPool,
}

impl BudgetStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, scope: &TenantScope) -> Result<Option<ResourceBudget>> {
        let row = sqlx::query(
            "SELECT limits_json, usage_json, reset_dates_json, overage_policy_json
             FROM resource_budgets WHERE tenant_id = $1 AND site_id = $2",
        )
        .bind(scope.tenant_id.as_str())
        .bind(scope.site_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        match row {
            Some(row) => Ok(Some(budget_from_row(scope, &row)?)),
            None => Ok(None),
        }
    }

    /// Fetch the budget, materializing a tier-default one if the pair has
    /// never been seen.
    #[instrument(skip(self, defaults), fields(scope = %scope))]
    pub async fn get_or_create(
        &self,
        scope: &TenantScope,
        defaults: &BudgetLimits,
        now: DateTime<Utc>,
    ) -> Result<ResourceBudget> {
        if let Some(budget) = self.get(scope).await? {
            return Ok(budget);
        }

        let reset_dates = ResetDates {
            tokens: now,
            actions: now,
            api_calls: now,
            voice_minutes: now,
        };
        sqlx::query(
            "INSERT INTO resource_budgets
                (tenant_id, site_id, limits_json, usage_json, reset_dates_json, overage_policy_json)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (tenant_id, site_id) DO NOTHING",
        )
        .bind(scope.tenant_id.as_str())
        .bind(scope.site_id.as_str())
        .bind(serde_json::to_value(defaults)?)
        .bind(serde_json::to_value(sitekb_common::BudgetUsage::default())?)
        .bind(serde_json::to_value(reset_dates)?)
        .bind(serde_json::to_value(OveragePolicy::default())?)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        self.get(scope)
            .await?
            .ok_or_else(|| KbError::Backend("budget vanished after insert".to_string()))
    }

    /// Atomically add `amount` to a cumulative dimension; returns the new
    /// total.
    pub async fn record_delta(
        &self,
        scope: &TenantScope,
        dimension: BudgetDimension,
        amount: f64,
    ) -> Result<f64> {
        let key = usage_key(dimension);
        let row = sqlx::query(
            "UPDATE resource_budgets
             SET usage_json = jsonb_set(usage_json, ARRAY[$3::text],
                 to_jsonb(COALESCE((usage_json->>$3)::float8, 0) + $4))
             WHERE tenant_id = $1 AND site_id = $2
             RETURNING (usage_json->>$3)::float8 AS total",
        )
        .bind(scope.tenant_id.as_str())
        .bind(scope.site_id.as_str())
        .bind(key)
        .bind(amount)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        match row {
            Some(row) => Ok(row.try_get("total").map_err(map_sqlx_err)?),
            None => Err(KbError::NotFound(format!("no budget for {scope}"))),
        }
    }

    /// Storage is an absolute gauge kept as a high-water mark.
    pub async fn record_gauge(&self, scope: &TenantScope, amount: f64) -> Result<f64> {
        let key = usage_key(BudgetDimension::Storage);
        let row = sqlx::query(
            "UPDATE resource_budgets
             SET usage_json = jsonb_set(usage_json, ARRAY[$3::text],
                 to_jsonb(GREATEST(COALESCE((usage_json->>$3)::float8, 0), $4)))
             WHERE tenant_id = $1 AND site_id = $2
             RETURNING (usage_json->>$3)::float8 AS total",
        )
        .bind(scope.tenant_id.as_str())
        .bind(scope.site_id.as_str())
        .bind(key)
        .bind(amount)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        match row {
            Some(row) => Ok(row.try_get("total").map_err(map_sqlx_err)?),
            None => Err(KbError::NotFound(format!("no budget for {scope}"))),
        }
    }

    /// Zero a windowed dimension and advance its reset date, conditional on
    /// the stored date still matching `expected_reset`. Exactly one of any
    /// set of racing callers wins; the rest observe `false` and re-read.
    pub async fn reset_window(
        &self,
        scope: &TenantScope,
        dimension: BudgetDimension,
        expected_reset: DateTime<Utc>,
        new_reset: DateTime<Utc>,
    ) -> Result<bool> {
        let key = usage_key(dimension);
        let result = sqlx::query(
            "UPDATE resource_budgets
             SET usage_json = jsonb_set(usage_json, ARRAY[$3::text], to_jsonb(0::float8)),
                 reset_dates_json = jsonb_set(reset_dates_json, ARRAY[$3::text],
                                              to_jsonb($5::timestamptz))
             WHERE tenant_id = $1 AND site_id = $2
               AND (reset_dates_json->>$3)::timestamptz = $4::timestamptz",
        )
        .bind(scope.tenant_id.as_str())
        .bind(scope.site_id.as_str())
        .bind(key)
        .bind(expected_reset)
        .bind(new_reset)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn update_limits(
        &self,
        scope: &TenantScope,
        limits: &BudgetLimits,
        overage_policy: Option<&OveragePolicy>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE resource_budgets
             SET limits_json = $3,
                 overage_policy_json = COALESCE($4, overage_policy_json)
             WHERE tenant_id = $1 AND site_id = $2",
        )
        .bind(scope.tenant_id.as_str())
        .bind(scope.site_id.as_str())
        .bind(serde_json::to_value(limits)?)
        .bind(overage_policy.map(serde_json::to_value).transpose()?)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        if result.rows_affected() == 0 {
            return Err(KbError::NotFound(format!("no budget for {scope}")));
        }
        Ok(())
    }

    /// Every budget row, for the background resetter's scan.
    pub async fn list_all(&self) -> Result<Vec<ResourceBudget>> {
        let rows = sqlx::query(
            "SELECT tenant_id, site_id, limits_json, usage_json, reset_dates_json,
                    overage_policy_json
             FROM resource_budgets",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        rows.into_iter()
            .map(|row| {
                let tenant: String = row.try_get("tenant_id").map_err(map_sqlx_err)?;
                let site: String = row.try_get("site_id").map_err(map_sqlx_err)?;
                let scope = TenantScope::new(TenantId::new(tenant), SiteId::new(site))?;
                budget_from_row(&scope, &row)
            })
            .collect()
    }
}

fn budget_from_row(scope: &TenantScope, row: &sqlx::postgres::PgRow) -> Result<ResourceBudget> {
    let limits: serde_json::Value = row.try_get("limits_json").map_err(map_sqlx_err)?;
    let usage: serde_json::Value = row.try_get("usage_json").map_err(map_sqlx_err)?;
    let resets: serde_json::Value = row.try_get("reset_dates_json").map_err(map_sqlx_err)?;
    let overage: serde_json::Value = row.try_get("overage_policy_json").map_err(map_sqlx_err)?;
    Ok(ResourceBudget {
        tenant_id: scope.tenant_id.clone(),
        site_id: scope.site_id.clone(),
        limits: serde_json::from_value(limits)?,
        usage: serde_json::from_value(usage)?,
        reset_dates: serde_json::from_value(resets)?,
        overage_policy: serde_json::from_value(overage)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_keys_match_serde_layout() {
        let usage = sitekb_common::BudgetUsage {
            tokens: 1.0,
            actions: 2.0,
            api_calls: 3.0,
            voice_minutes: 4.0,
            storage_bytes: 5.0,
        };
        let value = serde_json::to_value(usage).unwrap();
        for dimension in BudgetDimension::ALL {
            assert!(
                value.get(usage_key(dimension)).is_some(),
                "serde layout is missing {}",
                usage_key(dimension)
            );
        }
    }
}
