//! Row-level-security context propagation.
//!
//! Database policies read the caller from `request.jwt.*` session settings.
//! The executor binds them with `set_config(..., true)` so the values are
//! scoped to the surrounding transaction and vanish on commit or rollback.

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::{Postgres, Transaction};

/// Binds the caller identity to the transaction as LOCAL session settings.
pub async fn set_rls_context(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Option<&str>,
    role: &str,
    claims: &Value,
) -> Result<()> {
    let claims_json = serde_json::to_string(claims).context("serialize RLS claims")?;
    sqlx::query(
        r#"
        SELECT
            set_config('request.jwt.claim.sub', $1, true),
            set_config('request.jwt.claim.role', $2, true),
            set_config('request.jwt.claims', $3, true)
        "#,
    )
    .bind(user_id.unwrap_or(""))
    .bind(role)
    .bind(claims_json)
    .execute(&mut **tx)
    .await
    .context("binding RLS context")?;
    Ok(())
}
