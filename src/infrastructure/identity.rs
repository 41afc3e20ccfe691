//! Identity resolution against `internal.users`.
//!
//! The envelope only names an `external_user_id`; everything authorization
//! depends on (role, region) is read here and nowhere else.

use std::str::FromStr;

use sqlx::{postgres::PgRow, Row};

use crate::{
    domain::models::{Region, Role, UserIdentity},
    infrastructure::db::PgPool,
    services::errors::ServiceError,
};

pub async fn resolve(pool: &PgPool, external_user_id: &str) -> Result<UserIdentity, ServiceError> {
    let row = sqlx::query(
        r#"
        SELECT id, external_user_id, display_name, role, region, created_at
        FROM internal.users
        WHERE external_user_id = $1
        "#,
    )
    .bind(external_user_id)
    .fetch_optional(pool)
    .await
    .map_err(|err| ServiceError::Internal(err.to_string()))?;

    let Some(row) = row else {
        return Err(ServiceError::UnknownIdentity);
    };

    map_identity(row)
}

fn map_identity(row: PgRow) -> Result<UserIdentity, ServiceError> {
    let role_raw: String = row
        .try_get("role")
        .map_err(|err| ServiceError::Internal(err.to_string()))?;
    let role = Role::from_str(&role_raw).map_err(ServiceError::Internal)?;

    let region_raw: Option<String> = row
        .try_get("region")
        .map_err(|err| ServiceError::Internal(err.to_string()))?;
    let region = region_raw
        .as_deref()
        .map(Region::from_str)
        .transpose()
        .map_err(ServiceError::Internal)?;

    // Sales identities without a region would evade the row filter; refuse
    // to authenticate them rather than widen their access.
    if role == Role::Sales && region.is_none() {
        return Err(ServiceError::Internal(
            "sales identity is missing its region".to_string(),
        ));
    }

    Ok(UserIdentity {
        id: row
            .try_get("id")
            .map_err(|err| ServiceError::Internal(err.to_string()))?,
        external_user_id: row
            .try_get("external_user_id")
            .map_err(|err| ServiceError::Internal(err.to_string()))?,
        display_name: row
            .try_get("display_name")
            .map_err(|err| ServiceError::Internal(err.to_string()))?,
        role,
        region,
        created_at: row
            .try_get("created_at")
            .map_err(|err| ServiceError::Internal(err.to_string()))?,
    })
}
