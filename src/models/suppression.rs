use crate::domain::{Suppression, SuppressionReason};
use crate::schema::suppressions;
use crate::store::StoreError;
use chrono::{DateTime, Utc};

#[derive(Queryable, Selectable)]
#[diesel(table_name = suppressions)]
pub struct SuppressionRow {
    pub email: String,
    pub reason: String,
    pub source: Option<String>,
    pub bounce_type: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable)]
#[diesel(table_name = suppressions)]
pub struct NewSuppression<'a> {
    pub email: &'a str,
    #[diesel(embed)]
    pub changes: SuppressionChanges<'a>,
    pub created_at: &'a DateTime<Utc>,
}

/// Everything an upsert overwrites; `created_at` survives conflicts.
#[derive(Clone, Copy, Insertable, AsChangeset)]
#[diesel(table_name = suppressions, treat_none_as_null = true)]
pub struct SuppressionChanges<'a> {
    pub reason: &'a str,
    pub source: Option<&'a str>,
    pub bounce_type: Option<&'a str>,
    pub error_code: Option<&'a str>,
    pub error_message: Option<&'a str>,
    pub updated_at: &'a DateTime<Utc>,
}

impl TryFrom<SuppressionRow> for Suppression {
    type Error = StoreError;

    fn try_from(row: SuppressionRow) -> Result<Self, Self::Error> {
        let reason = SuppressionReason::try_from(row.reason.as_str()).map_err(StoreError::Corrupt)?;
        Ok(Suppression {
            email: row.email,
            reason,
            source: row.source,
            bounce_type: row.bounce_type,
            error_code: row.error_code,
            error_message: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
