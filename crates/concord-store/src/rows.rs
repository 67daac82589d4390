//! Shared row <-> value conversions.

use chrono::{DateTime, SecondsFormat, Utc};
use concord_shared::Entity;
use rusqlite::types::Type;

/// Timestamps are written with a fixed precision so that text ordering in
/// SQL matches chronological ordering.
pub(crate) fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Read an entity stored as `realm_id, account_id, local_id, backend_id`
/// starting at column `start`.
pub(crate) fn entity_columns(row: &rusqlite::Row<'_>, start: usize) -> rusqlite::Result<Entity> {
    let realm_id: String = row.get(start)?;
    let account_id: String = row.get(start + 1)?;
    let local_id: String = row.get(start + 2)?;
    let backend_id: Option<String> = row.get(start + 3)?;

    let entity = Entity::new(realm_id, account_id, local_id);
    Ok(match backend_id {
        Some(id) => entity.with_backend_id(id),
        None => entity,
    })
}

/// Read an entity stored in its serialized `realm/account/local` form.
pub(crate) fn entity_id_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Entity> {
    let id: String = row.get(idx)?;
    id.parse::<Entity>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// The optional backend id column value for an entity.
pub(crate) fn backend_id_value(entity: &Entity) -> Option<&str> {
    entity.is_backend_id_set().then(|| entity.backend_id())
}
