//! Record handlers - owner-scoped reads and optimistic writes.

use serde_json::{Map, Value};
use stockroom_engine::{Record, ReconcileSummary};

use crate::context::SyncContext;
use crate::error::{AppError, Result};

fn into_object(body: Value) -> Result<Map<String, Value>> {
    match body {
        Value::Object(map) => Ok(map),
        _ => Err(AppError::BadRequest("body must be a JSON object".into())),
    }
}

/// Records of `collection` visible to the signed-in user. Empty when
/// nobody is signed in.
pub async fn list_records(ctx: &SyncContext, collection: &str) -> Result<Vec<Value>> {
    ctx.catalog.require(collection)?;
    let Some(user) = ctx.auth.current_user() else {
        return Ok(Vec::new());
    };

    let records = ctx.local.get_all_by_owner(collection, &user.id).await?;
    Ok(records.iter().map(Record::to_value).collect())
}

/// One record, if the signed-in user may see it.
pub async fn get_record(ctx: &SyncContext, collection: &str, id: &str) -> Result<Value> {
    ctx.catalog.require(collection)?;
    let not_found = || AppError::NotFound(format!("{collection}/{id}"));

    let user = ctx.auth.current_user().ok_or_else(not_found)?;
    let record = ctx
        .local
        .get_by_id(collection, id)
        .await?
        .filter(|r| r.meta.is_visible_to(&user.id))
        .ok_or_else(not_found)?;
    Ok(record.to_value())
}

pub async fn create_record(ctx: &SyncContext, collection: &str, body: Value) -> Result<Value> {
    let record = ctx.writer.create(collection, into_object(body)?).await?;
    Ok(record.to_value())
}

pub async fn update_record(
    ctx: &SyncContext,
    collection: &str,
    id: &str,
    body: Value,
) -> Result<Value> {
    let record = ctx.writer.update(collection, id, into_object(body)?).await?;
    Ok(record.to_value())
}

pub async fn delete_record(ctx: &SyncContext, collection: &str, id: &str) -> Result<()> {
    if ctx.writer.delete(collection, id).await? {
        Ok(())
    } else {
        Err(AppError::NotFound(format!("{collection}/{id}")))
    }
}

pub async fn reconcile_collection(ctx: &SyncContext, collection: &str) -> Result<ReconcileSummary> {
    Ok(ctx.reconciler.reconcile(collection).await?)
}
