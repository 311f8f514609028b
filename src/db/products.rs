use super::Pool;
use crate::import::{normalize_key, ProductDraft};
use anyhow::Result;
use chrono::Utc;
use sqlx::{Row, Sqlite, Transaction};
use tracing::instrument;

pub async fn find_product_id(pool: &Pool, name: &str, compound_type: &str) -> Result<Option<i64>> {
    let id = sqlx::query_scalar::<_, i64>(
        "SELECT id FROM products WHERE name_key = ? AND compound_key = ?",
    )
    .bind(normalize_key(name))
    .bind(normalize_key(compound_type))
    .fetch_optional(pool)
    .await?;
    Ok(id)
}

#[instrument(skip_all)]
pub async fn insert_product(pool: &Pool, draft: &ProductDraft) -> Result<i64> {
    let now = Utc::now();
    let mut tx = pool.begin().await?;
    let rec = sqlx::query(
        "INSERT INTO products (name, name_key, compound_type, compound_key, cas_number, description, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(&draft.name)
    .bind(normalize_key(&draft.name))
    .bind(&draft.compound_type)
    .bind(normalize_key(&draft.compound_type))
    .bind(&draft.cas_number)
    .bind(&draft.description)
    .bind(now)
    .bind(now)
    .fetch_one(&mut *tx)
    .await?;
    let id: i64 = rec.get("id");
    write_tags(&mut tx, id, draft).await?;
    tx.commit().await?;
    Ok(id)
}

/// Overwrite scalar fields and replace every tag of an existing product.
#[instrument(skip_all)]
pub async fn update_product(pool: &Pool, id: i64, draft: &ProductDraft) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query(
        "UPDATE products SET name = ?, compound_type = ?, cas_number = ?, description = ?, updated_at = ? WHERE id = ?",
    )
    .bind(&draft.name)
    .bind(&draft.compound_type)
    .bind(&draft.cas_number)
    .bind(&draft.description)
    .bind(Utc::now())
    .bind(id)
    .execute(&mut *tx)
    .await?;
    sqlx::query("DELETE FROM product_tags WHERE product_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    write_tags(&mut tx, id, draft).await?;
    tx.commit().await?;
    Ok(())
}

pub async fn product_tags(pool: &Pool, id: i64, kind: &str) -> Result<Vec<String>> {
    let tags = sqlx::query_scalar::<_, String>(
        "SELECT value FROM product_tags WHERE product_id = ? AND kind = ? ORDER BY value",
    )
    .bind(id)
    .bind(kind)
    .fetch_all(pool)
    .await?;
    Ok(tags)
}

pub async fn count_products(pool: &Pool) -> Result<i64> {
    let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM products")
        .fetch_one(pool)
        .await?;
    Ok(n)
}

async fn write_tags(tx: &mut Transaction<'_, Sqlite>, id: i64, draft: &ProductDraft) -> Result<()> {
    let groups = [
        ("segment", &draft.segments),
        ("application", &draft.applications),
        ("group", &draft.groups),
    ];
    for (kind, values) in groups {
        for value in values {
            sqlx::query(
                "INSERT OR IGNORE INTO product_tags (product_id, kind, value) VALUES (?, ?, ?)",
            )
            .bind(id)
            .bind(kind)
            .bind(value)
            .execute(&mut **tx)
            .await?;
        }
    }
    Ok(())
}
