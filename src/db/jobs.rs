//! Distance-matrix jobs and the city cache.
//!
//! Every per-city write also bumps the job counters inside the same
//! transaction, so a job can be resumed by any worker from persisted state.

use super::model::CityCandidate;
use super::Pool;
use crate::model::{City, DistanceJob, DistanceSource, JobMode, JobPhase, JobStatus};
use anyhow::{anyhow, Result};
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::instrument;

/// A measured (or estimated) distance for one city.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteUpdate {
    pub city_id: i64,
    pub distance_km: f64,
    pub duration_minutes: Option<f64>,
    pub source: DistanceSource,
    pub route_unavailable: bool,
}

fn scope_clause(mode: JobMode) -> &'static str {
    match mode {
        JobMode::Missing => "(distance_source IS NULL OR distance_source = 'pending_matrix')",
        JobMode::All => "1 = 1",
    }
}

#[instrument(skip_all)]
pub async fn find_active_job_for(pool: &Pool, created_by: &str) -> Result<Option<DistanceJob>> {
    let row = sqlx::query(
        "SELECT * FROM distance_jobs WHERE created_by = ? AND status IN ('queued', 'running') \
         ORDER BY id DESC LIMIT 1",
    )
    .bind(created_by)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(job_from_row).transpose()
}

pub async fn count_candidates(pool: &Pool, mode: JobMode) -> Result<i64> {
    let sql = format!("SELECT COUNT(*) FROM cities WHERE {}", scope_clause(mode));
    let count: i64 = sqlx::query_scalar(&sql).fetch_one(pool).await?;
    Ok(count)
}

#[instrument(skip_all)]
pub async fn insert_job(pool: &Pool, created_by: &str, mode: JobMode, total: i64) -> Result<i64> {
    let now = Utc::now();
    let rec = sqlx::query(
        "INSERT INTO distance_jobs (created_by, status, phase, mode, total, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(created_by)
    .bind(JobStatus::Queued.as_str())
    .bind(JobPhase::Geocoding.as_str())
    .bind(mode.as_str())
    .bind(total)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

pub async fn get_job(pool: &Pool, id: i64) -> Result<Option<DistanceJob>> {
    let row = sqlx::query("SELECT * FROM distance_jobs WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(job_from_row).transpose()
}

pub async fn job_status(pool: &Pool, id: i64) -> Result<Option<JobStatus>> {
    let status: Option<String> = sqlx::query_scalar("SELECT status FROM distance_jobs WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(status.and_then(|s| JobStatus::parse_status(&s)))
}

/// Oldest job that still has work to do.
pub async fn next_runnable_job(pool: &Pool) -> Result<Option<i64>> {
    let id = sqlx::query_scalar::<_, i64>(
        "SELECT id FROM distance_jobs WHERE status IN ('queued', 'running') ORDER BY id ASC LIMIT 1",
    )
    .fetch_optional(pool)
    .await?;
    Ok(id)
}

/// Move a job to `status`. Terminal jobs are never reopened; returns whether a
/// row changed.
#[instrument(skip_all, fields(job = id, status = status.as_str()))]
pub async fn set_job_status(
    pool: &Pool,
    id: i64,
    status: JobStatus,
    last_error: Option<&str>,
) -> Result<bool> {
    let now = Utc::now();
    let finished_at = status.is_terminal().then_some(now);
    let res = sqlx::query(
        "UPDATE distance_jobs SET status = ?, last_error = COALESCE(?, last_error), updated_at = ?, \
         finished_at = COALESCE(?, finished_at) \
         WHERE id = ? AND status IN ('queued', 'running')",
    )
    .bind(status.as_str())
    .bind(last_error)
    .bind(now)
    .bind(finished_at)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

pub async fn set_job_phase(pool: &Pool, id: i64, phase: JobPhase) -> Result<()> {
    sqlx::query("UPDATE distance_jobs SET phase = ?, updated_at = ? WHERE id = ?")
        .bind(phase.as_str())
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn geocode_candidates(
    pool: &Pool,
    job_id: i64,
    mode: JobMode,
    limit: usize,
) -> Result<Vec<CityCandidate>> {
    let sql = format!(
        "SELECT id, name, state, latitude, longitude FROM cities \
         WHERE {} AND latitude IS NULL AND (geocoded_job_id IS NULL OR geocoded_job_id != ?) \
         ORDER BY id ASC LIMIT ?",
        scope_clause(mode)
    );
    let rows = sqlx::query(&sql)
        .bind(job_id)
        .bind(limit as i64)
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(candidate_from_row).collect())
}

pub async fn matrix_candidates(
    pool: &Pool,
    job_id: i64,
    mode: JobMode,
    limit: usize,
) -> Result<Vec<CityCandidate>> {
    let sql = format!(
        "SELECT id, name, state, latitude, longitude FROM cities \
         WHERE {} AND latitude IS NOT NULL AND longitude IS NOT NULL \
         AND (matrix_job_id IS NULL OR matrix_job_id != ?) \
         ORDER BY id ASC LIMIT ?",
        scope_clause(mode)
    );
    let rows = sqlx::query(&sql)
        .bind(job_id)
        .bind(limit as i64)
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(candidate_from_row).collect())
}

/// Store coordinates plus a straight-line estimate until the matrix phase runs.
#[instrument(skip_all, fields(job = job_id, city = city_id))]
pub async fn record_geocode_success(
    pool: &Pool,
    job_id: i64,
    city_id: i64,
    latitude: f64,
    longitude: f64,
    estimate_km: f64,
) -> Result<()> {
    let now = Utc::now();
    let mut tx = pool.begin().await?;
    sqlx::query(
        "UPDATE cities SET latitude = ?, longitude = ?, distance_km = ?, duration_minutes = NULL, \
         distance_source = ?, route_unavailable = 0, geocoded_job_id = ?, updated_at = ? WHERE id = ?",
    )
    .bind(latitude)
    .bind(longitude)
    .bind(estimate_km)
    .bind(DistanceSource::PendingMatrix.as_str())
    .bind(job_id)
    .bind(now)
    .bind(city_id)
    .execute(&mut *tx)
    .await?;
    sqlx::query("UPDATE distance_jobs SET geocoded = geocoded + 1, updated_at = ? WHERE id = ?")
        .bind(now)
        .bind(job_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

/// A city that could not be geocoded counts as processed and failed.
#[instrument(skip_all, fields(job = job_id, city = city_id))]
pub async fn record_geocode_failure(
    pool: &Pool,
    job_id: i64,
    city_id: i64,
    message: &str,
) -> Result<()> {
    let now = Utc::now();
    let mut tx = pool.begin().await?;
    sqlx::query("UPDATE cities SET geocoded_job_id = ?, updated_at = ? WHERE id = ?")
        .bind(job_id)
        .bind(now)
        .bind(city_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        "INSERT INTO distance_job_errors (job_id, city_id, phase, message, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(job_id)
    .bind(city_id)
    .bind(JobPhase::Geocoding.as_str())
    .bind(message)
    .bind(now)
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        "UPDATE distance_jobs SET failed = failed + 1, processed = processed + 1, updated_at = ? WHERE id = ?",
    )
    .bind(now)
    .bind(job_id)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

#[instrument(skip_all, fields(job = job_id, n = updates.len()))]
pub async fn record_routes(pool: &Pool, job_id: i64, updates: &[RouteUpdate]) -> Result<()> {
    let now = Utc::now();
    let mut tx = pool.begin().await?;
    for update in updates {
        sqlx::query(
            "UPDATE cities SET distance_km = ?, duration_minutes = ?, distance_source = ?, \
             route_unavailable = ?, matrix_job_id = ?, updated_at = ? WHERE id = ?",
        )
        .bind(update.distance_km)
        .bind(update.duration_minutes)
        .bind(update.source.as_str())
        .bind(update.route_unavailable)
        .bind(job_id)
        .bind(now)
        .bind(update.city_id)
        .execute(&mut *tx)
        .await?;
    }
    sqlx::query("UPDATE distance_jobs SET processed = processed + ?, updated_at = ? WHERE id = ?")
        .bind(updates.len() as i64)
        .bind(now)
        .bind(job_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

#[instrument(skip_all, fields(job = job_id, n = city_ids.len()))]
pub async fn record_matrix_failure(
    pool: &Pool,
    job_id: i64,
    city_ids: &[i64],
    message: &str,
) -> Result<()> {
    let now = Utc::now();
    let mut tx = pool.begin().await?;
    for city_id in city_ids {
        sqlx::query("UPDATE cities SET matrix_job_id = ?, updated_at = ? WHERE id = ?")
            .bind(job_id)
            .bind(now)
            .bind(city_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO distance_job_errors (job_id, city_id, phase, message, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(job_id)
        .bind(city_id)
        .bind(JobPhase::Matrix.as_str())
        .bind(message)
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }
    let n = city_ids.len() as i64;
    sqlx::query(
        "UPDATE distance_jobs SET failed = failed + ?, processed = processed + ?, updated_at = ? WHERE id = ?",
    )
    .bind(n)
    .bind(n)
    .bind(now)
    .bind(job_id)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

/// `(city_id, phase, message)` rows logged for a job, oldest first.
pub async fn list_job_errors(pool: &Pool, job_id: i64) -> Result<Vec<(Option<i64>, String, String)>> {
    let rows = sqlx::query_as::<_, (Option<i64>, String, String)>(
        "SELECT city_id, phase, message FROM distance_job_errors WHERE job_id = ? ORDER BY id ASC",
    )
    .bind(job_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn upsert_city(pool: &Pool, name: &str, state: &str) -> Result<i64> {
    if let Some(id) =
        sqlx::query_scalar::<_, i64>("SELECT id FROM cities WHERE name = ? AND state = ?")
            .bind(name)
            .bind(state)
            .fetch_optional(pool)
            .await?
    {
        return Ok(id);
    }
    let rec = sqlx::query("INSERT INTO cities (name, state) VALUES (?, ?) RETURNING id")
        .bind(name)
        .bind(state)
        .fetch_one(pool)
        .await?;
    Ok(rec.get("id"))
}

pub async fn get_city(pool: &Pool, id: i64) -> Result<Option<City>> {
    let row = sqlx::query(
        "SELECT id, name, state, latitude, longitude, distance_km, duration_minutes, \
         distance_source, route_unavailable FROM cities WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|row| City {
        id: row.get("id"),
        name: row.get("name"),
        state: row.get("state"),
        latitude: row.try_get("latitude").ok().flatten(),
        longitude: row.try_get("longitude").ok().flatten(),
        distance_km: row.try_get("distance_km").ok().flatten(),
        duration_minutes: row.try_get("duration_minutes").ok().flatten(),
        distance_source: row
            .try_get::<Option<String>, _>("distance_source")
            .ok()
            .flatten()
            .and_then(|s| DistanceSource::parse_source(&s)),
        route_unavailable: row.get::<bool, _>("route_unavailable"),
    }))
}

fn candidate_from_row(row: &SqliteRow) -> CityCandidate {
    CityCandidate {
        id: row.get("id"),
        name: row.get("name"),
        state: row.get("state"),
        latitude: row.try_get("latitude").ok().flatten(),
        longitude: row.try_get("longitude").ok().flatten(),
    }
}

fn job_from_row(row: &SqliteRow) -> Result<DistanceJob> {
    let id: i64 = row.get("id");
    let status_str: String = row.get("status");
    let phase_str: String = row.get("phase");
    let mode_str: String = row.get("mode");
    Ok(DistanceJob {
        id,
        created_by: row.get("created_by"),
        status: JobStatus::parse_status(&status_str)
            .ok_or_else(|| anyhow!("job {} has unknown status {}", id, status_str))?,
        phase: JobPhase::parse_phase(&phase_str)
            .ok_or_else(|| anyhow!("job {} has unknown phase {}", id, phase_str))?,
        mode: JobMode::parse_mode(&mode_str)
            .ok_or_else(|| anyhow!("job {} has unknown mode {}", id, mode_str))?,
        total: row.get("total"),
        processed: row.get("processed"),
        geocoded: row.get("geocoded"),
        failed: row.get("failed"),
        last_error: row.try_get("last_error").ok().flatten(),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        finished_at: row.try_get("finished_at").ok().flatten(),
    })
}
