//! Resumable distance-matrix job.
//!
//! A job advances through short ticks. Each tick handles at most one batch of
//! its current phase (`geocoding`, then `matrix`) and persists every city's
//! outcome together with the job counters, so any worker can pick the job up
//! where the previous tick stopped.

use crate::config::Google;
use crate::db::jobs::{self, RouteUpdate};
use crate::db::{CityCandidate, Pool};
use crate::geo::{haversine_km, GeoApi, GeoError, LatLng, RouteElement};
use crate::import::RowError;
use crate::model::{DistanceJob, DistanceSource, JobMode, JobPhase, JobStatus};
use crate::retry::{retry_with_backoff, RetryPolicy};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

#[derive(Clone)]
pub struct DistanceContext {
    pub pool: Pool,
    pub geo: Arc<dyn GeoApi>,
    pub origin: LatLng,
    pub geocode_batch_size: usize,
    pub matrix_batch_size: usize,
    pub tick_budget: Duration,
    pub retry: RetryPolicy,
}

impl DistanceContext {
    pub fn from_config(pool: Pool, geo: Arc<dyn GeoApi>, google: &Google) -> Self {
        Self {
            pool,
            geo,
            origin: LatLng::new(google.origin.latitude, google.origin.longitude),
            geocode_batch_size: google.geocode_batch_size.max(1),
            matrix_batch_size: google.matrix_batch_size.clamp(1, 25),
            tick_budget: Duration::from_secs(google.tick_budget_seconds.max(1)),
            retry: RetryPolicy::new(
                google.max_attempts,
                Duration::from_millis(google.base_delay_ms),
                Duration::from_secs(30),
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", content = "job", rename_all = "snake_case")]
pub enum StartOutcome {
    Started(DistanceJob),
    AlreadyRunning(DistanceJob),
}

impl StartOutcome {
    pub fn job(&self) -> &DistanceJob {
        match self {
            StartOutcome::Started(job) | StartOutcome::AlreadyRunning(job) => job,
        }
    }
}

/// Queue a job for `created_by`, or return the one they already have open.
#[instrument(skip_all, fields(created_by = %created_by, mode = mode.as_str()))]
pub async fn start_job(pool: &Pool, created_by: &str, mode: JobMode) -> Result<StartOutcome> {
    if let Some(job) = jobs::find_active_job_for(pool, created_by).await? {
        info!(job = job.id, "distance job already running");
        return Ok(StartOutcome::AlreadyRunning(job));
    }
    let total = jobs::count_candidates(pool, mode).await?;
    let id = jobs::insert_job(pool, created_by, mode, total).await?;
    let job = load_job(pool, id).await?;
    info!(job = id, total, "distance job queued");
    Ok(StartOutcome::Started(job))
}

#[derive(Debug, Deserialize)]
struct CityRow {
    name: String,
    state: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CitySeedSummary {
    pub cities: u64,
    pub errors: Vec<RowError>,
}

/// Load `name,state` rows into `cities`. Existing cities are kept as they
/// are, so reseeding never discards measured distances.
#[instrument(skip_all)]
pub async fn seed_cities<R: Read>(pool: &Pool, input: R) -> Result<CitySeedSummary> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(input);
    let headers = reader.headers().context("failed to read CSV header")?.clone();
    let mut summary = CitySeedSummary::default();
    for result in reader.records() {
        let parsed = result.and_then(|record| {
            let line = record.position().map_or(0, |p| p.line());
            record.deserialize::<CityRow>(Some(&headers)).map(|row| (line, row))
        });
        let (line, row) = match parsed {
            Ok(parsed) => parsed,
            Err(err) => {
                let line = err.position().map_or(0, |p| p.line());
                summary.errors.push(RowError {
                    line,
                    message: format!("malformed record: {}", err),
                });
                continue;
            }
        };
        if row.name.is_empty() || row.state.is_empty() {
            summary.errors.push(RowError {
                line,
                message: "name and state are required".into(),
            });
            continue;
        }
        jobs::upsert_city(pool, &row.name, &row.state.to_uppercase()).await?;
        summary.cities += 1;
    }
    info!(cities = summary.cities, errors = summary.errors.len(), "cities seeded");
    Ok(summary)
}

pub async fn get_job(pool: &Pool, job_id: i64) -> Result<Option<DistanceJob>> {
    jobs::get_job(pool, job_id).await
}

pub async fn next_runnable_job(pool: &Pool) -> Result<Option<i64>> {
    jobs::next_runnable_job(pool).await
}

/// Request cancellation; the running tick stops at its next check.
pub async fn cancel_job(pool: &Pool, job_id: i64) -> Result<bool> {
    let changed = jobs::set_job_status(pool, job_id, JobStatus::Cancelled, None).await?;
    if changed {
        info!(job = job_id, "distance job cancelled");
    }
    Ok(changed)
}

async fn load_job(pool: &Pool, job_id: i64) -> Result<DistanceJob> {
    jobs::get_job(pool, job_id)
        .await?
        .ok_or_else(|| anyhow!("distance job {} not found", job_id))
}

/// Work done by one tick.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub geocoded: u32,
    pub geocode_failures: u32,
    pub routed: u32,
    pub route_failures: u32,
    pub job: Option<DistanceJob>,
}

impl TickReport {
    pub fn is_terminal(&self) -> bool {
        self.job.as_ref().map_or(true, |j| j.status.is_terminal())
    }
}

enum Step {
    Continue,
    PhaseDone,
    Stop,
}

#[instrument(skip_all, fields(job = job_id))]
pub async fn tick(ctx: &DistanceContext, job_id: i64) -> Result<TickReport> {
    let mut report = TickReport::default();
    let job = load_job(&ctx.pool, job_id).await?;
    if job.status.is_terminal() {
        report.job = Some(job);
        return Ok(report);
    }
    if job.status == JobStatus::Queued {
        jobs::set_job_status(&ctx.pool, job_id, JobStatus::Running, None).await?;
    }

    let deadline = Instant::now() + ctx.tick_budget;
    let mut phase = job.phase;
    // An empty geocoding batch moves straight on to the matrix phase.
    for _ in 0..2 {
        let step = match phase {
            JobPhase::Geocoding => geocode_batch(ctx, &job, deadline, &mut report).await?,
            JobPhase::Matrix => matrix_batch(ctx, &job, &mut report).await?,
        };
        match (step, phase) {
            (Step::PhaseDone, JobPhase::Geocoding) => {
                jobs::set_job_phase(&ctx.pool, job_id, JobPhase::Matrix).await?;
                phase = JobPhase::Matrix;
            }
            (Step::PhaseDone, JobPhase::Matrix) => {
                jobs::set_job_status(&ctx.pool, job_id, JobStatus::Completed, None).await?;
                break;
            }
            _ => break,
        }
    }

    report.job = Some(load_job(&ctx.pool, job_id).await?);
    Ok(report)
}

async fn still_running(pool: &Pool, job_id: i64) -> Result<bool> {
    Ok(jobs::job_status(pool, job_id).await? == Some(JobStatus::Running))
}

async fn fail_job(pool: &Pool, job_id: i64, err: &GeoError) -> Result<()> {
    let msg = format!("{} ({})", err.hint(), err);
    warn!(job = job_id, %msg, "distance job failed");
    jobs::set_job_status(pool, job_id, JobStatus::Failed, Some(&msg)).await?;
    Ok(())
}

async fn geocode_batch(
    ctx: &DistanceContext,
    job: &DistanceJob,
    deadline: Instant,
    report: &mut TickReport,
) -> Result<Step> {
    let batch = jobs::geocode_candidates(&ctx.pool, job.id, job.mode, ctx.geocode_batch_size).await?;
    if batch.is_empty() {
        return Ok(Step::PhaseDone);
    }
    for city in &batch {
        if !still_running(&ctx.pool, job.id).await? {
            return Ok(Step::Stop);
        }
        if Instant::now() >= deadline {
            return Ok(Step::Continue);
        }
        let address = city.address();
        let result = retry_with_backoff(&ctx.retry, GeoError::is_retryable, || {
            ctx.geo.geocode(&address)
        })
        .await;
        match result {
            Ok(Some(location)) => {
                let estimate = haversine_km(ctx.origin, location);
                jobs::record_geocode_success(
                    &ctx.pool,
                    job.id,
                    city.id,
                    location.lat,
                    location.lng,
                    estimate,
                )
                .await?;
                report.geocoded += 1;
            }
            Ok(None) => {
                let msg = format!("no geocoding result for {}", address);
                jobs::record_geocode_failure(&ctx.pool, job.id, city.id, &msg).await?;
                report.geocode_failures += 1;
            }
            Err(err) if err.is_fatal() => {
                fail_job(&ctx.pool, job.id, &err).await?;
                return Ok(Step::Stop);
            }
            Err(err) => {
                warn!(city = city.id, %err, "geocoding gave up");
                jobs::record_geocode_failure(&ctx.pool, job.id, city.id, &err.to_string()).await?;
                report.geocode_failures += 1;
            }
        }
    }
    Ok(Step::Continue)
}

fn coordinates(city: &CityCandidate) -> Option<LatLng> {
    Some(LatLng::new(city.latitude?, city.longitude?))
}

async fn matrix_batch(ctx: &DistanceContext, job: &DistanceJob, report: &mut TickReport) -> Result<Step> {
    if !still_running(&ctx.pool, job.id).await? {
        return Ok(Step::Stop);
    }
    let batch = jobs::matrix_candidates(&ctx.pool, job.id, job.mode, ctx.matrix_batch_size).await?;
    if batch.is_empty() {
        return Ok(Step::PhaseDone);
    }
    let located: Vec<(i64, LatLng)> = batch
        .iter()
        .filter_map(|c| coordinates(c).map(|p| (c.id, p)))
        .collect();
    let destinations: Vec<LatLng> = located.iter().map(|(_, p)| *p).collect();

    let result = retry_with_backoff(&ctx.retry, GeoError::is_retryable, || {
        ctx.geo.distance_matrix(ctx.origin, &destinations)
    })
    .await;
    match result {
        Ok(elements) => {
            let updates: Vec<RouteUpdate> = located
                .iter()
                .zip(elements)
                .map(|((city_id, point), element)| match element {
                    RouteElement::Route {
                        distance_km,
                        duration_minutes,
                    } => RouteUpdate {
                        city_id: *city_id,
                        distance_km,
                        duration_minutes: Some(duration_minutes),
                        source: DistanceSource::Matrix,
                        route_unavailable: false,
                    },
                    RouteElement::NoRoute => RouteUpdate {
                        city_id: *city_id,
                        distance_km: haversine_km(ctx.origin, *point),
                        duration_minutes: None,
                        source: DistanceSource::Haversine,
                        route_unavailable: true,
                    },
                })
                .collect();
            jobs::record_routes(&ctx.pool, job.id, &updates).await?;
            report.routed += updates.len() as u32;
            Ok(Step::Continue)
        }
        Err(err) if err.is_fatal() => {
            fail_job(&ctx.pool, job.id, &err).await?;
            Ok(Step::Stop)
        }
        Err(err) => {
            warn!(%err, n = located.len(), "distance matrix gave up");
            let ids: Vec<i64> = located.iter().map(|(id, _)| *id).collect();
            jobs::record_matrix_failure(&ctx.pool, job.id, &ids, &err.to_string()).await?;
            report.route_failures += ids.len() as u32;
            Ok(Step::Continue)
        }
    }
}

/// Tick until the job reaches a terminal status, pausing between ticks.
pub async fn run_to_completion(ctx: &DistanceContext, job_id: i64, pause: Duration) -> Result<DistanceJob> {
    loop {
        let report = tick(ctx, job_id).await?;
        if report.is_terminal() {
            return load_job(&ctx.pool, job_id).await;
        }
        tokio::time::sleep(pause).await;
    }
}

/// Advance the oldest runnable job by one tick. Returns whether any job was
/// found.
#[instrument(skip_all)]
pub async fn work_once(ctx: &DistanceContext) -> Result<bool> {
    let Some(job_id) = next_runnable_job(&ctx.pool).await? else {
        return Ok(false);
    };
    let report = tick(ctx, job_id).await?;
    if let Some(job) = &report.job {
        info!(
            job = job_id,
            status = job.status.as_str(),
            processed = job.processed,
            total = job.total,
            "distance tick done"
        );
    }
    Ok(true)
}
