use portal_sync::db::jobs;
use portal_sync::distance::{self, DistanceContext, StartOutcome};
use portal_sync::geo::{haversine_km, GeoApi, GeoError, LatLng, RouteElement};
use portal_sync::model::{DistanceSource, JobMode, JobPhase, JobStatus};
use portal_sync::retry::RetryPolicy;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Duration;

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

fn origin() -> LatLng {
    LatLng::new(-23.5505, -46.6333)
}

#[derive(Clone, Default)]
struct FakeGeo {
    places: Arc<Mutex<HashMap<String, LatLng>>>,
    geocode_errors: Arc<Mutex<VecDeque<GeoError>>>,
    matrix_responses: Arc<Mutex<VecDeque<Result<Vec<RouteElement>, GeoError>>>>,
    geocoded: Arc<Mutex<Vec<String>>>,
    matrix_calls: Arc<Mutex<Vec<usize>>>,
}

impl FakeGeo {
    async fn place(&self, address: &str, lat: f64, lng: f64) {
        self.places
            .lock()
            .await
            .insert(address.to_string(), LatLng::new(lat, lng));
    }

    async fn fail_geocode(&self, err: GeoError) {
        self.geocode_errors.lock().await.push_back(err);
    }

    async fn respond_matrix(&self, response: Result<Vec<RouteElement>, GeoError>) {
        self.matrix_responses.lock().await.push_back(response);
    }

    async fn geocoded(&self) -> Vec<String> {
        self.geocoded.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl GeoApi for FakeGeo {
    async fn geocode(&self, address: &str) -> Result<Option<LatLng>, GeoError> {
        self.geocoded.lock().await.push(address.to_string());
        if let Some(err) = self.geocode_errors.lock().await.pop_front() {
            return Err(err);
        }
        Ok(self.places.lock().await.get(address).copied())
    }

    async fn distance_matrix(
        &self,
        _origin: LatLng,
        destinations: &[LatLng],
    ) -> Result<Vec<RouteElement>, GeoError> {
        self.matrix_calls.lock().await.push(destinations.len());
        match self.matrix_responses.lock().await.pop_front() {
            Some(response) => response,
            None => Ok(destinations
                .iter()
                .map(|_| RouteElement::Route {
                    distance_km: 100.0,
                    duration_minutes: 60.0,
                })
                .collect()),
        }
    }
}

fn context(pool: &sqlx::SqlitePool, geo: &FakeGeo, geocode_batch_size: usize) -> DistanceContext {
    DistanceContext {
        pool: pool.clone(),
        geo: Arc::new(geo.clone()),
        origin: origin(),
        geocode_batch_size,
        matrix_batch_size: 25,
        tick_budget: Duration::from_secs(30),
        retry: RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2)),
    }
}

async fn started(pool: &sqlx::SqlitePool, user: &str, mode: JobMode) -> i64 {
    match distance::start_job(pool, user, mode).await.unwrap() {
        StartOutcome::Started(job) => job.id,
        StartOutcome::AlreadyRunning(job) => panic!("job {} already running", job.id),
    }
}

#[tokio::test]
async fn job_measures_routes_and_falls_back_to_straight_line() {
    let pool = setup_pool().await;
    let geo = FakeGeo::default();
    let campinas = jobs::upsert_city(&pool, "Campinas", "SP").await.unwrap();
    let ilhabela = jobs::upsert_city(&pool, "Ilhabela", "SP").await.unwrap();
    let nowhere = jobs::upsert_city(&pool, "Atlantida", "XX").await.unwrap();
    geo.place("Campinas, SP, Brasil", -22.9099, -47.0626).await;
    geo.place("Ilhabela, SP, Brasil", -23.7781, -45.3581).await;
    geo.respond_matrix(Ok(vec![
        RouteElement::Route {
            distance_km: 95.4,
            duration_minutes: 78.0,
        },
        RouteElement::NoRoute,
    ]))
    .await;

    let job_id = started(&pool, "ana", JobMode::Missing).await;
    let ctx = context(&pool, &geo, 10);
    let job = distance::run_to_completion(&ctx, job_id, Duration::ZERO)
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.total, 3);
    assert_eq!(job.processed, 3);
    assert_eq!(job.geocoded, 2);
    assert_eq!(job.failed, 1);
    assert!(job.finished_at.is_some());

    let measured = jobs::get_city(&pool, campinas).await.unwrap().unwrap();
    assert_eq!(measured.distance_source, Some(DistanceSource::Matrix));
    assert_eq!(measured.distance_km, Some(95.4));
    assert_eq!(measured.duration_minutes, Some(78.0));
    assert!(!measured.route_unavailable);

    let island = jobs::get_city(&pool, ilhabela).await.unwrap().unwrap();
    assert_eq!(island.distance_source, Some(DistanceSource::Haversine));
    assert!(island.route_unavailable);
    assert_eq!(island.duration_minutes, None);
    let expected = haversine_km(origin(), LatLng::new(-23.7781, -45.3581));
    assert!((island.distance_km.unwrap() - expected).abs() < 1e-6);

    let unknown = jobs::get_city(&pool, nowhere).await.unwrap().unwrap();
    assert_eq!(unknown.latitude, None);
    let errors = jobs::list_job_errors(&pool, job_id).await.unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, Some(nowhere));
    assert_eq!(errors[0].1, "geocoding");
}

#[tokio::test]
async fn job_resumes_from_persisted_state_between_ticks() {
    let pool = setup_pool().await;
    let geo = FakeGeo::default();
    jobs::upsert_city(&pool, "Campinas", "SP").await.unwrap();
    jobs::upsert_city(&pool, "Santos", "SP").await.unwrap();
    geo.place("Campinas, SP, Brasil", -22.9099, -47.0626).await;
    geo.place("Santos, SP, Brasil", -23.9608, -46.3336).await;
    let job_id = started(&pool, "ana", JobMode::Missing).await;

    let first = distance::tick(&context(&pool, &geo, 1), job_id).await.unwrap();
    assert_eq!(first.geocoded, 1);
    let job = first.job.unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.phase, JobPhase::Geocoding);

    // A fresh worker picks up where the previous one stopped.
    let second = distance::tick(&context(&pool, &geo, 1), job_id).await.unwrap();
    assert_eq!(second.geocoded, 1);
    assert_eq!(geo.geocoded().await.len(), 2);

    let third = distance::tick(&context(&pool, &geo, 1), job_id).await.unwrap();
    assert_eq!(third.geocoded, 0);
    assert_eq!(third.routed, 2);
    assert_eq!(third.job.as_ref().unwrap().phase, JobPhase::Matrix);
    assert!(!third.is_terminal());

    let last = distance::tick(&context(&pool, &geo, 1), job_id).await.unwrap();
    assert!(last.is_terminal());
    assert_eq!(last.job.unwrap().status, JobStatus::Completed);
    assert_eq!(*geo.matrix_calls.lock().await, vec![2]);
}

#[tokio::test]
async fn second_start_returns_the_open_job() {
    let pool = setup_pool().await;
    jobs::upsert_city(&pool, "Campinas", "SP").await.unwrap();

    let first = started(&pool, "ana", JobMode::Missing).await;
    match distance::start_job(&pool, "ana", JobMode::All).await.unwrap() {
        StartOutcome::AlreadyRunning(job) => assert_eq!(job.id, first),
        StartOutcome::Started(_) => panic!("expected the open job"),
    }
    let other = started(&pool, "bruno", JobMode::Missing).await;
    assert_ne!(other, first);
    assert_eq!(distance::next_runnable_job(&pool).await.unwrap(), Some(first));
}

#[tokio::test]
async fn missing_mode_skips_measured_cities() {
    let pool = setup_pool().await;
    let measured = jobs::upsert_city(&pool, "Campinas", "SP").await.unwrap();
    jobs::upsert_city(&pool, "Santos", "SP").await.unwrap();
    sqlx::query(
        "UPDATE cities SET latitude = -22.9, longitude = -47.06, distance_km = 95.0, \
         distance_source = 'matrix' WHERE id = ?",
    )
    .bind(measured)
    .execute(&pool)
    .await
    .unwrap();

    let missing = distance::start_job(&pool, "ana", JobMode::Missing).await.unwrap();
    assert_eq!(missing.job().total, 1);
    distance::cancel_job(&pool, missing.job().id).await.unwrap();
    let all = distance::start_job(&pool, "ana", JobMode::All).await.unwrap();
    assert_eq!(all.job().total, 2);
}

#[tokio::test]
async fn cancelled_job_stops_without_further_calls() {
    let pool = setup_pool().await;
    let geo = FakeGeo::default();
    for name in ["Campinas", "Santos", "Sorocaba"] {
        jobs::upsert_city(&pool, name, "SP").await.unwrap();
    }
    let job_id = started(&pool, "ana", JobMode::Missing).await;
    let ctx = context(&pool, &geo, 1);

    distance::tick(&ctx, job_id).await.unwrap();
    assert_eq!(geo.geocoded().await.len(), 1);

    assert!(distance::cancel_job(&pool, job_id).await.unwrap());
    let report = distance::tick(&ctx, job_id).await.unwrap();
    assert!(report.is_terminal());
    assert_eq!(report.job.unwrap().status, JobStatus::Cancelled);
    assert_eq!(geo.geocoded().await.len(), 1);

    assert!(!distance::cancel_job(&pool, job_id).await.unwrap());
    assert!(!distance::work_once(&ctx).await.unwrap());
}

#[tokio::test]
async fn denied_key_fails_the_job_with_a_hint() {
    let pool = setup_pool().await;
    let geo = FakeGeo::default();
    jobs::upsert_city(&pool, "Campinas", "SP").await.unwrap();
    jobs::upsert_city(&pool, "Santos", "SP").await.unwrap();
    geo.fail_geocode(GeoError::RequestDenied("The provided API key is invalid.".into()))
        .await;
    let job_id = started(&pool, "ana", JobMode::Missing).await;

    let report = distance::tick(&context(&pool, &geo, 10), job_id).await.unwrap();
    let job = report.job.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.last_error.unwrap().contains("API key"));
    assert_eq!(geo.geocoded().await.len(), 1);
}

#[tokio::test]
async fn transient_errors_are_retried() {
    let pool = setup_pool().await;
    let geo = FakeGeo::default();
    let city = jobs::upsert_city(&pool, "Campinas", "SP").await.unwrap();
    geo.place("Campinas, SP, Brasil", -22.9099, -47.0626).await;
    geo.fail_geocode(GeoError::Server(503)).await;
    geo.respond_matrix(Err(GeoError::Other {
        status: "UNKNOWN_ERROR".into(),
        message: String::new(),
    }))
    .await;
    let job_id = started(&pool, "ana", JobMode::Missing).await;

    let job = distance::run_to_completion(&context(&pool, &geo, 10), job_id, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.failed, 0);
    assert_eq!(geo.geocoded().await.len(), 2);
    assert_eq!(geo.matrix_calls.lock().await.len(), 2);
    let stored = jobs::get_city(&pool, city).await.unwrap().unwrap();
    assert_eq!(stored.distance_source, Some(DistanceSource::Matrix));
}

#[tokio::test]
async fn exhausted_matrix_retries_are_logged_per_city() {
    let pool = setup_pool().await;
    let geo = FakeGeo::default();
    let city = jobs::upsert_city(&pool, "Campinas", "SP").await.unwrap();
    geo.place("Campinas, SP, Brasil", -22.9099, -47.0626).await;
    for _ in 0..3 {
        geo.respond_matrix(Err(GeoError::Server(500))).await;
    }
    let job_id = started(&pool, "ana", JobMode::Missing).await;

    let job = distance::run_to_completion(&context(&pool, &geo, 10), job_id, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.failed, 1);
    assert_eq!(job.processed, 1);
    let stored = jobs::get_city(&pool, city).await.unwrap().unwrap();
    assert_eq!(stored.distance_source, Some(DistanceSource::PendingMatrix));
    let errors = jobs::list_job_errors(&pool, job_id).await.unwrap();
    assert_eq!(errors[0].1, "matrix");
}

#[tokio::test]
async fn seeded_cities_become_job_candidates() {
    let pool = setup_pool().await;
    let file = "name,state\nCampinas,sp\nSantos,SP\nCampinas,SP\nBroken\n,SP\n";
    let summary = distance::seed_cities(&pool, file.as_bytes()).await.unwrap();
    assert_eq!(summary.cities, 3);
    let lines: Vec<u64> = summary.errors.iter().map(|e| e.line).collect();
    assert_eq!(lines, vec![5, 6]);

    match distance::start_job(&pool, "ana", JobMode::Missing).await.unwrap() {
        StartOutcome::Started(job) => assert_eq!(job.total, 2),
        other => panic!("unexpected {:?}", other),
    }
}
