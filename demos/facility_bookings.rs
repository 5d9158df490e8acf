//! Facility bookings example demonstrating queries and optimistic mutations.
//!
//! This example shows:
//! - Concurrent queries for the same key sharing one fetch
//! - An optimistic rename that the backend accepts, followed by a refetch
//! - An optimistic rename that the backend rejects, and its rollback
//! - Subscribers observing every cache write
//!
//! The backend is an in-memory fake with artificial latency.
//!
//! Run with: `RUST_LOG=cachet=debug cargo run --example facility_bookings`

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cachet::prelude::*;
use color_eyre::eyre::Result;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

/// A bookable facility
#[derive(Debug, Clone, Serialize)]
struct Facility {
    id: String,
    name: String,
    capacity: u32,
}

/// A booking slot at a facility
#[derive(Debug, Clone, Serialize)]
struct Booking {
    facility_id: String,
    guest: String,
    hour: u8,
}

/// Fake backend with latency and a switch to reject the next write.
#[derive(Default)]
struct Backend {
    facilities: Mutex<HashMap<String, Facility>>,
    bookings: Mutex<Vec<Booking>>,
    reject_next_write: AtomicBool,
    requests: AtomicUsize,
}

impl Backend {
    fn seeded() -> Arc<Self> {
        let backend = Self::default();
        backend.facilities_mut().insert(
            "F1".to_string(),
            Facility {
                id: "F1".to_string(),
                name: "Sunny Hills".to_string(),
                capacity: 40,
            },
        );
        backend.bookings_mut().push(Booking {
            facility_id: "F1".to_string(),
            guest: "Ada".to_string(),
            hour: 10,
        });
        Arc::new(backend)
    }

    fn facilities_mut(&self) -> std::sync::MutexGuard<'_, HashMap<String, Facility>> {
        self.facilities.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn bookings_mut(&self) -> std::sync::MutexGuard<'_, Vec<Booking>> {
        self.bookings.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    async fn get_facility(&self, id: &str) -> Result<Facility, QueryError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(150)).await;
        self.facilities_mut()
            .get(id)
            .cloned()
            .ok_or_else(|| QueryError::http(404, format!("facility {id} not found")))
    }

    async fn list_bookings(&self, facility_id: &str) -> Result<Vec<Booking>, QueryError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(self
            .bookings_mut()
            .iter()
            .filter(|booking| booking.facility_id == facility_id)
            .cloned()
            .collect())
    }

    async fn rename_facility(&self, id: &str, name: &str) -> Result<(), QueryError> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        if self.reject_next_write.swap(false, Ordering::SeqCst) {
            return Err(QueryError::http(409, "facility was modified by someone else"));
        }
        match self.facilities_mut().get_mut(id) {
            Some(facility) => {
                facility.name = name.to_string();
                Ok(())
            }
            None => Err(QueryError::http(404, format!("facility {id} not found"))),
        }
    }
}

async fn load_facility(
    client: &QueryClient,
    backend: &Arc<Backend>,
    id: &str,
) -> Result<Arc<Facility>, QueryError> {
    let key = query_key!["facility", id]?;
    let backend = Arc::clone(backend);
    let id = id.to_string();
    client
        .query(&key, move |_signal| {
            let backend = Arc::clone(&backend);
            let id = id.clone();
            async move { backend.get_facility(&id).await }
        })
        .await
}

async fn rename(
    client: &QueryClient,
    backend: &Arc<Backend>,
    id: &str,
    name: &str,
) -> Result<(), QueryError> {
    let key = query_key!["facility", id]?;
    let new_name = name.to_string();
    let patch = OptimisticPatch::new().update(key.clone(), move |current: Option<&Facility>| {
        let mut facility = current.cloned().unwrap_or_else(|| Facility {
            id: String::new(),
            name: String::new(),
            capacity: 0,
        });
        facility.name = new_name;
        facility
    });

    let backend = Arc::clone(backend);
    let (id, name) = (id.to_string(), name.to_string());
    client
        .mutate(
            move || async move { backend.rename_facility(&id, &name).await },
            MutationOptions::new()
                .optimistic(patch)
                .invalidates(query_key!["facility"]?),
        )
        .await
}

fn cached_name(client: &QueryClient, id: &str) -> Result<String> {
    let key = query_key!["facility", id]?;
    Ok(client
        .get_query_data::<Facility>(&key)?
        .map_or_else(|| "<none>".to_string(), |facility| facility.name.clone()))
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cachet=info")),
        )
        .compact()
        .init();

    let backend = Backend::seeded();
    let client = QueryClient::with_config(QueryConfig::new(
        Duration::from_secs(30),
        Duration::from_secs(5 * 60),
    ));
    let _collector = client.spawn_garbage_collector(Duration::from_secs(60));

    let _handle = client.subscribe(&query_key!["facility"]?, |notification| {
        println!("  [subscriber] {} -> {:?}", notification.key, notification.cause);
    });

    println!("== Two concurrent reads share one request");
    let (a, b) = tokio::join!(
        load_facility(&client, &backend, "F1"),
        load_facility(&client, &backend, "F1"),
    );
    println!("  {} / {}", a?.name, b?.name);
    println!("  backend requests so far: {}", backend.requests.load(Ordering::SeqCst));

    let bookings_key = query_key!["bookings", "F1"]?;
    let lookup = Arc::clone(&backend);
    let bookings = client
        .query(&bookings_key, move |_signal| {
            let backend = Arc::clone(&lookup);
            async move { backend.list_bookings("F1").await }
        })
        .await?;
    println!("  bookings: {}", serde_json::to_string(&*bookings)?);

    println!("== Optimistic rename accepted by the backend");
    let pending = rename(&client, &backend, "F1", "Sunny Hills Annex");
    tokio::pin!(pending);
    tokio::select! {
        result = &mut pending => result?,
        () = tokio::time::sleep(Duration::from_millis(50)) => {
            println!("  while saving, cache shows: {}", cached_name(&client, "F1")?);
            pending.await?;
        }
    }
    let refreshed = load_facility(&client, &backend, "F1").await?;
    println!("  after refetch: {}", serde_json::to_string(&*refreshed)?);

    println!("== Optimistic rename rejected by the backend");
    backend.reject_next_write.store(true, Ordering::SeqCst);
    match rename(&client, &backend, "F1", "Cloudy Hills").await {
        Ok(()) => println!("  unexpectedly accepted"),
        Err(error) => println!("  rejected: {error}"),
    }
    println!("  cache after rollback: {}", cached_name(&client, "F1")?);

    println!("  backend requests in total: {}", backend.requests.load(Ordering::SeqCst));
    Ok(())
}
