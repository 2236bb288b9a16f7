use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use ulid::Ulid;

use reservd::config::EngineConfig;
use reservd::directory::InMemoryDirectory;
use reservd::model::*;
use reservd::{Engine, EngineError};

// ── Test infrastructure ──────────────────────────────────────

fn open_engine() -> (Arc<Engine>, PathBuf) {
    let dir = std::env::temp_dir().join(format!("reservd_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("reservations.wal");
    let config = EngineConfig {
        lock_timeout: Duration::from_secs(10),
        store_timeout: Duration::from_secs(10),
        ..EngineConfig::default()
    };
    let engine = Engine::open(&path, Arc::new(InMemoryDirectory::new()), config).unwrap();
    (Arc::new(engine), path)
}

fn ts(s: &str) -> Timestamp {
    DateTime::parse_from_rfc3339(s).unwrap()
}

/// `minutes` past 2024-01-01T00:00Z.
fn minute(minutes: i64) -> Timestamp {
    ts("2024-01-01T00:00:00Z") + chrono::Duration::minutes(minutes)
}

fn booking(resource_id: Ulid, from: i64, to: i64) -> ReservationRequest {
    ReservationRequest {
        resource_id,
        holder_id: Ulid::new(),
        start: Some(minute(from)),
        end: Some(minute(to)),
    }
}

async fn assert_invariant(engine: &Engine, resource_id: Ulid) -> Vec<Reservation> {
    let active: Vec<Reservation> = engine
        .by_resource(resource_id, Some(ReservationStatus::Active))
        .await
        .unwrap()
        .into_iter()
        .map(|v| v.reservation)
        .collect();
    for (i, a) in active.iter().enumerate() {
        for b in &active[i + 1..] {
            assert!(
                !a.span.overlaps(&b.span),
                "double booking: {} ({}) and {} ({})",
                a.id,
                a.span,
                b.id,
                b.span
            );
        }
    }
    active
}

// ── Races ────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_overlapping_creates_one_winner() {
    let (engine, _) = open_engine();
    let rid = Ulid::new();

    // 10:00-11:00 and 10:30-11:30
    let e1 = engine.clone();
    let e2 = engine.clone();
    let a = tokio::spawn(async move { e1.create(booking(rid, 600, 660)).await });
    let b = tokio::spawn(async move { e2.create(booking(rid, 630, 690)).await });
    let (a, b) = (a.await.unwrap(), b.await.unwrap());

    assert!(a.is_ok() ^ b.is_ok());
    let loser = if a.is_ok() { b } else { a };
    assert!(matches!(loser, Err(EngineError::SlotUnavailable(_))));
    assert_eq!(assert_invariant(&engine, rid).await.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn hammer_random_slots() {
    let (engine, _) = open_engine();
    let rooms: Vec<Ulid> = (0..3).map(|_| Ulid::new()).collect();

    let mut handles = Vec::new();
    for task in 0..16u64 {
        let engine = engine.clone();
        let rooms = rooms.clone();
        handles.push(tokio::spawn(async move {
            let mut mine = Vec::new();
            for step in 0..40u64 {
                // Cheap deterministic scatter; collisions are the point.
                let seed = task.wrapping_mul(7919).wrapping_add(step.wrapping_mul(104_729));
                let room = rooms[(seed % rooms.len() as u64) as usize];
                let from = ((seed / 3) % 48 * 15) as i64;
                let len = 15 + ((seed / 7) % 4 * 15) as i64;

                match seed % 5 {
                    0 if !mine.is_empty() => {
                        let id = mine.swap_remove((seed as usize / 11) % mine.len());
                        match engine.cancel(id).await {
                            Ok(_) | Err(EngineError::AlreadyCancelled(_)) => {}
                            Err(e) => panic!("cancel failed: {e}"),
                        }
                    }
                    1 if !mine.is_empty() => {
                        let id = mine[(seed as usize / 13) % mine.len()];
                        let patch = ReservationPatch {
                            start: Some(minute(from)),
                            end: Some(minute(from + len)),
                            status: None,
                        };
                        match engine.update(id, patch).await {
                            Ok(_) | Err(EngineError::SlotUnavailable(_)) => {}
                            Err(e) => panic!("update failed: {e}"),
                        }
                    }
                    _ => match engine.create(booking(room, from, from + len)).await {
                        Ok(r) => mine.push(r.id),
                        Err(EngineError::SlotUnavailable(_)) => {}
                        Err(e) => panic!("create failed: {e}"),
                    },
                }
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    for room in rooms {
        assert_invariant(&engine, room).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_and_rebook_race() {
    let (engine, _) = open_engine();
    let rid = Ulid::new();
    let held = engine.create(booking(rid, 600, 660)).await.unwrap().id;

    let e1 = engine.clone();
    let e2 = engine.clone();
    let cancel = tokio::spawn(async move { e1.cancel(held).await });
    let rebook = tokio::spawn(async move { e2.create(booking(rid, 600, 660)).await });
    let (cancel, rebook) = (cancel.await.unwrap(), rebook.await.unwrap());

    assert!(cancel.is_ok());
    // The rebook wins only if it ran after the cancel committed.
    if let Err(e) = &rebook {
        assert_eq!(e, &EngineError::SlotUnavailable(held));
    }
    assert!(assert_invariant(&engine, rid).await.len() <= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn double_cancel_race_one_winner() {
    let (engine, _) = open_engine();
    let id = engine.create(booking(Ulid::new(), 600, 660)).await.unwrap().id;

    let e1 = engine.clone();
    let e2 = engine.clone();
    let a = tokio::spawn(async move { e1.cancel(id).await });
    let b = tokio::spawn(async move { e2.cancel(id).await });
    let results = [a.await.unwrap(), b.await.unwrap()];

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results.contains(&Err(EngineError::AlreadyCancelled(id))));
}

// ── Durability ───────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn raced_state_survives_reopen() {
    let (engine, path) = open_engine();
    let rid = Ulid::new();

    let handles: Vec<_> = (0..20)
        .map(|i| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.create(booking(rid, i * 20, i * 20 + 45)).await })
        })
        .collect();
    for h in handles {
        let _ = h.await.unwrap();
    }
    let before = assert_invariant(&engine, rid).await;
    assert!(!before.is_empty());
    drop(engine);

    let reopened =
        Engine::open(&path, Arc::new(InMemoryDirectory::new()), EngineConfig::default()).unwrap();
    let after = assert_invariant(&reopened, rid).await;
    let ids = |rs: &[Reservation]| rs.iter().map(|r| r.id).collect::<Vec<_>>();
    assert_eq!(ids(&before), ids(&after));
}
