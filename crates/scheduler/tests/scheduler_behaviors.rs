//! Observable scheduling behavior.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::collections::HashSet;
use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use deferq_core::{Clock, ErrorKind, ManualClock};
use deferq_scheduler::{PriorityScheduler, SchedulerConfig};
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn manual() -> (Arc<ManualClock>, PriorityScheduler) {
    let clock = Arc::new(ManualClock::starting_now());
    let scheduler = PriorityScheduler::with_clock(SchedulerConfig::default(), clock.clone());
    (clock, scheduler)
}

#[tokio::test]
async fn never_fires_before_due_time() -> Result<(), Box<dyn Error>> {
    let scheduler = PriorityScheduler::new(SchedulerConfig::default());
    let (tx, mut rx) = mpsc::unbounded_channel();

    let due_at = Utc::now() + TimeDelta::milliseconds(150);
    scheduler
        .add_task("soon", due_at, move || async move {
            let _ = tx.send(Utc::now());
        })
        .await?;

    let fired_at = timeout(WAIT, rx.recv()).await?.unwrap();
    assert!(fired_at >= due_at);

    scheduler.stop().await;
    Ok(())
}

#[tokio::test]
async fn earlier_due_time_fires_first() -> Result<(), Box<dyn Error>> {
    let scheduler = PriorityScheduler::new(SchedulerConfig::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let now = Utc::now();

    for (name, offset) in [("late", 200), ("early", 50), ("middle", 120)] {
        let tx = tx.clone();
        scheduler
            .add_task(name, now + TimeDelta::milliseconds(offset), move || async move {
                let _ = tx.send(name);
            })
            .await?;
    }

    let mut order = Vec::new();
    for _ in 0..3 {
        order.push(timeout(WAIT, rx.recv()).await?.unwrap());
    }
    assert_eq!(order, ["early", "middle", "late"]);

    scheduler.stop().await;
    Ok(())
}

#[tokio::test]
async fn removed_item_never_runs() -> Result<(), Box<dyn Error>> {
    let (clock, scheduler) = manual();
    let ran = Arc::new(AtomicBool::new(false));

    let flag = Arc::clone(&ran);
    scheduler
        .add_task("doomed", clock.deadline(Duration::from_secs(10)), move || async move {
            flag.store(true, Ordering::SeqCst);
        })
        .await?;
    scheduler.remove_task("doomed").await?;

    clock.advance(Duration::from_secs(60));
    scheduler.wake().await?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(!ran.load(Ordering::SeqCst));
    assert!(scheduler.snapshot().await?.is_empty());

    // Removing again, or removing something unknown, is a no-op.
    scheduler.remove_task("doomed").await?;
    scheduler.remove_task("never-added").await?;

    scheduler.stop().await;
    Ok(())
}

#[tokio::test]
async fn remove_after_firing_changes_nothing() -> Result<(), Box<dyn Error>> {
    let (clock, scheduler) = manual();
    let (tx, mut rx) = mpsc::unbounded_channel();

    for (name, delay) in [("fired", 0), ("bystander", 30)] {
        let tx = tx.clone();
        scheduler
            .add_task(name, clock.deadline(Duration::from_secs(delay)), move || async move {
                let _ = tx.send(name);
            })
            .await?;
    }
    assert_eq!(timeout(WAIT, rx.recv()).await?, Some("fired"));

    scheduler.remove_task("fired").await?;

    let left: Vec<_> = scheduler
        .snapshot()
        .await?
        .into_iter()
        .map(|entry| entry.identity)
        .collect();
    assert_eq!(left, ["bystander"]);

    clock.advance(Duration::from_secs(60));
    scheduler.wake().await?;
    assert_eq!(timeout(WAIT, rx.recv()).await?, Some("bystander"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());

    scheduler.stop().await;
    Ok(())
}

#[tokio::test]
async fn remove_rejects_empty_identity() {
    let (_clock, scheduler) = manual();
    let err = scheduler.remove_task("").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    scheduler.stop().await;
}

#[tokio::test]
async fn re_adding_identity_replaces_action() -> Result<(), Box<dyn Error>> {
    let (clock, scheduler) = manual();
    let (tx, mut rx) = mpsc::unbounded_channel();

    for version in 1..=3 {
        let tx = tx.clone();
        scheduler
            .add_task("same", clock.deadline(Duration::from_secs(version)), move || async move {
                let _ = tx.send(version);
            })
            .await?;
    }

    let entries = scheduler.snapshot().await?;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].due_at, clock.deadline(Duration::from_secs(3)));

    clock.advance(Duration::from_secs(10));
    scheduler.wake().await?;

    assert_eq!(timeout(WAIT, rx.recv()).await?, Some(3));
    assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());

    scheduler.stop().await;
    Ok(())
}

#[tokio::test]
async fn empty_identity_is_generated() -> Result<(), Box<dyn Error>> {
    let (clock, scheduler) = manual();

    let a = scheduler.add_task("", clock.now(), || async {}).await?;
    let b = scheduler
        .add_task("", clock.deadline(Duration::from_secs(5)), || async {})
        .await?;

    assert!(!a.is_empty());
    assert_ne!(a, b);

    scheduler.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_see_consistent_heap() -> Result<(), Box<dyn Error>> {
    let clock = Arc::new(ManualClock::starting_now());
    let scheduler = Arc::new(PriorityScheduler::with_clock(
        SchedulerConfig {
            op_queue_capacity: 4,
            ..SchedulerConfig::default()
        },
        clock.clone(),
    ));
    let far = clock.deadline(Duration::from_secs(3600));

    let mut callers = Vec::new();
    for worker in 0..16 {
        let scheduler = Arc::clone(&scheduler);
        callers.push(tokio::spawn(async move {
            for n in 0..25 {
                let id = format!("w{worker}-{n}");
                scheduler.add_task(id.clone(), far, || async {}).await.unwrap();
                if n % 2 == 0 {
                    scheduler.add_task(id.clone(), far, || async {}).await.unwrap();
                }
                if n % 5 == 0 {
                    scheduler.remove_task(&id).await.unwrap();
                }
            }
        }));
    }
    for caller in callers {
        caller.await?;
    }

    let entries = scheduler.snapshot().await?;
    let unique: HashSet<_> = entries.iter().map(|e| e.identity.as_str()).collect();

    assert_eq!(unique.len(), entries.len());
    assert_eq!(entries.len(), 16 * 20);
    assert!(!unique.contains("w0-0"));
    assert!(unique.contains("w15-24"));

    scheduler.stop().await;
    Ok(())
}

#[tokio::test]
async fn panicking_action_is_contained() -> Result<(), Box<dyn Error>> {
    let (clock, scheduler) = manual();
    let (tx, mut rx) = mpsc::unbounded_channel();

    scheduler
        .add_task("boom", clock.now(), || async {
            panic!("action failed");
        })
        .await?;
    scheduler
        .add_task("fine", clock.now(), move || async move {
            let _ = tx.send("fine");
        })
        .await?;

    assert_eq!(timeout(WAIT, rx.recv()).await?, Some("fine"));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(scheduler.snapshot().await?.is_empty());

    scheduler.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn running_actions_are_bounded() -> Result<(), Box<dyn Error>> {
    let clock = Arc::new(ManualClock::starting_now());
    let scheduler = PriorityScheduler::with_clock(
        SchedulerConfig {
            max_concurrent_actions: 2,
            ..SchedulerConfig::default()
        },
        clock.clone(),
    );

    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = mpsc::unbounded_channel();

    for n in 0..6 {
        let active = Arc::clone(&active);
        let peak = Arc::clone(&peak);
        let tx = tx.clone();
        scheduler
            .add_task(format!("job-{n}"), clock.now(), move || async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                let _ = tx.send(n);
            })
            .await?;
    }

    for _ in 0..6 {
        timeout(WAIT, rx.recv()).await?.unwrap();
    }
    assert!(peak.load(Ordering::SeqCst) <= 2);

    scheduler.stop().await;
    Ok(())
}

#[tokio::test]
async fn stop_is_final_and_idempotent() -> Result<(), Box<dyn Error>> {
    let (clock, scheduler) = manual();
    let ran = Arc::new(AtomicBool::new(false));

    let flag = Arc::clone(&ran);
    scheduler
        .add_task("pending", clock.deadline(Duration::from_secs(1)), move || async move {
            flag.store(true, Ordering::SeqCst);
        })
        .await?;

    scheduler.stop().await;
    scheduler.stop().await;
    assert!(scheduler.is_stopped());

    clock.advance(Duration::from_secs(5));
    let err = scheduler.add_task("late", clock.now(), || async {}).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Aborted);
    assert_eq!(scheduler.wake().await.unwrap_err().kind(), ErrorKind::Aborted);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!ran.load(Ordering::SeqCst));
    Ok(())
}
