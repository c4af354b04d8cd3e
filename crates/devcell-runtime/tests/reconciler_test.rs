//! Reconciler integration tests: status drift correction and usage
//! sampling against the in-memory runtime.

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod support;

use std::sync::Arc;
use std::time::Duration;

use devcell_common::constants::GIB;
use devcell_common::types::{ContainerStatus, ResourceRequest, StorageTier, UserId};
use devcell_runtime::backend::ObservedState;
use devcell_runtime::lifecycle::LiveState;
use devcell_runtime::metrics::Reconciler;
use devcell_runtime::state::StateStore;
use support::Harness;

fn small() -> ResourceRequest {
    ResourceRequest {
        storage_ssd_gb: Some(2),
        storage_hdd_gb: Some(0),
        ssh_public_key: Some("ssh-ed25519 AAAA test".into()),
        ..ResourceRequest::default()
    }
}

async fn running(h: &Harness, name: &str) -> UserId {
    let user = h.add_user(name);
    let _ = h.manager.create(&user, &small()).await.unwrap();
    user
}

fn status(h: &Harness, user: &UserId) -> ContainerStatus {
    h.store.find_container(user).unwrap().unwrap().status
}

#[tokio::test]
async fn exited_container_moves_record_to_stopped() {
    let h = Harness::new();
    let alice = running(&h, "alice").await;
    let bob = running(&h, "bob").await;
    let id = h.store.find_container(&alice).unwrap().unwrap().runtime_id.unwrap();
    h.runtime.set_state(&id, ObservedState::Exited { code: 137 });

    let drifts = Reconciler::new(Arc::clone(&h.manager)).reconcile_all().await.unwrap();
    assert_eq!(drifts.len(), 1);
    assert_eq!(drifts[0].user_id, alice);
    assert_eq!(drifts[0].from, ContainerStatus::Running);
    assert_eq!(drifts[0].to, ContainerStatus::Stopped);
    assert_eq!(drifts[0].live, LiveState::Observed(ObservedState::Exited { code: 137 }));
    assert_eq!(status(&h, &alice), ContainerStatus::Stopped);
    assert_eq!(status(&h, &bob), ContainerStatus::Running);
}

#[tokio::test]
async fn container_started_outside_moves_record_to_running() {
    let h = Harness::new();
    let alice = running(&h, "alice").await;
    let _ = h.manager.stop(&alice).await.unwrap();
    let id = h.store.find_container(&alice).unwrap().unwrap().runtime_id.unwrap();
    h.runtime.set_state(&id, ObservedState::Running);

    let drifts = Reconciler::new(Arc::clone(&h.manager)).reconcile_all().await.unwrap();
    assert_eq!(drifts.len(), 1);
    assert_eq!(status(&h, &alice), ContainerStatus::Running);
}

#[tokio::test]
async fn vanished_container_moves_record_to_error_once() {
    let h = Harness::new();
    let alice = running(&h, "alice").await;
    let id = h.store.find_container(&alice).unwrap().unwrap().runtime_id.unwrap();
    h.runtime.delete(&id);

    let reconciler = Reconciler::new(Arc::clone(&h.manager));
    let drifts = reconciler.reconcile_all().await.unwrap();
    assert_eq!(drifts[0].live, LiveState::Missing);
    assert_eq!(status(&h, &alice), ContainerStatus::Error);

    assert!(reconciler.reconcile_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn busy_user_is_skipped() {
    let h = Harness::new();
    let alice = running(&h, "alice").await;
    let id = h.store.find_container(&alice).unwrap().unwrap().runtime_id.unwrap();
    h.runtime.set_state(&id, ObservedState::Dead);

    let guard = h.manager.locks().lock(&alice).await.unwrap();
    let reconciler = Reconciler::new(Arc::clone(&h.manager));
    assert!(reconciler.reconcile_all().await.unwrap().is_empty());
    assert_eq!(status(&h, &alice), ContainerStatus::Running);

    drop(guard);
    assert_eq!(reconciler.reconcile_all().await.unwrap().len(), 1);
}

#[tokio::test]
async fn user_locked_by_another_manager_is_skipped() {
    let h = Harness::new();
    let alice = running(&h, "alice").await;
    let id = h.store.find_container(&alice).unwrap().unwrap().runtime_id.unwrap();
    h.runtime.set_state(&id, ObservedState::Dead);

    let guard = h.manager.locks().lock(&alice).await.unwrap();
    let reconciler = Reconciler::new(h.second_manager());
    assert!(reconciler.reconcile_all().await.unwrap().is_empty());
    assert_eq!(status(&h, &alice), ContainerStatus::Running);

    drop(guard);
    assert_eq!(reconciler.reconcile_all().await.unwrap().len(), 1);
}

#[tokio::test]
async fn snapshot_samples_running_containers_only() {
    let h = Harness::new();
    let alice = running(&h, "alice").await;
    let bob = running(&h, "bob").await;
    let _ = h.manager.stop(&bob).await.unwrap();
    h.host
        .set_used_bytes(&h.paths("alice", StorageTier::Fast).image, GIB);

    let samples = Reconciler::new(Arc::clone(&h.manager)).snapshot_all().await.unwrap();
    assert_eq!(samples.len(), 1);
    let sample = &samples[0];
    assert!((sample.cpu_percent - 20.0).abs() < 1e-9);
    assert_eq!(sample.memory_used_mb, 500);
    assert_eq!(sample.memory_limit_mb, 8192);
    assert!((sample.storage_ssd_used_gb - 1.0).abs() < 1e-9);
    assert!(sample.storage_hdd_used_gb.abs() < f64::EPSILON);
    assert_eq!(sample.network_rx_bytes, 1_500);

    let record = h.store.find_container(&alice).unwrap().unwrap();
    let stored = h.store.latest_usage(&record.id).unwrap().unwrap();
    assert_eq!(stored.memory_used_mb, 500);
}

#[tokio::test]
async fn sampling_failure_skips_container() {
    let h = Harness::new();
    let _ = running(&h, "alice").await;
    h.runtime.fail_next("stats");
    let samples = Reconciler::new(Arc::clone(&h.manager)).snapshot_all().await.unwrap();
    assert!(samples.is_empty());
}

#[tokio::test]
async fn run_loop_stops_on_shutdown() {
    let h = Harness::new();
    let alice = running(&h, "alice").await;
    let record = h.store.find_container(&alice).unwrap().unwrap();

    Reconciler::new(Arc::clone(&h.manager))
        .run(
            Duration::from_millis(10),
            tokio::time::sleep(Duration::from_millis(80)),
        )
        .await;
    assert!(h.store.latest_usage(&record.id).unwrap().is_some());
}

#[tokio::test]
async fn zero_interval_does_not_stop_the_loop() {
    let h = Harness::new();
    Reconciler::new(Arc::clone(&h.manager))
        .run(Duration::ZERO, tokio::time::sleep(Duration::from_millis(50)))
        .await;
}

#[tokio::test]
async fn host_snapshot_measures_tier_roots_and_memory() {
    let h = Harness::new();
    let _ = running(&h, "alice").await;

    let host = Reconciler::new(Arc::clone(&h.manager))
        .host_snapshot()
        .await
        .unwrap();
    assert!(host.ssd.total_bytes > 0);
    assert!(host.hdd.total_bytes > 0);
    assert!(host.memory.total_mb > 0);
    assert!(host.memory.available_mb <= host.memory.total_mb);
    assert!(host.load.one >= 0.0);
}
