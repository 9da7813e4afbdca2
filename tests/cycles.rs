//! Data cycle lifecycle and active-cycle resolution.

use chrono::NaiveDate;
use skyfeed::cycles::lifecycle::{CycleError, CycleService, MAX_ROLLED_BACK_CYCLES};
use skyfeed::cycles::{CycleFilter, CycleManager};
use skyfeed::data::memory::MemoryCycleStore;
use skyfeed::data::models::{CycleStatus, DataCycle, DataGroup, NewDataCycle};
use std::collections::BTreeMap;
use std::sync::Arc;

fn setup() -> (Arc<MemoryCycleStore>, CycleService) {
    let store = Arc::new(MemoryCycleStore::new());
    let manager = Arc::new(CycleManager::new(store.clone()));
    (store.clone(), CycleService::new(store, manager))
}

fn new_cycle(group: DataGroup, code: &str, effective: (i32, u32, u32)) -> NewDataCycle {
    let effective_date = NaiveDate::from_ymd_opt(effective.0, effective.1, effective.2).unwrap();
    NewDataCycle {
        data_group: group,
        cycle_code: code.to_owned(),
        effective_date,
        expiration_date: effective_date + chrono::Duration::days(28),
        source_url: None,
    }
}

/// Create, stage and activate a cycle.
async fn activated(service: &CycleService, group: DataGroup, code: &str) -> DataCycle {
    let cycle = service.create(new_cycle(group, code, (2026, 1, 22))).await.unwrap();
    service.stage(cycle.id).await.unwrap();
    service.activate(cycle.id).await.unwrap()
}

#[tokio::test]
async fn full_lifecycle_demotes_previous_active() {
    let (_, service) = setup();
    let manager = service.manager().clone();

    let first = activated(&service, DataGroup::Nasr, "2601").await;
    assert_eq!(first.status, CycleStatus::Active);
    assert!(first.activated_at.is_some());
    assert_eq!(manager.active_cycle_id(DataGroup::Nasr, None).await.unwrap(), Some(first.id));

    let second = activated(&service, DataGroup::Nasr, "2602").await;
    assert_eq!(service.get(first.id).await.unwrap().status, CycleStatus::RolledBack);
    assert_eq!(manager.active_cycle_id(DataGroup::Nasr, None).await.unwrap(), Some(second.id));

    let restored = service.rollback(first.id).await.unwrap();
    assert_eq!(restored.status, CycleStatus::Active);
    assert_eq!(service.get(second.id).await.unwrap().status, CycleStatus::RolledBack);
    assert_eq!(manager.active_cycle_id(DataGroup::Nasr, None).await.unwrap(), Some(first.id));

    let active = service.active().await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, first.id);
}

#[tokio::test]
async fn groups_are_independent() {
    let (_, service) = setup();
    let nasr = activated(&service, DataGroup::Nasr, "2601").await;
    let cifp = activated(&service, DataGroup::Cifp, "2601").await;

    assert_eq!(service.get(nasr.id).await.unwrap().status, CycleStatus::Active);
    assert_eq!(service.get(cifp.id).await.unwrap().status, CycleStatus::Active);
    assert_eq!(service.active().await.unwrap().len(), 2);
}

#[tokio::test]
async fn transitions_require_expected_status() {
    let (_, service) = setup();
    let cycle = service
        .create(new_cycle(DataGroup::Dtpp, "2601", (2026, 1, 22)))
        .await
        .unwrap();

    let err = service.activate(cycle.id).await.unwrap_err();
    assert!(matches!(
        err,
        CycleError::InvalidTransition {
            actual: CycleStatus::Seeding,
            expected: CycleStatus::Staged,
            ..
        }
    ));
    assert!(matches!(
        service.rollback(cycle.id).await.unwrap_err(),
        CycleError::InvalidTransition { .. }
    ));

    service.stage(cycle.id).await.unwrap();
    assert!(matches!(
        service.stage(cycle.id).await.unwrap_err(),
        CycleError::InvalidTransition { .. }
    ));
}

#[tokio::test]
async fn duplicate_code_conflicts() {
    let (_, service) = setup();
    service
        .create(new_cycle(DataGroup::Cifp, "2601", (2026, 1, 22)))
        .await
        .unwrap();

    let err = service
        .create(new_cycle(DataGroup::Cifp, "2601", (2026, 1, 22)))
        .await
        .unwrap_err();
    assert!(matches!(err, CycleError::Conflict { group: DataGroup::Cifp, .. }));

    // Same code in a different group is fine.
    service
        .create(new_cycle(DataGroup::Nasr, "2601", (2026, 1, 22)))
        .await
        .unwrap();
}

#[tokio::test]
async fn activation_keeps_only_recent_rolled_back_cycles() {
    let (store, service) = setup();
    let mut ids = Vec::new();
    for code in ["2601", "2602", "2603", "2604", "2605"] {
        let cycle = activated(&service, DataGroup::Nasr, code).await;
        store.add_rows("a_airports", cycle.id, 3);
        ids.push(cycle.id);
    }

    let cycles = service.list(Some(DataGroup::Nasr)).await.unwrap();
    let rolled_back = cycles
        .iter()
        .filter(|c| c.status == CycleStatus::RolledBack)
        .count();
    assert_eq!(rolled_back, MAX_ROLLED_BACK_CYCLES);
    assert_eq!(cycles.len(), MAX_ROLLED_BACK_CYCLES + 1);

    // The oldest cycles and their rows are gone.
    assert!(matches!(service.get(ids[0]).await.unwrap_err(), CycleError::NotFound(_)));
    assert_eq!(store.row_count("a_airports", ids[0]), 0);
    assert_eq!(store.row_count("a_airports", ids[4]), 3);
}

#[tokio::test]
async fn remove_refuses_active_and_deletes_rows_otherwise() {
    let (store, service) = setup();
    let active = activated(&service, DataGroup::Cifp, "2601").await;
    assert!(matches!(
        service.remove(active.id).await.unwrap_err(),
        CycleError::ActiveDeletion
    ));

    let staged = service
        .create(new_cycle(DataGroup::Cifp, "2602", (2026, 2, 19)))
        .await
        .unwrap();
    store.add_rows("a_cifp_legs", staged.id, 5);
    store.add_rows("a_cifp_runways", staged.id, 2);

    let report = service.remove(staged.id).await.unwrap();
    assert_eq!(report.rows_deleted.get("a_cifp_legs"), Some(&5));
    assert_eq!(report.rows_deleted.get("a_cifp_runways"), Some(&2));
    assert_eq!(store.row_count("a_cifp_legs", staged.id), 0);
    assert!(service.get(active.id).await.is_ok());
}

#[tokio::test]
async fn record_counts_are_merged() {
    let (_, service) = setup();
    let cycle = service
        .create(new_cycle(DataGroup::Nasr, "2601", (2026, 1, 22)))
        .await
        .unwrap();

    let first = BTreeMap::from([("a_airports".to_owned(), 19_000), ("a_runways".to_owned(), 1)]);
    service.update_record_counts(cycle.id, &first).await.unwrap();
    let second = BTreeMap::from([("a_runways".to_owned(), 24_000)]);
    let updated = service.update_record_counts(cycle.id, &second).await.unwrap();

    assert_eq!(updated.record_counts.0.get("a_airports"), Some(&19_000));
    assert_eq!(updated.record_counts.0.get("a_runways"), Some(&24_000));
}

#[tokio::test]
async fn pending_lists_staged_cycles_already_effective() {
    let (_, service) = setup();
    let due = service
        .create(new_cycle(DataGroup::Nasr, "2601", (2026, 1, 22)))
        .await
        .unwrap();
    let future = service
        .create(new_cycle(DataGroup::Nasr, "2602", (2026, 2, 19)))
        .await
        .unwrap();
    service.stage(due.id).await.unwrap();
    service.stage(future.id).await.unwrap();

    let today = NaiveDate::from_ymd_opt(2026, 2, 1).unwrap();
    let pending = service.pending(today).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, due.id);
}

#[tokio::test]
async fn group_without_active_cycle_reads_legacy_rows() {
    let (_, service) = setup();
    let manager = service.manager().clone();

    let filter = manager.filter(DataGroup::Dtpp, None).await.unwrap();
    assert_eq!(filter, CycleFilter::Legacy);
    assert!(filter.matches(None));

    let cycle = activated(&service, DataGroup::Dtpp, "2601").await;
    let filter = manager.filter(DataGroup::Dtpp, None).await.unwrap();
    assert_eq!(filter, CycleFilter::Cycle(cycle.id));
    assert!(filter.matches(Some(cycle.id)));
    assert!(!filter.matches(None));
}

#[tokio::test]
async fn override_selects_a_staged_cycle() {
    let (_, service) = setup();
    let manager = service.manager().clone();
    let active = activated(&service, DataGroup::Nasr, "2601").await;
    let staged = service
        .create(new_cycle(DataGroup::Nasr, "2602", (2026, 2, 19)))
        .await
        .unwrap();

    let filter = manager.filter(DataGroup::Nasr, Some(staged.id)).await.unwrap();
    assert_eq!(filter.cycle_id(), Some(staged.id));
    assert_eq!(manager.active_cycle_id(DataGroup::Nasr, None).await.unwrap(), Some(active.id));
}
