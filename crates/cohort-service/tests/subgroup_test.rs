//! Integration tests for subgroup changes, cycle prevention and subgraph
//! locking.

mod common;

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use cohort_core::error::CohortError;
use cohort_core::models::setting::{GroupSetting, SettingValue};
use cohort_core::repository::{GroupRepository, GroupTransaction};
use cohort_db::StoreConfig;
use cohort_service::{CreateGroupRequest, RecursiveLockCoordinator, ServiceConfig};
use common::{setup, setup_with};
use uuid::Uuid;

#[tokio::test]
async fn eng_leads_cycle_is_rejected() {
    let fx = setup().await;
    let one = fx.user("One").await;
    let two = fx.user("Two").await;
    let eng = fx.group("eng", &[one.id, two.id]).await;
    let leads = fx.group("leads", &[one.id]).await;

    fx.service
        .add_subgroups(&fx.admin, eng.id, &[leads.id])
        .await
        .unwrap();

    let result = fx
        .service
        .add_subgroups(&fx.admin, leads.id, &[eng.id])
        .await;
    assert!(matches!(
        result,
        Err(CohortError::Cycle { supergroup_id }) if supergroup_id == leads.id
    ));
    assert!(
        fx.service
            .list_subgroups(&fx.admin, leads.id, true)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn indirect_cycle_and_self_reference_are_rejected() {
    let fx = setup().await;
    let a = fx.group("a", &[]).await;
    let b = fx.group("b", &[]).await;
    let c = fx.group("c", &[]).await;
    fx.service.add_subgroups(&fx.admin, a.id, &[b.id]).await.unwrap();
    fx.service.add_subgroups(&fx.admin, b.id, &[c.id]).await.unwrap();

    let result = fx.service.add_subgroups(&fx.admin, c.id, &[a.id]).await;
    assert!(matches!(result, Err(CohortError::Cycle { .. })));

    let result = fx.service.add_subgroups(&fx.admin, a.id, &[a.id]).await;
    assert!(matches!(result, Err(CohortError::Cycle { .. })));

    // Diamonds are fine.
    fx.service.add_subgroups(&fx.admin, a.id, &[c.id]).await.unwrap();
    let below_a: BTreeSet<Uuid> = fx
        .service
        .list_subgroups(&fx.admin, a.id, false)
        .await
        .unwrap()
        .into_iter()
        .collect();
    assert_eq!(below_a, BTreeSet::from([b.id, c.id]));
}

#[tokio::test]
async fn adding_existing_subgroup_conflicts() {
    let fx = setup().await;
    let eng = fx.group("eng", &[]).await;
    let leads = fx.group("leads", &[]).await;
    let interns = fx.group("interns", &[]).await;
    fx.service
        .add_subgroups(&fx.admin, eng.id, &[leads.id])
        .await
        .unwrap();

    let result = fx
        .service
        .add_subgroups(&fx.admin, eng.id, &[interns.id, leads.id])
        .await;
    assert!(matches!(result, Err(CohortError::Conflict { .. })));
    assert_eq!(
        fx.service.list_subgroups(&fx.admin, eng.id, true).await.unwrap(),
        vec![leads.id]
    );
}

#[tokio::test]
async fn removing_subgroups() {
    let fx = setup().await;
    let eng = fx.group("eng", &[]).await;
    let leads = fx.group("leads", &[]).await;
    let interns = fx.group("interns", &[]).await;
    fx.service
        .add_subgroups(&fx.admin, eng.id, &[leads.id])
        .await
        .unwrap();

    let result = fx
        .service
        .remove_subgroups(&fx.admin, eng.id, &[interns.id])
        .await;
    assert!(matches!(result, Err(CohortError::Conflict { .. })));

    fx.service
        .remove_subgroups(&fx.admin, eng.id, &[leads.id])
        .await
        .unwrap();
    assert!(
        fx.service
            .list_subgroups(&fx.admin, eng.id, true)
            .await
            .unwrap()
            .is_empty()
    );

    // Now the reverse edge is allowed.
    fx.service
        .add_subgroups(&fx.admin, leads.id, &[eng.id])
        .await
        .unwrap();
}

#[tokio::test]
async fn empty_subgroup_lists_are_no_ops() {
    let fx = setup().await;
    let eng = fx.group("eng", &[]).await;

    fx.service.add_subgroups(&fx.admin, eng.id, &[]).await.unwrap();
    fx.service.remove_subgroups(&fx.admin, eng.id, &[]).await.unwrap();
    assert!(
        fx.service
            .list_subgroups(&fx.admin, eng.id, true)
            .await
            .unwrap()
            .is_empty()
    );

    let result = fx.service.update_subgroups(&fx.admin, eng.id, &[], &[]).await;
    assert!(matches!(result, Err(CohortError::Validation { .. })));
}

#[tokio::test]
async fn update_subgroups_is_atomic() {
    let fx = setup().await;
    let eng = fx.group("eng", &[]).await;
    let leads = fx.group("leads", &[]).await;
    let interns = fx.group("interns", &[]).await;
    fx.service
        .add_subgroups(&fx.admin, eng.id, &[leads.id])
        .await
        .unwrap();

    fx.service
        .update_subgroups(&fx.admin, eng.id, &[interns.id], &[leads.id])
        .await
        .unwrap();
    assert_eq!(
        fx.service.list_subgroups(&fx.admin, eng.id, true).await.unwrap(),
        vec![interns.id]
    );

    // leads is no longer a subgroup, so the whole request fails.
    let result = fx
        .service
        .update_subgroups(&fx.admin, eng.id, &[leads.id], &[leads.id])
        .await;
    assert!(matches!(result, Err(CohortError::Conflict { .. })));
    assert_eq!(
        fx.service.list_subgroups(&fx.admin, eng.id, true).await.unwrap(),
        vec![interns.id]
    );
}

#[tokio::test]
async fn unknown_or_anonymous_candidates_are_not_found() {
    let fx = setup().await;
    let eng = fx.group("eng", &[]).await;

    let result = fx
        .service
        .add_subgroups(&fx.admin, eng.id, &[Uuid::new_v4()])
        .await;
    assert!(matches!(result, Err(CohortError::NotFound { .. })));

    let alice = fx.user("Alice").await;
    let support = fx
        .service
        .create_group(
            &fx.admin,
            CreateGroupRequest {
                name: "support".into(),
                settings: BTreeMap::from([(
                    GroupSetting::CanMentionGroup,
                    SettingValue::anonymous([alice.id], []),
                )]),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let anonymous = support.settings[&GroupSetting::CanMentionGroup];

    let result = fx
        .service
        .add_subgroups(&fx.admin, eng.id, &[anonymous])
        .await;
    assert!(matches!(result, Err(CohortError::NotFound { .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_opposite_edges_never_both_succeed() {
    for _ in 0..20 {
        let fx = setup().await;
        let a = fx.group("a", &[]).await.id;
        let b = fx.group("b", &[]).await.id;

        let first = {
            let service = fx.service.clone();
            let admin = fx.admin.clone();
            tokio::spawn(async move { service.add_subgroups(&admin, a, &[b]).await })
        };
        let second = {
            let service = fx.service.clone();
            let admin = fx.admin.clone();
            tokio::spawn(async move { service.add_subgroups(&admin, b, &[a]).await })
        };

        let results = [first.await.unwrap(), second.await.unwrap()];
        let succeeded = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(succeeded, 1, "{results:?}");
        assert!(
            results
                .iter()
                .any(|r| matches!(r, Err(CohortError::Cycle { .. })))
        );

        let below_a = fx.groups.recursive_subgroup_ids(fx.realm_id, a).await.unwrap();
        let below_b = fx.groups.recursive_subgroup_ids(fx.realm_id, b).await.unwrap();
        assert!(!(below_a.contains(&b) && below_b.contains(&a)));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_chain_stays_acyclic() {
    let fx = setup_with(
        StoreConfig {
            lock_wait_timeout_ms: 500,
        },
        ServiceConfig::default(),
    )
    .await;
    let mut ids = Vec::new();
    for i in 0..6 {
        ids.push(fx.group(&format!("g{i}"), &[]).await.id);
    }

    // Every ordered pair in both directions, all at once.
    let mut handles = Vec::new();
    for &parent in &ids {
        for &child in &ids {
            if parent == child {
                continue;
            }
            let service = fx.service.clone();
            let admin = fx.admin.clone();
            handles.push(tokio::spawn(async move {
                service.add_subgroups(&admin, parent, &[child]).await
            }));
        }
    }
    for handle in handles {
        match handle.await.unwrap() {
            Ok(()) | Err(CohortError::Cycle { .. }) | Err(CohortError::Conflict { .. }) => {}
            Err(CohortError::Contention { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    for id in &ids {
        let below = fx.groups.recursive_subgroup_ids(fx.realm_id, *id).await.unwrap();
        assert!(!below.contains(id), "group {id} reaches itself");
    }
}

#[tokio::test]
async fn locked_subgraph_snapshot() {
    let fx = setup().await;
    let company = fx.group("company", &[]).await;
    let eng = fx.group("eng", &[]).await;
    let leads = fx.group("leads", &[]).await;
    fx.service
        .add_subgroups(&fx.admin, eng.id, &[leads.id])
        .await
        .unwrap();

    let coordinator = RecursiveLockCoordinator::new(&fx.groups, 8);
    let locked = coordinator
        .lock_subgraph(fx.realm_id, &[eng.id], company.id)
        .await
        .unwrap();

    assert_eq!(locked.supergroup.id, company.id);
    assert_eq!(locked.direct_subgroups.len(), 1);
    assert_eq!(locked.direct_subgroups[0].id, eng.id);
    let recursive: BTreeSet<Uuid> = locked.recursive_subgroups.iter().map(|g| g.id).collect();
    assert_eq!(recursive, BTreeSet::from([eng.id, leads.id]));
    assert!(locked.supergroup_subgroup_ids().is_empty());
    assert!(!locked.would_create_cycle(&[eng.id]));
    assert_eq!(
        locked.closure_of([eng.id]),
        BTreeSet::from([eng.id, leads.id])
    );
}

#[tokio::test]
async fn locks_are_released_when_scope_ends() {
    let fx = setup_with(
        StoreConfig {
            lock_wait_timeout_ms: 100,
        },
        ServiceConfig::default(),
    )
    .await;
    let eng = fx.group("eng", &[]).await;
    let leads = fx.group("leads", &[]).await;
    let coordinator = RecursiveLockCoordinator::new(&fx.groups, 8);

    {
        let _locked = coordinator
            .lock_subgraph(fx.realm_id, &[leads.id], eng.id)
            .await
            .unwrap();

        // Someone else touching the same region times out.
        let result = fx
            .service
            .add_subgroups(&fx.admin, eng.id, &[leads.id])
            .await;
        let err = result.unwrap_err();
        assert!(matches!(err, CohortError::Contention { .. }));
        assert!(err.is_retryable());
    }

    // Dropped without committing: locks released, nothing written.
    fx.service
        .add_subgroups(&fx.admin, eng.id, &[leads.id])
        .await
        .unwrap();
}

#[tokio::test]
async fn validation_failure_releases_locks() {
    let fx = setup_with(
        StoreConfig {
            lock_wait_timeout_ms: 100,
        },
        ServiceConfig::default(),
    )
    .await;
    let eng = fx.group("eng", &[]).await;
    let leads = fx.group("leads", &[]).await;
    fx.service
        .add_subgroups(&fx.admin, eng.id, &[leads.id])
        .await
        .unwrap();

    let result = fx
        .service
        .add_subgroups(&fx.admin, eng.id, &[leads.id])
        .await;
    assert!(matches!(result, Err(CohortError::Conflict { .. })));

    // A plain transaction can lock the same rows straight away.
    let mut tx = fx.groups.begin();
    tx.lock_for_update(fx.realm_id, &BTreeSet::from([eng.id, leads.id]))
        .await
        .unwrap();
    drop(tx);

    tokio::time::timeout(
        Duration::from_secs(1),
        fx.service.remove_subgroups(&fx.admin, eng.id, &[leads.id]),
    )
    .await
    .unwrap()
    .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn closure_growth_relocks_without_deadlock() {
    let fx = setup_with(
        StoreConfig {
            lock_wait_timeout_ms: 1000,
        },
        ServiceConfig::default(),
    )
    .await;
    let mut ids = Vec::new();
    for name in ["x", "y", "z"] {
        ids.push(fx.group(name, &[]).await.id);
    }
    ids.sort();
    let (low, mid, high) = (ids[0], ids[1], ids[2]);

    // Hold the supergroup so the coordinator queues behind it.
    let mut holder = fx.groups.begin();
    holder
        .lock_for_update(fx.realm_id, &BTreeSet::from([mid]))
        .await
        .unwrap();

    let coordinator = {
        let groups = fx.groups.clone();
        let realm_id = fx.realm_id;
        tokio::spawn(async move {
            let locked = RecursiveLockCoordinator::new(&groups, 8)
                .lock_subgraph(realm_id, &[high], mid)
                .await?;
            Ok::<_, CohortError>(
                locked
                    .recursive_subgroups
                    .iter()
                    .map(|g| g.id)
                    .collect::<BTreeSet<Uuid>>(),
            )
        })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    // The closure of `high` now reaches the lowest id.
    fx.groups
        .add_subgroups(fx.realm_id, high, &[low])
        .await
        .unwrap();
    let mut other = fx.groups.begin();
    other
        .lock_for_update(fx.realm_id, &BTreeSet::from([low]))
        .await
        .unwrap();

    drop(holder);
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Needs `high`, which the coordinator took together with `mid`.
    other
        .lock_for_update(fx.realm_id, &BTreeSet::from([low, high]))
        .await
        .unwrap();
    drop(other);

    let locked = tokio::time::timeout(Duration::from_secs(5), coordinator)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(locked, BTreeSet::from([low, high]));
}
