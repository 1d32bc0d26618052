//! Integration tests for the group repository and transactions.

use std::collections::{BTreeMap, BTreeSet};

use cohort_core::error::CohortError;
use cohort_core::models::group::{CreateGroup, UpdateGroup};
use cohort_core::models::setting::GroupSetting;
use cohort_core::repository::{GroupRepository, GroupTransaction, Pagination};
use cohort_db::repository::SurrealGroupRepository;
use cohort_db::{GraphStore, StoreConfig, run_migrations};
use surrealdb::Surreal;
use surrealdb::engine::local::{Db, Mem};
use uuid::Uuid;

type Repo = SurrealGroupRepository<Db>;

/// Helper: in-memory SurrealDB with migrations applied.
async fn repo_with(config: StoreConfig) -> Repo {
    let db = Surreal::new::<Mem>(()).await.unwrap();
    db.use_ns("test").use_db("test").await.unwrap();
    run_migrations(&db).await.unwrap();
    SurrealGroupRepository::new(GraphStore::new(db, config))
}

/// Helper: fresh repository plus a realm id.
async fn setup() -> (Repo, Uuid) {
    (repo_with(StoreConfig::default()).await, Uuid::new_v4())
}

async fn named(repo: &Repo, realm_id: Uuid, name: &str) -> Uuid {
    repo.create(CreateGroup::named(realm_id, name, format!("{name} group")))
        .await
        .unwrap()
        .id
}

#[tokio::test]
async fn create_and_get_group() {
    let (repo, realm_id) = setup().await;

    let group = repo
        .create(CreateGroup::named(realm_id, "Developers", "Software developers"))
        .await
        .unwrap();

    assert_eq!(group.realm_id, realm_id);
    assert_eq!(group.name, "Developers");
    assert_eq!(group.description, "Software developers");
    assert!(!group.is_anonymous());

    let fetched = repo.get_by_id(realm_id, group.id).await.unwrap();
    assert_eq!(fetched.id, group.id);

    let by_name = repo.get_by_name(realm_id, "Developers").await.unwrap();
    assert_eq!(by_name.id, group.id);
}

#[tokio::test]
async fn update_group() {
    let (repo, realm_id) = setup().await;
    let id = named(&repo, realm_id, "Original").await;

    let updated = repo
        .update(
            realm_id,
            id,
            UpdateGroup {
                name: Some("Renamed".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(updated.name, "Renamed");
    assert_eq!(updated.description, "Original group"); // unchanged
    assert!(updated.updated_at >= updated.created_at);
}

#[tokio::test]
async fn delete_group() {
    let (repo, realm_id) = setup().await;
    let id = named(&repo, realm_id, "ToDelete").await;

    repo.delete(realm_id, id).await.unwrap();

    let result = repo.get_by_id(realm_id, id).await;
    assert!(matches!(result, Err(CohortError::NotFound { .. })));
}

#[tokio::test]
async fn list_groups_with_pagination() {
    let (repo, realm_id) = setup().await;

    for i in 0..5 {
        named(&repo, realm_id, &format!("group-{i}")).await;
    }
    // Anonymous groups are never listed.
    repo.create(CreateGroup::anonymous(realm_id)).await.unwrap();

    let page1 = repo
        .list(
            realm_id,
            Pagination {
                offset: 0,
                limit: 3,
            },
        )
        .await
        .unwrap();

    assert_eq!(page1.items.len(), 3);
    assert_eq!(page1.total, 5);

    let page2 = repo
        .list(
            realm_id,
            Pagination {
                offset: 3,
                limit: 3,
            },
        )
        .await
        .unwrap();

    assert_eq!(page2.items.len(), 2);
    let first: BTreeSet<Uuid> = page1.items.iter().map(|g| g.id).collect();
    assert!(page2.items.iter().all(|g| !first.contains(&g.id)));
}

#[tokio::test]
async fn duplicate_name_rejected() {
    let (repo, realm_id) = setup().await;
    named(&repo, realm_id, "unique-group").await;

    let result = repo
        .create(CreateGroup::named(realm_id, "unique-group", "second"))
        .await;

    assert!(matches!(result, Err(CohortError::Validation { .. })));

    // The same name is free in another realm.
    let other_realm = Uuid::new_v4();
    named(&repo, other_realm, "unique-group").await;
}

#[tokio::test]
async fn add_and_remove_members() {
    let (repo, realm_id) = setup().await;
    let group = named(&repo, realm_id, "Team").await;
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

    repo.add_members(realm_id, group, &[alice, bob]).await.unwrap();

    let members = repo.direct_member_ids(realm_id, group).await.unwrap();
    assert_eq!(members.len(), 2);
    assert!(members.contains(&alice));
    assert!(members.contains(&bob));

    repo.remove_members(realm_id, group, &[alice]).await.unwrap();
    let members = repo.direct_member_ids(realm_id, group).await.unwrap();
    assert_eq!(members, vec![bob]);
}

#[tokio::test]
async fn duplicate_member_conflicts_and_changes_nothing() {
    let (repo, realm_id) = setup().await;
    let group = named(&repo, realm_id, "Team").await;
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    repo.add_members(realm_id, group, &[alice]).await.unwrap();

    let result = repo.add_members(realm_id, group, &[bob, alice]).await;
    assert!(matches!(result, Err(CohortError::Conflict { .. })));
    assert_eq!(
        repo.direct_member_ids(realm_id, group).await.unwrap(),
        vec![alice]
    );

    let result = repo.remove_members(realm_id, group, &[bob]).await;
    assert!(matches!(result, Err(CohortError::Conflict { .. })));
}

#[tokio::test]
async fn recursive_queries_follow_subgroup_edges() {
    let (repo, realm_id) = setup().await;
    let company = named(&repo, realm_id, "company").await;
    let eng = named(&repo, realm_id, "eng").await;
    let leads = named(&repo, realm_id, "leads").await;
    let (ceo, dev, lead) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

    repo.add_members(realm_id, company, &[ceo]).await.unwrap();
    repo.add_members(realm_id, eng, &[dev]).await.unwrap();
    repo.add_members(realm_id, leads, &[lead]).await.unwrap();
    repo.add_subgroups(realm_id, company, &[eng]).await.unwrap();
    repo.add_subgroups(realm_id, eng, &[leads]).await.unwrap();

    let subgroups: BTreeSet<Uuid> = repo
        .recursive_subgroup_ids(realm_id, company)
        .await
        .unwrap()
        .into_iter()
        .collect();
    assert_eq!(subgroups, BTreeSet::from([eng, leads]));
    assert_eq!(
        repo.direct_subgroup_ids(realm_id, company).await.unwrap(),
        vec![eng]
    );

    let members: BTreeSet<Uuid> = repo
        .recursive_member_ids(realm_id, company)
        .await
        .unwrap()
        .into_iter()
        .collect();
    assert_eq!(members, BTreeSet::from([ceo, dev, lead]));

    assert!(repo.is_member(realm_id, company, lead, false).await.unwrap());
    assert!(!repo.is_member(realm_id, company, lead, true).await.unwrap());
    assert!(repo.is_member(realm_id, leads, lead, true).await.unwrap());
    assert!(!repo.is_member(realm_id, leads, ceo, false).await.unwrap());
}

#[tokio::test]
async fn subgroup_cycle_rejected() {
    let (repo, realm_id) = setup().await;
    let a = named(&repo, realm_id, "a").await;
    let b = named(&repo, realm_id, "b").await;
    let c = named(&repo, realm_id, "c").await;

    repo.add_subgroups(realm_id, a, &[b]).await.unwrap();
    repo.add_subgroups(realm_id, b, &[c]).await.unwrap();

    let result = repo.add_subgroups(realm_id, c, &[a]).await;
    assert!(matches!(
        result,
        Err(CohortError::Cycle { supergroup_id }) if supergroup_id == c
    ));

    let result = repo.add_subgroups(realm_id, a, &[a]).await;
    assert!(matches!(result, Err(CohortError::Cycle { .. })));

    assert!(repo.direct_subgroup_ids(realm_id, c).await.unwrap().is_empty());
}

#[tokio::test]
async fn realm_isolation() {
    let (repo, realm_a) = setup().await;
    let realm_b = Uuid::new_v4();

    let group = named(&repo, realm_a, "Isolated").await;
    let other = named(&repo, realm_b, "Elsewhere").await;

    // Group should be findable under realm_a.
    assert!(repo.get_by_id(realm_a, group).await.is_ok());

    // Group should NOT be findable under realm_b.
    let not_found = repo.get_by_id(realm_b, group).await;
    assert!(
        matches!(not_found, Err(CohortError::NotFound { .. })),
        "group should not be visible in other realm"
    );

    // Edges cannot cross realms either.
    let result = repo.add_subgroups(realm_a, group, &[other]).await;
    assert!(matches!(result, Err(CohortError::NotFound { .. })));
}

#[tokio::test]
async fn failed_commit_rolls_back_every_change() {
    let (repo, realm_id) = setup().await;
    let existing = named(&repo, realm_id, "existing").await;
    let user = Uuid::new_v4();
    repo.add_members(realm_id, existing, &[user]).await.unwrap();

    let mut tx = repo.begin();
    let staged = tx.insert_group(CreateGroup::named(realm_id, "staged", ""));
    tx.add_subgroups(realm_id, existing, vec![staged.id]);
    tx.add_members(realm_id, existing, vec![user]);
    let result = tx.commit().await;
    assert!(matches!(result, Err(CohortError::Conflict { .. })));

    assert!(repo.get_by_id(realm_id, staged.id).await.is_err());
    assert!(
        repo.direct_subgroup_ids(realm_id, existing)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn dropped_transaction_discards_changes() {
    let (repo, realm_id) = setup().await;

    let staged = {
        let mut tx = repo.begin();
        tx.insert_group(CreateGroup::named(realm_id, "never", ""))
    };

    assert!(repo.get_by_id(realm_id, staged.id).await.is_err());
    assert_eq!(repo.list(realm_id, Pagination::default()).await.unwrap().total, 0);
}

#[tokio::test]
async fn lock_for_update_is_ordered_and_reentrant() {
    let (repo, realm_id) = setup().await;
    let a = named(&repo, realm_id, "a").await;
    let b = named(&repo, realm_id, "b").await;

    let mut tx = repo.begin();
    let locked = tx
        .lock_for_update(realm_id, &BTreeSet::from([a, b]))
        .await
        .unwrap();
    let ids: Vec<Uuid> = locked.iter().map(|g| g.id).collect();
    let mut sorted = ids.clone();
    sorted.sort();
    assert_eq!(ids, sorted);

    // Locking rows already held does not wait on ourselves.
    tx.lock_for_update(realm_id, &BTreeSet::from([a]))
        .await
        .unwrap();
    assert_eq!(tx.locked_ids(), sorted);
}

#[tokio::test]
async fn lock_wait_timeout_is_retryable_contention() {
    let repo = repo_with(StoreConfig {
        lock_wait_timeout_ms: 50,
    })
    .await;
    let realm_id = Uuid::new_v4();
    let group = named(&repo, realm_id, "busy").await;

    let mut holder = repo.begin();
    holder
        .lock_for_update(realm_id, &BTreeSet::from([group]))
        .await
        .unwrap();

    let mut waiter = repo.begin();
    let err = waiter
        .lock_for_update(realm_id, &BTreeSet::from([group]))
        .await
        .unwrap_err();
    assert!(matches!(err, CohortError::Contention { .. }));
    assert!(err.is_retryable());
    assert!(waiter.locked_ids().is_empty());

    drop(holder);
    let mut retry = repo.begin();
    retry
        .lock_for_update(realm_id, &BTreeSet::from([group]))
        .await
        .unwrap();
}

#[tokio::test]
async fn commit_releases_row_locks() {
    let repo = repo_with(StoreConfig {
        lock_wait_timeout_ms: 50,
    })
    .await;
    let realm_id = Uuid::new_v4();
    let group = named(&repo, realm_id, "team").await;

    let mut tx = repo.begin();
    tx.lock_for_update(realm_id, &BTreeSet::from([group]))
        .await
        .unwrap();
    tx.add_members(realm_id, group, vec![Uuid::new_v4()]);
    assert_eq!(tx.staged_changes(), 1);
    tx.commit().await.unwrap();

    let mut next = repo.begin();
    next.lock_for_update(realm_id, &BTreeSet::from([group]))
        .await
        .unwrap();
}

#[tokio::test]
async fn delete_detaches_from_supergroups() {
    let (repo, realm_id) = setup().await;
    let parent = named(&repo, realm_id, "parent").await;
    let child = named(&repo, realm_id, "child").await;
    let grandchild = named(&repo, realm_id, "grandchild").await;
    repo.add_subgroups(realm_id, parent, &[child]).await.unwrap();
    repo.add_subgroups(realm_id, child, &[grandchild]).await.unwrap();

    repo.delete(realm_id, child).await.unwrap();

    assert!(
        repo.direct_subgroup_ids(realm_id, parent)
            .await
            .unwrap()
            .is_empty()
    );
    // The grandchild itself survives.
    assert!(repo.get_by_id(realm_id, grandchild).await.is_ok());
}

#[tokio::test]
async fn referenced_group_cannot_be_deleted() {
    let (repo, realm_id) = setup().await;
    let target = named(&repo, realm_id, "mentioners").await;

    let mut input = CreateGroup::named(realm_id, "support", "");
    input.settings = BTreeMap::from([(GroupSetting::CanMentionGroup, target)]);
    let support = repo.create(input).await.unwrap();

    let referencing = repo.referencing_groups(realm_id, target).await.unwrap();
    assert_eq!(referencing.len(), 1);
    assert_eq!(referencing[0].0.id, support.id);
    assert_eq!(referencing[0].1, GroupSetting::CanMentionGroup);

    let result = repo.delete(realm_id, target).await;
    assert!(matches!(result, Err(CohortError::Validation { .. })));
    assert!(repo.get_by_id(realm_id, target).await.is_ok());

    // Settings must point at existing groups.
    let mut dangling = CreateGroup::named(realm_id, "dangling", "");
    dangling.settings = BTreeMap::from([(GroupSetting::CanManageGroup, Uuid::new_v4())]);
    let result = repo.create(dangling).await;
    assert!(matches!(result, Err(CohortError::NotFound { .. })));
}

#[tokio::test]
async fn row_lock_entries_are_pruned() {
    let repo = repo_with(StoreConfig {
        lock_wait_timeout_ms: 50,
    })
    .await;
    let realm_id = Uuid::new_v4();
    let a = named(&repo, realm_id, "a").await;
    let b = named(&repo, realm_id, "b").await;
    assert_eq!(repo.store().row_lock_entries(), 0);

    // Released by commit.
    let mut tx = repo.begin();
    tx.lock_for_update(realm_id, &BTreeSet::from([a, b]))
        .await
        .unwrap();
    assert_eq!(repo.store().row_lock_entries(), 2);
    tx.add_members(realm_id, a, vec![Uuid::new_v4()]);
    tx.commit().await.unwrap();
    assert_eq!(repo.store().row_lock_entries(), 0);

    // Released by drop.
    let mut tx = repo.begin();
    tx.lock_for_update(realm_id, &BTreeSet::from([a]))
        .await
        .unwrap();
    drop(tx);
    assert_eq!(repo.store().row_lock_entries(), 0);

    // The waiter's entry goes with the holder's once both are done.
    let mut holder = repo.begin();
    holder
        .lock_for_update(realm_id, &BTreeSet::from([b]))
        .await
        .unwrap();
    let mut waiter = repo.begin();
    let err = waiter
        .lock_for_update(realm_id, &BTreeSet::from([a, b]))
        .await
        .unwrap_err();
    assert!(matches!(err, CohortError::Contention { .. }));
    assert_eq!(repo.store().row_lock_entries(), 1);
    drop(holder);
    assert_eq!(repo.store().row_lock_entries(), 0);

    // Deleted groups leave nothing behind.
    repo.delete(realm_id, a).await.unwrap();
    assert_eq!(repo.store().row_lock_entries(), 0);
}
