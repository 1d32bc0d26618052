//! Recursive subgraph locking for structural group mutations.
//!
//! Adding or removing subgroups, and deleting a group, must see a stable
//! view of everything reachable from the groups involved. The coordinator
//! locks the supergroup together with the inclusive subgroup closure of the
//! candidates, always in ascending id order, so two mutations over
//! overlapping regions queue behind each other instead of deadlocking.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use cohort_core::error::{CohortError, CohortResult};
use cohort_core::models::group::Group;
use cohort_core::repository::{GroupRepository, GroupTransaction};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::access::access_group;

/// Subgroup edges of every group in a closure, keyed by supergroup.
type Edges = BTreeMap<Uuid, BTreeSet<Uuid>>;

pub struct RecursiveLockCoordinator<'a, G: GroupRepository> {
    groups: &'a G,
    max_rounds: usize,
}

impl<'a, G: GroupRepository> RecursiveLockCoordinator<'a, G> {
    pub fn new(groups: &'a G, max_rounds: usize) -> Self {
        Self {
            groups,
            max_rounds: max_rounds.max(1),
        }
    }

    /// Lock `supergroup_id` and the closure of `candidate_ids` in a new
    /// transaction.
    ///
    /// The closure is read, locked, then read again under the locks. If
    /// groups became reachable in between, the transaction is dropped with
    /// all its locks and the enlarged region is locked from scratch in
    /// ascending order, up to the configured number of rounds. Locks are
    /// never taken on a lower id while a higher one is held.
    pub async fn lock_subgraph(
        &self,
        realm_id: Uuid,
        candidate_ids: &[Uuid],
        supergroup_id: Uuid,
    ) -> CohortResult<LockedSubgraph<G::Transaction>> {
        access_group(self.groups, realm_id, supergroup_id).await?;
        let candidates: BTreeSet<Uuid> = candidate_ids.iter().copied().collect();
        for id in &candidates {
            access_group(self.groups, realm_id, *id).await?;
        }

        let mut region = BTreeSet::from([supergroup_id]);
        for round in 1..=self.max_rounds {
            let (closure, _) = self.read_closure(realm_id, &candidates).await?;
            region.extend(closure);

            let mut tx = self.groups.begin();
            let locked = match tx.lock_for_update(realm_id, &region).await {
                Ok(locked) => locked,
                // A group in the region was deleted before we got to it.
                Err(CohortError::NotFound { .. }) => {
                    drop(tx);
                    access_group(self.groups, realm_id, supergroup_id).await?;
                    region.retain(|id| *id == supergroup_id || candidates.contains(id));
                    continue;
                }
                Err(err) => return Err(err),
            };

            let (closure, edges) = self.read_closure(realm_id, &candidates).await?;
            if !closure.is_subset(&region) {
                drop(tx);
                debug!(
                    supergroup_id = %supergroup_id,
                    round,
                    locked = region.len(),
                    reachable = closure.len(),
                    "Subgroup closure grew while locking, relocking from scratch"
                );
                continue;
            }

            let supergroup_subgroups = self
                .groups
                .direct_subgroup_ids(realm_id, supergroup_id)
                .await?
                .into_iter()
                .collect();

            debug!(
                realm_id = %realm_id,
                supergroup_id = %supergroup_id,
                candidates = candidates.len(),
                locked = region.len(),
                round,
                "Subgraph locked"
            );
            return LockedSubgraph::new(
                tx,
                locked,
                supergroup_id,
                &candidates,
                &closure,
                edges,
                supergroup_subgroups,
            );
        }

        warn!(
            supergroup_id = %supergroup_id,
            rounds = self.max_rounds,
            "Subgroup closure did not settle while locking"
        );
        Err(CohortError::Contention {
            resource: format!("subgraph:{supergroup_id}"),
        })
    }

    /// Breadth-first walk over subgroup edges. The result includes the
    /// roots. Groups deleted mid-walk are skipped.
    async fn read_closure(
        &self,
        realm_id: Uuid,
        roots: &BTreeSet<Uuid>,
    ) -> CohortResult<(BTreeSet<Uuid>, Edges)> {
        let mut seen = BTreeSet::new();
        let mut edges = Edges::new();
        let mut queue: VecDeque<Uuid> = roots.iter().copied().collect();

        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            let children = match self.groups.direct_subgroup_ids(realm_id, id).await {
                Ok(children) => children,
                Err(CohortError::NotFound { .. }) if !roots.contains(&id) => {
                    seen.remove(&id);
                    continue;
                }
                Err(err) => return Err(err),
            };
            let children: BTreeSet<Uuid> = children.into_iter().collect();
            queue.extend(children.iter().filter(|child| !seen.contains(*child)));
            edges.insert(id, children);
        }

        Ok((seen, edges))
    }
}

/// A locked region of the group graph together with the transaction that
/// holds the locks.
///
/// Dropping it rolls back the staged changes and releases every lock;
/// [`LockedSubgraph::commit`] applies them first.
pub struct LockedSubgraph<T: GroupTransaction> {
    pub supergroup: Group,
    /// The candidate groups, ascending by id.
    pub direct_subgroups: Vec<Group>,
    /// Inclusive closure of the candidates, ascending by id.
    pub recursive_subgroups: Vec<Group>,
    supergroup_subgroups: BTreeSet<Uuid>,
    edges: Edges,
    tx: T,
}

impl<T: GroupTransaction> LockedSubgraph<T> {
    fn new(
        tx: T,
        locked: Vec<Group>,
        supergroup_id: Uuid,
        candidates: &BTreeSet<Uuid>,
        closure: &BTreeSet<Uuid>,
        edges: Edges,
        supergroup_subgroups: BTreeSet<Uuid>,
    ) -> CohortResult<Self> {
        let mut by_id: BTreeMap<Uuid, Group> =
            locked.into_iter().map(|group| (group.id, group)).collect();
        let pick = |by_id: &BTreeMap<Uuid, Group>, id: &Uuid| {
            by_id
                .get(id)
                .cloned()
                .ok_or_else(|| CohortError::Internal(format!("group {id} locked but not loaded")))
        };

        let direct_subgroups = candidates
            .iter()
            .map(|id| pick(&by_id, id))
            .collect::<CohortResult<Vec<_>>>()?;
        let recursive_subgroups = closure
            .iter()
            .map(|id| pick(&by_id, id))
            .collect::<CohortResult<Vec<_>>>()?;
        let supergroup = by_id.remove(&supergroup_id).ok_or_else(|| {
            CohortError::Internal(format!("supergroup {supergroup_id} locked but not loaded"))
        })?;

        Ok(Self {
            supergroup,
            direct_subgroups,
            recursive_subgroups,
            supergroup_subgroups,
            edges,
            tx,
        })
    }

    pub fn transaction(&mut self) -> &mut T {
        &mut self.tx
    }

    /// Direct subgroups of the supergroup as seen under the lock.
    pub fn supergroup_subgroup_ids(&self) -> &BTreeSet<Uuid> {
        &self.supergroup_subgroups
    }

    /// Inclusive closure of `ids` over the locked edges. Ids outside the
    /// locked region are returned as-is without expansion.
    pub fn closure_of(&self, ids: impl IntoIterator<Item = Uuid>) -> BTreeSet<Uuid> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<Uuid> = ids.into_iter().collect();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            if let Some(children) = self.edges.get(&id) {
                stack.extend(children.iter().copied());
            }
        }
        seen
    }

    /// Whether making `ids` subgroups of the supergroup would close a loop.
    pub fn would_create_cycle(&self, ids: &[Uuid]) -> bool {
        self.closure_of(ids.iter().copied()).contains(&self.supergroup.id)
    }

    pub async fn commit(self) -> CohortResult<()> {
        self.tx.commit().await
    }
}
