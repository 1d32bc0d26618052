//! Shared fixture for group service tests.

#![allow(dead_code)]

use std::sync::{Arc, Once};

use cohort_core::models::group::Group;
use cohort_core::models::user::{CreateUser, User};
use cohort_core::repository::GroupRepository;
use cohort_db::repository::{SurrealGroupRepository, SurrealUserRepository};
use cohort_db::{GraphStore, StoreConfig, run_migrations};
use cohort_service::{
    ChannelNotifier, CreateGroupRequest, GroupService, MembershipNotification, ServiceConfig,
};
use surrealdb::Surreal;
use surrealdb::engine::local::{Db, Mem};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

pub type Groups = SurrealGroupRepository<Db>;
pub type Users = SurrealUserRepository<Db>;
pub type Service = GroupService<Groups, Users, ChannelNotifier>;

pub struct Fixture {
    pub service: Arc<Service>,
    pub groups: Groups,
    pub users: Users,
    pub notifications: mpsc::UnboundedReceiver<MembershipNotification>,
    pub realm_id: Uuid,
    /// Acting user for most calls.
    pub admin: User,
    pub system_groups: Vec<Group>,
}

static TRACING: Once = Once::new();

/// Structured logs for failing tests: `RUST_LOG=cohort_service=debug,cohort_db=debug`.
fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .json()
            .try_init();
    });
}

/// Helper: in-memory SurrealDB, repositories, a bootstrapped realm and an
/// acting admin.
pub async fn setup() -> Fixture {
    setup_with(StoreConfig::default(), ServiceConfig::default()).await
}

pub async fn setup_with(store_config: StoreConfig, config: ServiceConfig) -> Fixture {
    init_tracing();

    let db = Surreal::new::<Mem>(()).await.unwrap();
    db.use_ns("test").use_db("test").await.unwrap();
    run_migrations(&db).await.unwrap();

    let groups = SurrealGroupRepository::new(GraphStore::new(db.clone(), store_config));
    let users = SurrealUserRepository::new(db);
    let (notifier, notifications) = ChannelNotifier::new();
    let service = GroupService::new(groups.clone(), users.clone(), notifier, config);

    let realm_id = Uuid::new_v4();
    let system_groups = service.create_system_groups(realm_id).await.unwrap();
    let admin = users
        .create(CreateUser {
            realm_id,
            full_name: "Iago".into(),
            is_bot: false,
        })
        .await
        .unwrap();

    Fixture {
        service: Arc::new(service),
        groups,
        users,
        notifications,
        realm_id,
        admin,
        system_groups,
    }
}

impl Fixture {
    pub async fn user(&self, name: &str) -> User {
        self.users
            .create(CreateUser {
                realm_id: self.realm_id,
                full_name: name.into(),
                is_bot: false,
            })
            .await
            .unwrap()
    }

    pub async fn bot(&self, name: &str) -> User {
        self.users
            .create(CreateUser {
                realm_id: self.realm_id,
                full_name: name.into(),
                is_bot: true,
            })
            .await
            .unwrap()
    }

    /// Create a named group through the service with default settings.
    pub async fn group(&self, name: &str, members: &[Uuid]) -> Group {
        self.service
            .create_group(
                &self.admin,
                CreateGroupRequest {
                    name: name.into(),
                    description: format!("{name} group"),
                    members: members.to_vec(),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
    }

    pub async fn system_group(&self, name: &str) -> Group {
        self.groups.get_by_name(self.realm_id, name).await.unwrap()
    }

    pub fn drain_notifications(&mut self) -> Vec<MembershipNotification> {
        let mut drained = Vec::new();
        while let Ok(notification) = self.notifications.try_recv() {
            drained.push(notification);
        }
        drained
    }
}
