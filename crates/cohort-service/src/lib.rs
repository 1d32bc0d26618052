//! Cohort Service: user-group mutations on top of the group graph. Covers
//! permission-setting resolution, recursive subgraph locking, membership
//! and subgroup changes.

mod access;

pub mod config;
pub mod error;
pub mod lock;
pub mod notify;
pub mod resolver;
pub mod service;

pub use config::ServiceConfig;
pub use error::RuleViolation;
pub use lock::{LockedSubgraph, RecursiveLockCoordinator};
pub use notify::{ChannelNotifier, MembershipChange, MembershipNotification, Notifier};
pub use resolver::SettingValueResolver;
pub use service::{CreateGroupRequest, GroupService, UpdateGroupRequest};
