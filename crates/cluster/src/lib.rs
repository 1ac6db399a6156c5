//! 集群协调
//!
//! 成员注册、主节点选举、路由表、分组同步和 HostGroup 状态发布，
//! 由 [`SharedSpace`] 组合在一个协调会话上。

pub mod counters;
pub mod heal;
pub mod host_group;
pub mod leader;
pub mod membership;
pub mod paths;
pub mod routing;
pub mod space;
pub mod sync;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use counters::TaskCounters;
pub use heal::HealLoop;
pub use host_group::HostGroupPublisher;
pub use leader::{LeaderElectionController, MasterState};
pub use membership::MembershipRegistry;
pub use paths::ClusterPaths;
pub use routing::RoutingTable;
pub use space::{Components, SharedSpace};
pub use sync::{GroupSyncEngine, GroupWatcher, LocalGroupFiles};
