pub mod coordination;
pub mod database;

pub use coordination::{
    CoordinationClient, CoordinationConnector, CoordinationService, CreateMode, LeaderLatch,
    LockGuard, MemoryConnector, MemorySession, MemoryTree, NodeEventKind, NodeMap, NodeWatch,
    SessionEvent, TreeCache, TreeEvent, WatchedEvent,
};
pub use database::SqliteTaskStore;
