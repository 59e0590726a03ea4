pub mod cache;
pub mod checksum;
pub mod comparator;
pub mod conflict;
pub mod engine;
pub mod events;
pub mod filter;
pub mod governor;
pub mod planner;
pub mod throttle;
pub mod version;

pub use cache::{ChecksumCache, ClusterLock, LocalClusterLock};
pub use checksum::{content_checksum, directory_checksum, ChecksumService, EntityRef};
pub use comparator::{Change, ClassifiedDiff, DiffContext, VersionDiffer};
pub use conflict::{Conflict, ConflictKind, ConflictResolver, Resolution};
pub use engine::DriveSyncEngine;
pub use events::{ChangeNotifier, StorageEvent};
pub use filter::PatternFilter;
pub use governor::{SessionState, SessionTicket, SyncSessionGovernor};
pub use planner::{ActionPlanner, PermissionMap, PlanContext};
pub use throttle::{BandwidthLimiter, SessionThrottle, TokenBucket};
pub use version::{ClientVersion, ClientVersionGate, GateDecision, VersionThresholds};
