//! NPC influence synchronization for a shared tabletop session.
//!
//! Every client keeps a replica of the influence cache. The authority (the GM)
//! recomputes influence from tag and status state, broadcasts changes, answers
//! snapshot requests and repairs the cache when [`SyncCoordinator::run_audit`]
//! is invoked. Players apply what they receive and ask for a snapshot when
//! told to refresh.

pub mod aggregator;
pub mod auditor;
pub mod cache;
pub mod calculator;
pub mod channel;
pub mod coordinator;
pub mod identity;
pub mod metrics;
pub mod network;
pub mod pacing;
pub mod sync_config;
pub mod world;

pub use aggregator::{InfluenceAggregator, SceneContribution};
pub use auditor::{AuditReport, ConsistencyAuditor, DriftEntry, DuplicateRepair};
pub use cache::{CacheChange, InfluenceCache};
pub use calculator::{Contribution, ContributionSource, InfluenceCalculator, InfluenceScore};
pub use channel::{generate_client_id, ChannelError, LocalBus, LocalEndpoint, ReplicationChannel};
pub use coordinator::{
    ClientRole, ItemChange, PumpReport, RefreshOutcome, ResyncMode, ResyncSummary, SyncCoordinator,
    SyncSummary,
};
pub use identity::{IdentityResolver, KeyShape};
pub use metrics::SyncMetrics;
pub use network::{
    start_relay_server, start_relay_server_with_timeout, RelayServer, TcpChannel,
    DEFAULT_RELAY_WRITE_TIMEOUT,
};
pub use pacing::BroadcastPacer;
pub use sync_config::{
    load_sync_config, load_sync_config_from_env, SyncConfig, SyncConfigError, SyncConfigHandle,
    BUILTIN_SYNC_CONFIG, SYNC_CONFIG_PATH_ENV,
};
pub use world::{
    CharacterSheet, InMemoryWorld, SceneToken, SheetKind, StatusItem, TagItem, TagState, TokenRef,
    WorldView,
};

pub use influence_proto::{
    ClientId, IdentityKey, InfluenceRecord, SyncEnvelope, SyncMessage, WireError,
};
