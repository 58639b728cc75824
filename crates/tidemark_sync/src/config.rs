//! Collection configuration.

use crate::error::ErrorSink;
use std::sync::Arc;
use tidemark_core::crypto::{AadScheme, CryptoProvider};
use tidemark_crdt::replicator::{ApplyChangeFn, MaterializeFn};
use tidemark_crdt::{ActorResolver, CrdtEngine, Profile};
use tidemark_remote::{RemoteDatabase, TableTarget};

/// How the engine brings the collection up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Full hydration before ready; live after; emits diffs.
    #[default]
    Eager,
    /// Ready immediately; the host drives subset loads; live delivery is
    /// gated by the active-id set.
    OnDemand,
    /// Ready immediately; background pages hydrate and emit.
    Progressive,
}

/// End-to-end encryption options.
#[derive(Clone)]
pub struct E2eeOptions {
    /// The AEAD capability.
    pub provider: Arc<dyn CryptoProvider>,
    /// Associated-data derivation override.
    pub aad: Option<AadScheme>,
}

impl E2eeOptions {
    /// Encrypts with the default AAD derivation.
    pub fn new(provider: Arc<dyn CryptoProvider>) -> Self {
        Self {
            provider,
            aad: None,
        }
    }

    /// Builder: overrides the AAD derivation.
    #[must_use]
    pub fn with_aad(mut self, aad: AadScheme) -> Self {
        self.aad = Some(aad);
        self
    }
}

impl std::fmt::Debug for E2eeOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("E2eeOptions")
            .field("aad", &self.aad)
            .finish()
    }
}

/// CRDT replication options.
#[derive(Clone)]
pub struct CrdtOptions {
    /// The document engine.
    pub engine: Arc<dyn CrdtEngine>,
    /// Materialization profile.
    pub profile: Profile,
    /// Overrides the profile's projection.
    pub materialize: Option<MaterializeFn>,
    /// Overrides the profile's change folding.
    pub apply_local_change: Option<ApplyChangeFn>,
    /// Update-log table.
    pub updates_table: String,
    /// Optional snapshot table.
    pub snapshots_table: Option<String>,
    /// Mirror every materialization into the base table.
    pub persist_materialized_view: bool,
    /// Local actor identity for loop prevention.
    pub actor: ActorResolver,
}

impl CrdtOptions {
    /// Json-profile replication over one update-log table.
    pub fn new(
        engine: Arc<dyn CrdtEngine>,
        updates_table: impl Into<String>,
        actor: impl Into<ActorResolver>,
    ) -> Self {
        Self {
            engine,
            profile: Profile::Json,
            materialize: None,
            apply_local_change: None,
            updates_table: updates_table.into(),
            snapshots_table: None,
            persist_materialized_view: false,
            actor: actor.into(),
        }
    }

    /// Builder: sets the profile.
    #[must_use]
    pub fn with_profile(mut self, profile: Profile) -> Self {
        self.profile = profile;
        self
    }

    /// Builder: overrides the profile's projection.
    #[must_use]
    pub fn with_materialize(mut self, materialize: MaterializeFn) -> Self {
        self.materialize = Some(materialize);
        self
    }

    /// Builder: overrides the profile's change folding.
    #[must_use]
    pub fn with_apply_local_change(mut self, apply: ApplyChangeFn) -> Self {
        self.apply_local_change = Some(apply);
        self
    }

    /// Builder: sets the snapshot table.
    #[must_use]
    pub fn with_snapshots_table(mut self, table: impl Into<String>) -> Self {
        self.snapshots_table = Some(table.into());
        self
    }

    /// Builder: mirrors materialized views into the base table.
    #[must_use]
    pub fn with_persist_materialized_view(mut self, enabled: bool) -> Self {
        self.persist_materialized_view = enabled;
        self
    }
}

impl std::fmt::Debug for CrdtOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrdtOptions")
            .field("profile", &self.profile)
            .field("updates_table", &self.updates_table)
            .field("snapshots_table", &self.snapshots_table)
            .field(
                "persist_materialized_view",
                &self.persist_materialized_view,
            )
            .field("actor", &self.actor)
            .finish()
    }
}

/// Everything needed to stand up one synced collection.
pub struct CollectionOptions<R: RemoteDatabase> {
    /// The remote database handle.
    pub remote: Arc<R>,
    /// The table this collection mirrors.
    pub table: TableTarget,
    /// Opaque cache-key scope the host runtime files the collection under.
    pub query_key: Vec<String>,
    /// Hydration strategy.
    pub sync_mode: SyncMode,
    /// End-to-end encryption of base rows and log payloads.
    pub e2ee: Option<E2eeOptions>,
    /// CRDT replication.
    pub crdt: Option<CrdtOptions>,
    /// Sync-field semantics (tombstones, `updated_at` stamping). Defaults
    /// to on whenever CRDT replication is configured.
    pub sync_fields: Option<bool>,
    /// Error sink; errors never crash the host.
    pub on_error: Option<ErrorSink>,
    /// Page size for progressive hydration.
    pub page_size: u64,
}

impl<R: RemoteDatabase> CollectionOptions<R> {
    /// Options with eager sync and no encryption or replication.
    pub fn new(remote: Arc<R>, table: TableTarget) -> Self {
        Self {
            remote,
            table,
            query_key: Vec::new(),
            sync_mode: SyncMode::Eager,
            e2ee: None,
            crdt: None,
            sync_fields: None,
            on_error: None,
            page_size: 500,
        }
    }

    /// Builder: sets the host cache-key scope.
    #[must_use]
    pub fn with_query_key(mut self, key: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.query_key = key.into_iter().map(Into::into).collect();
        self
    }

    /// Builder: sets the sync mode.
    #[must_use]
    pub fn with_sync_mode(mut self, mode: SyncMode) -> Self {
        self.sync_mode = mode;
        self
    }

    /// Builder: enables end-to-end encryption.
    #[must_use]
    pub fn with_e2ee(mut self, e2ee: E2eeOptions) -> Self {
        self.e2ee = Some(e2ee);
        self
    }

    /// Builder: enables CRDT replication.
    #[must_use]
    pub fn with_crdt(mut self, crdt: CrdtOptions) -> Self {
        self.crdt = Some(crdt);
        self
    }

    /// Builder: forces sync-field semantics on or off.
    #[must_use]
    pub fn with_sync_fields(mut self, enabled: bool) -> Self {
        self.sync_fields = Some(enabled);
        self
    }

    /// Builder: sets the error sink.
    #[must_use]
    pub fn with_on_error(mut self, sink: ErrorSink) -> Self {
        self.on_error = Some(sink);
        self
    }

    /// Builder: sets the progressive page size.
    #[must_use]
    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.page_size = page_size;
        self
    }

    /// Whether sync-field semantics are active.
    #[must_use]
    pub fn sync_fields_active(&self) -> bool {
        self.sync_fields.unwrap_or(self.crdt.is_some())
    }
}

impl<R: RemoteDatabase> std::fmt::Debug for CollectionOptions<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionOptions")
            .field("table", &self.table)
            .field("query_key", &self.query_key)
            .field("sync_mode", &self.sync_mode)
            .field("e2ee", &self.e2ee)
            .field("crdt", &self.crdt)
            .field("sync_fields", &self.sync_fields)
            .field("page_size", &self.page_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidemark_crdt::LwwEngine;
    use tidemark_remote::MemoryRemote;

    #[test]
    fn sync_fields_follow_crdt_by_default() {
        let remote = Arc::new(MemoryRemote::new());
        let plain = CollectionOptions::new(Arc::clone(&remote), TableTarget::new("task"));
        assert!(!plain.sync_fields_active());

        let with_crdt = CollectionOptions::new(Arc::clone(&remote), TableTarget::new("doc"))
            .with_crdt(CrdtOptions::new(Arc::new(LwwEngine), "crdt_update", "dev"));
        assert!(with_crdt.sync_fields_active());

        let forced_off = CollectionOptions::new(remote, TableTarget::new("doc"))
            .with_sync_fields(false);
        assert!(!forced_off.sync_fields_active());
    }
}
