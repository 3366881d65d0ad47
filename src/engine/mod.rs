//! Indexing engine
//!
//! Orchestrates CRUD against the backing store, applies per-type
//! transform/filter/weight hooks, diffs nested aggregate membership, and
//! drives measure recomputation through the lock provider and the
//! write-back aggregator cache.
//!
//! Two lock domains coexist and never nest reentrantly: primary-document
//! keys (`"{type}:{id}"`) and aggregate-entity keys
//! (`"{aggregateType}:{id}"`). A primary mutation holds its document lock
//! while entering aggregate critical sections one member at a time; locks
//! are only ever passed down explicitly, through the request's handle.

mod aggregates;
mod flusher;

pub use flusher::spawn_flush_scheduler;

use crate::cache::{AggregatorCache, CacheEntry, Displaced};
use crate::core::config::{BackendMode, Config};
use crate::core::error::{Error, Result, ValidationError};
use crate::core::types::{
    round_to, set_num_field, Document, FailCode, IndexResult, OpType, Operation,
};
use crate::lock::{LockHandle, LockProvider};
use crate::schema::{
    AggregateConfig, FilterFn, IndexConfig, IndicesConfig, Measure, TypeConfig, TypeMode,
};
use crate::store::{DocumentStore, HttpStore, MemStore};
use crate::system::metrics::Metrics;
use aggregates::{
    accumulate_measure, classify_members, extract_members, recompute_measure, AggregateMember,
};
use serde_json::json;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// A document type referenced by registry name or by direct configuration.
#[derive(Clone)]
pub enum TypeRef {
    /// Name to resolve against the registry
    Name(String),
    /// Direct configuration, skipping registry lookup
    Config(Arc<TypeConfig>),
}

impl From<&str> for TypeRef {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for TypeRef {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

impl From<Arc<TypeConfig>> for TypeRef {
    fn from(config: Arc<TypeConfig>) -> Self {
        Self::Config(config)
    }
}

impl From<&Arc<TypeConfig>> for TypeRef {
    fn from(config: &Arc<TypeConfig>) -> Self {
        Self::Config(Arc::clone(config))
    }
}

/// The caller's knowledge of the document currently in the store.
///
/// `Unknown` makes the engine fetch under the lock; `Missing` asserts
/// absence; `Doc` supplies the baseline directly, skipping the fetch.
#[derive(Debug, Clone)]
pub enum Baseline {
    /// Not known; fetch from the store
    Unknown,
    /// Known to be absent
    Missing,
    /// Known current document
    Doc(Document),
}

/// A write request: add, update, or partial update.
pub struct IndexRequest {
    doc_type: TypeRef,
    id: Option<String>,
    doc: Document,
    existing: Baseline,
    filter: Option<FilterFn>,
    lock_handle: Option<LockHandle>,
    partial: bool,
}

impl IndexRequest {
    /// A request for `doc` against a type.
    pub fn new(doc_type: impl Into<TypeRef>, doc: Document) -> Self {
        Self {
            doc_type: doc_type.into(),
            id: None,
            doc,
            existing: Baseline::Unknown,
            filter: None,
            lock_handle: None,
            partial: false,
        }
    }

    /// Supply the id explicitly instead of deriving it from the document.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Supply what the caller knows about the stored document.
    pub fn existing(mut self, baseline: Baseline) -> Self {
        self.existing = baseline;
        self
    }

    /// Attach a caller-level inclusion predicate.
    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Document, Option<&Document>, bool) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Run inside an already-held lock instead of acquiring a new one. The
    /// handle must be for this document's own key.
    pub fn lock_handle(mut self, handle: LockHandle) -> Self {
        self.lock_handle = Some(handle);
        self
    }
}

/// A removal request.
pub struct RemoveRequest {
    doc_type: TypeRef,
    id: String,
    doc: Option<Document>,
    lock_handle: Option<LockHandle>,
    partial: bool,
}

impl RemoveRequest {
    /// A removal of `id` from a type.
    pub fn new(doc_type: impl Into<TypeRef>, id: impl Into<String>) -> Self {
        Self {
            doc_type: doc_type.into(),
            id: id.into(),
            doc: None,
            lock_handle: None,
            partial: false,
        }
    }

    /// Supply the stored document, skipping the fetch under the lock.
    pub fn doc(mut self, doc: Document) -> Self {
        self.doc = Some(doc);
        self
    }

    /// Run inside an already-held lock instead of acquiring a new one.
    pub fn lock_handle(mut self, handle: LockHandle) -> Self {
        self.lock_handle = Some(handle);
        self
    }
}

/// The indexing and aggregation engine.
pub struct IndexerEngine {
    indices: Arc<IndicesConfig>,
    store: Arc<dyn DocumentStore>,
    locks: LockProvider,
    cache: AggregatorCache,
}

impl IndexerEngine {
    /// Build an engine from configuration, selecting store, lock, and cache
    /// backends by their configured modes.
    pub fn new(config: &Config, indices: Arc<IndicesConfig>) -> Result<Self> {
        let store: Arc<dyn DocumentStore> = match config.store.mode {
            BackendMode::Memory => Arc::new(MemStore::new()),
            BackendMode::Http => Arc::new(HttpStore::new(&config.store)?),
        };

        Ok(Self {
            indices,
            store,
            locks: LockProvider::new(&config.locks)?,
            cache: AggregatorCache::new(&config.cache)?,
        })
    }

    /// An engine over a given store with in-process locks and cache.
    pub fn with_store(indices: Arc<IndicesConfig>, store: Arc<dyn DocumentStore>) -> Self {
        Self {
            indices,
            store,
            locks: LockProvider::in_process(),
            cache: AggregatorCache::in_process(4096),
        }
    }

    fn resolve(&self, type_ref: &TypeRef) -> Result<Arc<TypeConfig>> {
        match type_ref {
            TypeRef::Name(name) => {
                if name.is_empty() {
                    return Err(ValidationError::UndefinedType.into());
                }

                self.indices
                    .type_config(name)
                    .cloned()
                    .ok_or_else(|| ValidationError::UnrecognizedType { name: name.clone() }.into())
            }
            TypeRef::Config(config) => Ok(Arc::clone(config)),
        }
    }

    fn apply_weight(config: &TypeConfig, doc: &mut Document) {
        if let Some(raw) = config.weight_of(doc) {
            set_num_field(doc, "weight", round_to(raw.ln_1p(), 3));
        }
    }

    async fn resolve_baseline(
        &self,
        config: &TypeConfig,
        id: &str,
        baseline: Baseline,
    ) -> Result<Option<Document>> {
        match baseline {
            Baseline::Unknown => self.store.get(&config.index, &config.name, id).await,
            Baseline::Missing => Ok(None),
            Baseline::Doc(doc) => Ok(Some(doc)),
        }
    }

    /// Create a document. An existing document at the same id resolves as an
    /// `EXISTS_ALREADY` soft failure; a filter rejection as `SKIP`.
    pub async fn add(&self, request: IndexRequest) -> Result<IndexResult> {
        let started = Instant::now();
        let IndexRequest {
            doc_type,
            id,
            mut doc,
            existing,
            filter,
            lock_handle,
            partial: _,
        } = request;

        let config = self.resolve(&doc_type)?;
        config.apply_transform(&mut doc);

        let id = match id {
            Some(id) if !id.is_empty() => id,
            _ => config.id_of(&doc).ok_or(ValidationError::UndefinedId)?,
        };

        let caller_rejects = filter.as_ref().is_some_and(|f| !f(&doc, None, false));
        if caller_rejects || !config.accepts(&doc, None, false) {
            Metrics::global().operations_skipped.inc();
            return Ok(IndexResult::soft_fail(
                id,
                config.name.clone(),
                config.index.clone(),
                FailCode::Skip,
                Operation::Add,
            ));
        }

        Self::apply_weight(&config, &mut doc);

        let key = format!("{}:{}", config.name, id);
        let engine = self;
        let config_ref = &config;
        let id_ref = id.as_str();
        let doc_ref = &doc;

        let (result, displaced) = self
            .locks
            .using_lock(&key, lock_handle, move |_handle| async move {
                let stored = engine.resolve_baseline(config_ref, id_ref, existing).await?;
                if stored.is_some() {
                    Metrics::global().operations_skipped.inc();
                    return Ok((
                        IndexResult::soft_fail(
                            id_ref,
                            config_ref.name.clone(),
                            config_ref.index.clone(),
                            FailCode::ExistsAlready,
                            Operation::Add,
                        ),
                        Vec::new(),
                    ));
                }

                let write = engine
                    .store
                    .put(&config_ref.index, &config_ref.name, id_ref, doc_ref)
                    .await?;
                let displaced = engine
                    .build_aggregates(config_ref, Some(doc_ref), None, false)
                    .await?;

                Metrics::global().documents_added.inc();
                Ok((
                    IndexResult::success(
                        id_ref,
                        config_ref.name.clone(),
                        config_ref.index.clone(),
                        write.status_code,
                        write.version,
                        Operation::Add,
                    ),
                    displaced,
                ))
            })
            .await?;

        self.flush_displaced(displaced).await;

        if result.is_success() {
            info!(
                doc_type = %config.name,
                id = %result.id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "added document"
            );
        }
        Metrics::global()
            .operation_duration
            .observe(started.elapsed().as_secs_f64());

        Ok(result)
    }

    /// Delete a document and retract its aggregate memberships. A missing
    /// target resolves as a `NOT_FOUND` soft failure.
    pub async fn remove(&self, request: RemoveRequest) -> Result<IndexResult> {
        let started = Instant::now();
        let RemoveRequest {
            doc_type,
            id,
            doc,
            lock_handle,
            partial,
        } = request;

        let config = self.resolve(&doc_type)?;
        if id.is_empty() {
            return Err(ValidationError::UndefinedId.into());
        }

        let key = format!("{}:{}", config.name, id);
        let engine = self;
        let config_ref = &config;
        let id_ref = id.as_str();

        let (result, displaced) = self
            .locks
            .using_lock(&key, lock_handle, move |_handle| async move {
                let existing = match doc {
                    Some(doc) => Some(doc),
                    None => {
                        engine
                            .store
                            .get(&config_ref.index, &config_ref.name, id_ref)
                            .await?
                    }
                };

                let Some(existing) = existing else {
                    Metrics::global().operations_skipped.inc();
                    return Ok((
                        IndexResult::soft_fail(
                            id_ref,
                            config_ref.name.clone(),
                            config_ref.index.clone(),
                            FailCode::NotFound,
                            Operation::Remove,
                        ),
                        Vec::new(),
                    ));
                };

                let write = engine
                    .store
                    .delete(&config_ref.index, &config_ref.name, id_ref)
                    .await?;
                let displaced = engine
                    .build_aggregates(config_ref, None, Some(&existing), partial)
                    .await?;

                Metrics::global().documents_removed.inc();
                Ok((
                    IndexResult::success(
                        id_ref,
                        config_ref.name.clone(),
                        config_ref.index.clone(),
                        write.status_code,
                        write.version,
                        Operation::Remove,
                    ),
                    displaced,
                ))
            })
            .await?;

        self.flush_displaced(displaced).await;

        if result.is_success() {
            info!(
                doc_type = %config.name,
                id = %result.id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "removed document"
            );
        }
        Metrics::global()
            .operation_duration
            .observe(started.elapsed().as_secs_f64());

        Ok(result)
    }

    /// Merge changes into an existing document. A type-filter rejection of
    /// the merged state cascades into removal; a caller-filter rejection
    /// alone resolves as `SKIP` without touching the store.
    pub async fn update(&self, request: IndexRequest) -> Result<IndexResult> {
        let started = Instant::now();
        let IndexRequest {
            doc_type,
            id,
            doc: mut new_doc,
            existing,
            filter,
            lock_handle,
            partial,
        } = request;

        let operation = if partial {
            Operation::PartialUpdate
        } else {
            Operation::Update
        };

        let config = self.resolve(&doc_type)?;
        config.apply_transform(&mut new_doc);
        Self::apply_weight(&config, &mut new_doc);

        let id = match id {
            Some(id) if !id.is_empty() => id,
            _ => config.id_of(&new_doc).ok_or(ValidationError::UndefinedId)?,
        };

        let key = format!("{}:{}", config.name, id);
        let engine = self;
        let config_ref = &config;
        let id_ref = id.as_str();
        let new_doc_ref = &new_doc;

        let (result, displaced) = self
            .locks
            .using_lock(&key, lock_handle, move |handle| async move {
                let Some(existing_doc) = engine
                    .resolve_baseline(config_ref, id_ref, existing)
                    .await?
                else {
                    Metrics::global().operations_skipped.inc();
                    return Ok((
                        IndexResult::soft_fail(
                            id_ref,
                            config_ref.name.clone(),
                            config_ref.index.clone(),
                            FailCode::NotFound,
                            operation,
                        ),
                        Vec::new(),
                    ));
                };

                // Falling out of the type filter means the document no
                // longer belongs in the index at all.
                if !config_ref.accepts(new_doc_ref, Some(&existing_doc), partial) {
                    let result = engine
                        .remove(
                            RemoveRequest {
                                doc_type: TypeRef::Config(Arc::clone(config_ref)),
                                id: id_ref.to_string(),
                                doc: Some(existing_doc),
                                lock_handle: Some(handle),
                                partial,
                            },
                        )
                        .await?;
                    return Ok((result, Vec::new()));
                }

                if filter
                    .as_ref()
                    .is_some_and(|f| !f(new_doc_ref, Some(&existing_doc), partial))
                {
                    Metrics::global().operations_skipped.inc();
                    return Ok((
                        IndexResult::soft_fail(
                            id_ref,
                            config_ref.name.clone(),
                            config_ref.index.clone(),
                            FailCode::Skip,
                            operation,
                        ),
                        Vec::new(),
                    ));
                }

                let write = engine
                    .store
                    .partial_update(&config_ref.index, &config_ref.name, id_ref, new_doc_ref)
                    .await?;
                let displaced = engine
                    .build_aggregates(config_ref, Some(new_doc_ref), Some(&existing_doc), partial)
                    .await?;

                Metrics::global().documents_updated.inc();
                Ok((
                    IndexResult::success(
                        id_ref,
                        config_ref.name.clone(),
                        config_ref.index.clone(),
                        write.status_code,
                        write.version,
                        operation,
                    ),
                    displaced,
                ))
            })
            .await?;

        self.flush_displaced(displaced).await;

        if result.is_success() {
            info!(
                doc_type = %config.name,
                id = %result.id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "updated document"
            );
        }
        Metrics::global()
            .operation_duration
            .observe(started.elapsed().as_secs_f64());

        Ok(result)
    }

    /// `update` with partial semantics: absent fields say nothing about the
    /// document's state, so absent aggregate members are retained.
    pub async fn partial_update(&self, request: IndexRequest) -> Result<IndexResult> {
        self.update(IndexRequest {
            partial: true,
            ..request
        })
        .await
    }

    /// Create-or-update dispatch. Aggregate-mode types never touch the store
    /// here: the mutation accumulates in the write-back cache and the flush
    /// scheduler persists it later.
    pub async fn upsert(
        &self,
        doc_type: impl Into<TypeRef>,
        doc: Document,
    ) -> Result<IndexResult> {
        let started = Instant::now();
        let config = self.resolve(&doc_type.into())?;
        let id = config.id_of(&doc).ok_or(ValidationError::UndefinedId)?;
        let key = format!("{}:{}", config.name, id);

        if config.mode == TypeMode::Aggregate {
            let engine = self;
            let config_ref = &config;
            let key_ref = key.as_str();
            let id_ref = id.as_str();
            let doc_ref = &doc;

            // Wait out any in-flight flush cycle; holding the read side
            // keeps the next cycle from starting mid-mutation.
            let gate = self.cache.ensure_flush_complete().await;
            let displaced = self
                .locks
                .using_lock(&key, None, move |_handle| async move {
                    engine.accumulate(config_ref, key_ref, id_ref, doc_ref).await
                })
                .await?;
            drop(gate);

            self.flush_displaced(displaced).await;

            debug!(
                doc_type = %config.name,
                id = %id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "upserted aggregate"
            );
            Metrics::global()
                .operation_duration
                .observe(started.elapsed().as_secs_f64());

            return Ok(IndexResult::success(
                id,
                config.name.clone(),
                config.index.clone(),
                200,
                None,
                Operation::LazyAggregate,
            ));
        }

        let engine = self;
        let config_ref = &config;
        let id_owned = id.clone();

        let result = self
            .locks
            .using_lock(&key, None, move |handle| async move {
                let existing = engine
                    .store
                    .get(&config_ref.index, &config_ref.name, &id_owned)
                    .await?;

                match existing {
                    Some(existing_doc) => {
                        engine
                            .update(IndexRequest {
                                doc_type: TypeRef::Config(Arc::clone(config_ref)),
                                id: Some(id_owned),
                                doc,
                                existing: Baseline::Doc(existing_doc),
                                filter: None,
                                lock_handle: Some(handle),
                                partial: false,
                            })
                            .await
                    }
                    None => {
                        engine
                            .add(IndexRequest {
                                doc_type: TypeRef::Config(Arc::clone(config_ref)),
                                id: Some(id_owned),
                                doc,
                                existing: Baseline::Missing,
                                filter: None,
                                lock_handle: Some(handle),
                                partial: false,
                            })
                            .await
                    }
                }
            })
            .await?;

        Metrics::global()
            .operation_duration
            .observe(started.elapsed().as_secs_f64());

        Ok(result)
    }

    /// Fetch a full document; absent documents resolve to `None`.
    pub async fn get(
        &self,
        doc_type: impl Into<TypeRef>,
        id: &str,
    ) -> Result<Option<Document>> {
        let config = self.resolve(&doc_type.into())?;
        if id.is_empty() {
            return Err(ValidationError::UndefinedId.into());
        }

        self.store.get(&config.index, &config.name, id).await
    }

    /// Fetch only the fields the given measures read: each measure's own
    /// field plus the count/weight companion of the average variants.
    pub async fn optimised_get(
        &self,
        doc_type: impl Into<TypeRef>,
        id: &str,
        measures: &[Measure],
    ) -> Result<Option<Document>> {
        let config = self.resolve(&doc_type.into())?;
        self.fetch_measure_fields(&config, id, measures).await
    }

    /// Existence check against the store.
    pub async fn exists(&self, doc_type: impl Into<TypeRef>, id: &str) -> Result<bool> {
        let config = self.resolve(&doc_type.into())?;
        if id.is_empty() {
            return Err(ValidationError::UndefinedId.into());
        }

        self.store.exists(&config.index, &config.name, id).await
    }

    async fn fetch_measure_fields(
        &self,
        config: &TypeConfig,
        id: &str,
        measures: &[Measure],
    ) -> Result<Option<Document>> {
        if id.is_empty() {
            return Err(ValidationError::UndefinedId.into());
        }

        let mut fields = Vec::new();
        for measure in measures {
            if let Some(companion) = measure.companion_field() {
                fields.push(companion.to_string());
            }
            fields.push(measure.name().to_string());
        }

        self.store
            .get_fields(&config.index, &config.name, id, &fields)
            .await
    }

    /// One aggregate-mode upsert, inside the aggregate key's lock: fold the
    /// incoming document into the pending mutation for `key`.
    async fn accumulate(
        &self,
        config: &Arc<TypeConfig>,
        key: &str,
        id: &str,
        doc: &Document,
    ) -> Result<Displaced> {
        let (existing_doc, op_type): (Option<Document>, OpType) =
            match self.cache.retrieve(key).await? {
                Some(entry) => (Some(entry.doc), entry.op_type),
                None => match self.fetch_measure_fields(config, id, &config.measures).await? {
                    Some(fields) => (Some(fields), OpType::Update),
                    None => (None, OpType::Add),
                },
            };

        let partial_doc = config.build_aggregate(existing_doc.as_ref(), doc);

        let existing_aggregate = existing_doc.unwrap_or_default();
        let mut aggregate = existing_aggregate.clone();
        for (field, value) in partial_doc {
            aggregate.insert(field, value);
        }

        for measure in &config.measures {
            accumulate_measure(measure, &mut aggregate, &existing_aggregate, doc, op_type);
        }

        Metrics::global().aggregate_mutations.inc();

        self.cache
            .store(
                key,
                CacheEntry {
                    doc: aggregate,
                    existing_doc: existing_aggregate,
                    op_type,
                    id: id.to_string(),
                    doc_type: config.name.clone(),
                },
            )
            .await
    }

    /// Derive and apply aggregate mutations for one primary-type mutation.
    /// Returns cache entries displaced by the bounded cache; the caller
    /// flushes them after leaving its critical section.
    async fn build_aggregates(
        &self,
        config: &TypeConfig,
        new_doc: Option<&Document>,
        existing_doc: Option<&Document>,
        partial: bool,
    ) -> Result<Displaced> {
        let Some(aggregator) = self.indices.aggregator_for(&config.name) else {
            return Ok(Vec::new());
        };

        // A rejected new side degrades the mutation to a pure retraction.
        let new_doc = match (&aggregator.filter, new_doc) {
            (Some(filter), Some(doc)) if !filter(doc, existing_doc, partial) => None,
            _ => new_doc,
        };

        if new_doc.is_none() && existing_doc.is_none() {
            return Ok(Vec::new());
        }

        let mut displaced = Vec::new();
        for aggregate_config in aggregator.aggregates.values() {
            let new_members = extract_members(aggregate_config, new_doc);
            let existing_members = extract_members(aggregate_config, existing_doc);
            let measures = aggregate_config.measures(&aggregator.measures);

            for (member, op) in classify_members(new_members, existing_members, partial) {
                displaced.extend(
                    self.apply_member(
                        aggregate_config,
                        measures,
                        member,
                        op,
                        new_doc,
                        existing_doc,
                        partial,
                    )
                    .await?,
                );
            }
        }

        Ok(displaced)
    }

    /// Apply one classified membership event under the aggregate entity's
    /// own lock.
    #[allow(clippy::too_many_arguments)]
    async fn apply_member(
        &self,
        aggregate_config: &AggregateConfig,
        measures: &[Measure],
        member: AggregateMember,
        op: OpType,
        source_new: Option<&Document>,
        source_old: Option<&Document>,
        partial: bool,
    ) -> Result<Displaced> {
        let index_type = &aggregate_config.index_type;
        let key = format!("{}:{}", index_type.name, member.id);

        let engine = self;
        let key_ref = key.as_str();

        self.locks
            .using_lock(&key, None, move |_handle| async move {
                let (existing, carried) = match engine.cache.retrieve(key_ref).await? {
                    Some(entry) => (Some(entry.doc), Some(entry.op_type)),
                    None => (
                        engine
                            .fetch_measure_fields(index_type, &member.id, measures)
                            .await?,
                        None,
                    ),
                };

                // Demotion rules apply only when there is no prior state:
                // an UPDATE with nothing to update is an ADD, a REMOVE with
                // nothing to remove is a no-op.
                let measure_op = match &existing {
                    None => match op {
                        OpType::Update | OpType::Add => OpType::Add,
                        OpType::Remove => return Ok(Vec::new()),
                    },
                    Some(_) => op,
                };

                // The entry keeps its original classification so the flush
                // still knows whether the aggregate was ever persisted.
                let entry_op = carried.unwrap_or(measure_op);

                let existing_aggregate = existing.unwrap_or_default();
                let mut aggregate = existing_aggregate.clone();
                for (field, value) in member.doc {
                    aggregate.insert(field, value);
                }

                for measure in measures {
                    recompute_measure(
                        measure,
                        &mut aggregate,
                        &existing_aggregate,
                        source_new,
                        source_old,
                        partial,
                        measure_op,
                    );
                }

                Metrics::global().aggregate_mutations.inc();

                engine
                    .cache
                    .store(
                        key_ref,
                        CacheEntry {
                            doc: aggregate,
                            existing_doc: existing_aggregate,
                            op_type: entry_op,
                            id: member.id.clone(),
                            doc_type: index_type.name.clone(),
                        },
                    )
                    .await
            })
            .await
    }

    /// Persist one pending mutation: an entry that was never in the store
    /// becomes an add, anything else a merge over its recorded baseline.
    /// Boxed to cut the async cycle back through `add`/`update`.
    fn persist_entry<'a>(
        &'a self,
        entry: CacheEntry,
        handle: LockHandle,
    ) -> Pin<Box<dyn Future<Output = Result<IndexResult>> + Send + 'a>> {
        Box::pin(async move {
            let config = self
                .indices
                .type_config(&entry.doc_type)
                .cloned()
                .ok_or_else(|| {
                    Error::from(ValidationError::UnrecognizedType {
                        name: entry.doc_type.clone(),
                    })
                })?;

            if entry.op_type == OpType::Add {
                self.add(IndexRequest {
                    doc_type: TypeRef::Config(config),
                    id: Some(entry.id),
                    doc: entry.doc,
                    existing: Baseline::Unknown,
                    filter: None,
                    lock_handle: Some(handle),
                    partial: false,
                })
                .await
            } else {
                self.update(IndexRequest {
                    doc_type: TypeRef::Config(config),
                    id: Some(entry.id),
                    doc: entry.doc,
                    existing: Baseline::Doc(entry.existing_doc),
                    filter: None,
                    lock_handle: Some(handle),
                    partial: false,
                })
                .await
            }
        })
    }

    /// Flush entries the bounded cache displaced. Runs outside the caller's
    /// critical section; a failure here loses the entry's pending deltas,
    /// so it is logged at error level.
    async fn flush_displaced(&self, displaced: Displaced) {
        for (key, entry) in displaced {
            debug!(%key, "flushing displaced cache entry");

            let outcome = self
                .locks
                .using_lock(&key, None, move |handle| self.persist_entry(entry, handle))
                .await;

            match outcome {
                Ok(_) => Metrics::global().aggregates_flushed.inc(),
                Err(err) => {
                    error!(%key, error = %err, "failed to flush displaced aggregate, pending deltas lost");
                }
            }
        }
    }

    /// Persist the pending mutation for `key` and clear its cache entry.
    /// A missing entry is a no-op.
    pub async fn flush_aggregate(&self, key: &str) -> Result<()> {
        let started = Instant::now();
        let engine = self;

        let flushed = self
            .locks
            .using_lock(key, None, move |handle| async move {
                let Some(entry) = engine.cache.retrieve(key).await? else {
                    return Ok(false);
                };

                let result = engine.persist_entry(entry, handle).await?;
                if !result.is_success() {
                    warn!(%key, fail_code = ?result.fail_code, "flush write resolved as a soft failure");
                }

                engine.cache.remove(key).await?;
                Ok(true)
            })
            .await?;

        if flushed {
            Metrics::global().aggregates_flushed.inc();
            debug!(
                %key,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "flushed aggregate"
            );
        }

        Ok(())
    }

    /// One flush cycle over every outstanding cache key. Aggregate-mode
    /// writers are held out for the duration. Returns the number of keys
    /// flushed; per-key failures are logged and leave the entry cached for
    /// the next cycle.
    pub async fn flush_all_aggregates(&self) -> Result<usize> {
        let _cycle = self.cache.begin_flush_cycle().await;

        let keys = self.cache.keys().await?;
        let mut flushed = 0;

        for key in keys {
            match self.flush_aggregate(&key).await {
                Ok(()) => flushed += 1,
                Err(err) => {
                    warn!(%key, error = %err, "failed to flush aggregate, leaving it cached");
                }
            }
        }

        Ok(flushed)
    }

    /// Create one configured index, or all of them, installing each type's
    /// mapping under its store.
    pub async fn create_index(&self, index_key: Option<&str>) -> Result<()> {
        match index_key {
            Some(key) => {
                let index_config = self
                    .indices
                    .index_config(key)
                    .ok_or_else(|| Error::config(format!("unknown index: {key}")))?;
                self.create_one_index(index_config).await
            }
            None => {
                for (_, index_config) in self.indices.indices() {
                    self.create_one_index(index_config).await?;
                }
                Ok(())
            }
        }
    }

    async fn create_one_index(&self, index_config: &IndexConfig) -> Result<()> {
        let mut mappings = serde_json::Map::new();
        for type_config in self.indices.types_for_store(&index_config.store) {
            mappings.insert(type_config.name.clone(), type_config.mapping.clone());
        }

        let body = json!({
            "settings": {"number_of_shards": 3, "analysis": index_config.analysis},
            "mappings": mappings,
        });

        let write = self.store.create_index(&index_config.store, body).await?;
        info!(index = %index_config.store, status = write.status_code, "created index");
        Ok(())
    }

    /// Delete one configured index, or all of them. An absent index (404)
    /// counts as success.
    pub async fn delete_index(&self, index_key: Option<&str>) -> Result<()> {
        match index_key {
            Some(key) => {
                let index_config = self
                    .indices
                    .index_config(key)
                    .ok_or_else(|| Error::config(format!("unknown index: {key}")))?;

                let write = self.store.delete_index(&index_config.store).await?;
                info!(index = %index_config.store, status = write.status_code, "deleted index");
                Ok(())
            }
            None => {
                for (_, index_config) in self.indices.indices() {
                    let write = self.store.delete_index(&index_config.store).await?;
                    info!(index = %index_config.store, status = write.status_code, "deleted index");
                }
                Ok(())
            }
        }
    }

    /// Drain the cache with a final flush cycle.
    pub async fn shutdown(&self) -> Result<()> {
        let flushed = self.flush_all_aggregates().await?;

        let outstanding = self.cache.shutdown().await?;
        if !outstanding.is_empty() {
            warn!(
                outstanding = outstanding.len(),
                "shutting down with unflushed aggregate mutations"
            );
        }

        info!(flushed, "indexer engine shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::num_field;
    use crate::schema::AggregatorConfig;
    use serde_json::{json, Value};

    fn doc(value: Value) -> Document {
        value.as_object().unwrap().clone()
    }

    fn author_type() -> Arc<TypeConfig> {
        TypeConfig::builder("authorAutocomplete", "autocomplete")
            .id(|d| d.get("key").and_then(Value::as_str).map(str::to_string))
            .child()
            .build()
    }

    fn book_registry() -> Arc<IndicesConfig> {
        let author = author_type();

        let book = TypeConfig::builder("book", "books")
            .weight(|d| num_field(d, "downloadCount"))
            .filter(|d, _, _| d.get("approved").and_then(Value::as_bool).unwrap_or(true))
            .build();

        let aggregator = AggregatorConfig::new(vec![Measure::count("bookCount")]).aggregate(
            "authorAutocomplete",
            AggregateConfig::new("creators", Arc::clone(&author), |_, creator| {
                let mut member = Document::new();
                member.insert("key".into(), creator.clone());
                member.insert("name".into(), creator.clone());
                member
            }),
        );

        Arc::new(
            IndicesConfig::new()
                .index(
                    "books",
                    IndexConfig {
                        store: "books".into(),
                        analysis: Value::Null,
                    },
                )
                .index(
                    "autocomplete",
                    IndexConfig {
                        store: "autocomplete".into(),
                        analysis: Value::Null,
                    },
                )
                .doc_type(book)
                .doc_type(author)
                .aggregator("book", aggregator),
        )
    }

    fn search_registry() -> Arc<IndicesConfig> {
        let search = TypeConfig::builder("searchQuery", "analytics")
            .id(|d| d.get("query").and_then(Value::as_str).map(str::to_string))
            .aggregate(
                |_, new| {
                    let mut partial = Document::new();
                    if let Some(query) = new.get("query") {
                        partial.insert("query".into(), query.clone());
                    }
                    partial
                },
                vec![
                    Measure::count("count"),
                    Measure::weighted_average("rating", "ratingCount"),
                    Measure::sum("ratingCount"),
                ],
            )
            .build();

        Arc::new(
            IndicesConfig::new()
                .index(
                    "analytics",
                    IndexConfig {
                        store: "analytics".into(),
                        analysis: Value::Null,
                    },
                )
                .doc_type(search),
        )
    }

    fn engine(indices: Arc<IndicesConfig>) -> IndexerEngine {
        IndexerEngine::with_store(indices, Arc::new(MemStore::new()))
    }

    #[tokio::test]
    async fn test_add_then_get_applies_weight() {
        let engine = engine(book_registry());

        let result = engine
            .add(IndexRequest::new(
                "book",
                doc(json!({"id": "b1", "title": "Dune", "downloadCount": 5})),
            ))
            .await
            .unwrap();
        assert!(result.is_success());
        assert_eq!(result.operation, Operation::Add);

        let stored = engine.get("book", "b1").await.unwrap().unwrap();
        assert_eq!(num_field(&stored, "weight"), 1.792);
        assert_eq!(num_field(&stored, "downloadCount"), 5.0);
    }

    #[tokio::test]
    async fn test_add_existing_id_reports_exists_already() {
        let engine = engine(book_registry());

        engine
            .add(IndexRequest::new("book", doc(json!({"id": "b1", "title": "first"}))))
            .await
            .unwrap();
        let second = engine
            .add(IndexRequest::new("book", doc(json!({"id": "b1", "title": "second"}))))
            .await
            .unwrap();

        assert!(!second.is_success());
        assert_eq!(second.fail_code, Some(FailCode::ExistsAlready));

        let stored = engine.get("book", "b1").await.unwrap().unwrap();
        assert_eq!(stored.get("title"), Some(&json!("first")));
    }

    #[tokio::test]
    async fn test_remove_missing_id_reports_not_found() {
        let engine = engine(book_registry());

        let result = engine
            .remove(RemoveRequest::new("book", "nope"))
            .await
            .unwrap();
        assert!(!result.is_success());
        assert_eq!(result.fail_code, Some(FailCode::NotFound));
    }

    #[tokio::test]
    async fn test_filtered_add_skips_without_writing() {
        let engine = engine(book_registry());

        let result = engine
            .add(IndexRequest::new(
                "book",
                doc(json!({"id": "b9", "approved": false})),
            ))
            .await
            .unwrap();

        assert_eq!(result.fail_code, Some(FailCode::Skip));
        assert!(engine.get("book", "b9").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_type_is_a_validation_error() {
        let engine = engine(book_registry());

        let err = engine
            .add(IndexRequest::new("movie", doc(json!({"id": "m1"}))))
            .await
            .unwrap_err();

        match err {
            Error::Validation(v) => assert_eq!(v.code(), "UNRECOGNIZED_TYPE"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_update_filter_rejection_cascades_to_remove() {
        let engine = engine(book_registry());

        engine
            .add(IndexRequest::new(
                "book",
                doc(json!({"id": "b1", "approved": true, "creators": ["a1"]})),
            ))
            .await
            .unwrap();

        let result = engine
            .update(IndexRequest::new(
                "book",
                doc(json!({"id": "b1", "approved": false, "creators": ["a1"]})),
            ))
            .await
            .unwrap();

        assert_eq!(result.operation, Operation::Remove);
        assert!(engine.get("book", "b1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_count_reflects_adds_minus_removes() {
        let engine = engine(book_registry());

        engine
            .add(IndexRequest::new(
                "book",
                doc(json!({"id": "b1", "creators": ["a1", "a2"]})),
            ))
            .await
            .unwrap();
        engine
            .add(IndexRequest::new(
                "book",
                doc(json!({"id": "b2", "creators": ["a1"]})),
            ))
            .await
            .unwrap();
        engine.remove(RemoveRequest::new("book", "b2")).await.unwrap();

        engine.flush_all_aggregates().await.unwrap();

        let a1 = engine
            .get("authorAutocomplete", "a1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(num_field(&a1, "bookCount"), 1.0);

        let a2 = engine
            .get("authorAutocomplete", "a2")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(num_field(&a2, "bookCount"), 1.0);
    }

    #[tokio::test]
    async fn test_partial_update_keeps_absent_members() {
        let engine = engine(book_registry());

        engine
            .add(IndexRequest::new(
                "book",
                doc(json!({"id": "b1", "title": "old", "creators": ["a1", "a2"]})),
            ))
            .await
            .unwrap();
        engine.flush_all_aggregates().await.unwrap();

        let result = engine
            .partial_update(
                IndexRequest::new("book", doc(json!({"title": "renamed"}))).id("b1"),
            )
            .await
            .unwrap();
        assert!(result.is_success());
        assert_eq!(result.operation, Operation::PartialUpdate);

        engine.flush_all_aggregates().await.unwrap();

        let a1 = engine
            .get("authorAutocomplete", "a1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(num_field(&a1, "bookCount"), 1.0);
        let a2 = engine
            .get("authorAutocomplete", "a2")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(num_field(&a2, "bookCount"), 1.0);

        let book = engine.get("book", "b1").await.unwrap().unwrap();
        assert_eq!(book.get("title"), Some(&json!("renamed")));
        assert_eq!(book.get("creators"), Some(&json!(["a1", "a2"])));
    }

    #[tokio::test]
    async fn test_upsert_dispatches_add_then_update() {
        let engine = engine(book_registry());
        let payload = json!({"id": "b1", "title": "first", "creators": ["a1"]});

        let first = engine.upsert("book", doc(payload.clone())).await.unwrap();
        assert_eq!(first.operation, Operation::Add);

        let second = engine
            .upsert("book", doc(json!({"id": "b1", "title": "second", "creators": ["a1"]})))
            .await
            .unwrap();
        assert_eq!(second.operation, Operation::Update);

        let stored = engine.get("book", "b1").await.unwrap().unwrap();
        assert_eq!(stored.get("title"), Some(&json!("second")));
    }

    #[tokio::test]
    async fn test_flush_is_idempotent() {
        let engine = engine(search_registry());

        engine
            .upsert("searchQuery", doc(json!({"query": "alpha"})))
            .await
            .unwrap();

        engine.flush_aggregate("searchQuery:alpha").await.unwrap();
        let first = engine.get("searchQuery", "alpha").await.unwrap().unwrap();
        assert_eq!(num_field(&first, "count"), 1.0);

        engine.flush_aggregate("searchQuery:alpha").await.unwrap();
        let second = engine.get("searchQuery", "alpha").await.unwrap().unwrap();
        assert_eq!(num_field(&second, "count"), 1.0);
    }

    #[tokio::test]
    async fn test_weighted_average_is_commutative() {
        let first = doc(json!({"query": "q", "rating": 4, "ratingCount": 2}));
        let second = doc(json!({"query": "q", "rating": 3, "ratingCount": 1}));

        let forward = engine(search_registry());
        forward.upsert("searchQuery", first.clone()).await.unwrap();
        forward.upsert("searchQuery", second.clone()).await.unwrap();
        forward.flush_all_aggregates().await.unwrap();

        let reverse = engine(search_registry());
        reverse.upsert("searchQuery", second).await.unwrap();
        reverse.upsert("searchQuery", first).await.unwrap();
        reverse.flush_all_aggregates().await.unwrap();

        let a = forward.get("searchQuery", "q").await.unwrap().unwrap();
        let b = reverse.get("searchQuery", "q").await.unwrap().unwrap();

        assert_eq!(num_field(&a, "rating"), 3.667);
        assert_eq!(num_field(&a, "rating"), num_field(&b, "rating"));
        assert_eq!(num_field(&a, "ratingCount"), 3.0);
    }

    #[tokio::test]
    async fn test_concurrent_upserts_count_every_event() {
        let engine = Arc::new(engine(search_registry()));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let engine = Arc::clone(&engine);
            tasks.push(tokio::spawn(async move {
                engine
                    .upsert("searchQuery", doc(json!({"query": "popular"})))
                    .await
                    .unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        engine.flush_all_aggregates().await.unwrap();

        let stored = engine.get("searchQuery", "popular").await.unwrap().unwrap();
        assert_eq!(num_field(&stored, "count"), 8.0);
    }

    #[tokio::test]
    async fn test_displaced_entry_is_flushed_not_dropped() {
        let mut config = Config::default();
        config.store.mode = BackendMode::Memory;
        config.cache.max_entries = 1;

        let engine = IndexerEngine::new(&config, search_registry()).unwrap();

        engine
            .upsert("searchQuery", doc(json!({"query": "alpha"})))
            .await
            .unwrap();
        engine
            .upsert("searchQuery", doc(json!({"query": "beta"})))
            .await
            .unwrap();

        // alpha was displaced by beta and implicitly flushed to the store
        let alpha = engine.get("searchQuery", "alpha").await.unwrap().unwrap();
        assert_eq!(num_field(&alpha, "count"), 1.0);

        // beta is still only pending in the cache
        assert!(engine.get("searchQuery", "beta").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_aggregator_filter_gates_derivation() {
        let author = author_type();
        let book = TypeConfig::builder("book", "books").build();
        let aggregator = AggregatorConfig::new(vec![Measure::count("bookCount")])
            .filter(|new, _, _| !new.get("internal").and_then(Value::as_bool).unwrap_or(false))
            .aggregate(
                "authorAutocomplete",
                AggregateConfig::new("creators", Arc::clone(&author), |_, creator| {
                    let mut member = Document::new();
                    member.insert("key".into(), creator.clone());
                    member
                }),
            );

        let registry = Arc::new(
            IndicesConfig::new()
                .doc_type(book)
                .doc_type(author)
                .aggregator("book", aggregator),
        );
        let engine = engine(registry);

        engine
            .add(IndexRequest::new(
                "book",
                doc(json!({"id": "b1", "internal": true, "creators": ["a1"]})),
            ))
            .await
            .unwrap();

        assert_eq!(engine.flush_all_aggregates().await.unwrap(), 0);
        assert!(engine
            .get("authorAutocomplete", "a1")
            .await
            .unwrap()
            .is_none());
        assert!(engine.get("book", "b1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_optimised_get_projects_measure_fields() {
        let engine = engine(search_registry());

        engine
            .upsert(
                "searchQuery",
                doc(json!({"query": "alpha", "rating": 4, "ratingCount": 2})),
            )
            .await
            .unwrap();
        engine.flush_all_aggregates().await.unwrap();

        let measures = vec![
            Measure::count("count"),
            Measure::weighted_average("rating", "ratingCount"),
        ];
        let projected = engine
            .optimised_get("searchQuery", "alpha", &measures)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(num_field(&projected, "count"), 1.0);
        assert_eq!(num_field(&projected, "rating"), 4.0);
        assert!(projected.get("query").is_none());
    }

    #[tokio::test]
    async fn test_exists_tracks_store_state() {
        let engine = engine(book_registry());
        assert!(!engine.exists("book", "b1").await.unwrap());

        engine
            .add(IndexRequest::new("book", doc(json!({"id": "b1"}))))
            .await
            .unwrap();
        assert!(engine.exists("book", "b1").await.unwrap());
    }

    #[tokio::test]
    async fn test_index_management_round_trip() {
        let engine = engine(book_registry());

        engine.create_index(None).await.unwrap();
        engine.delete_index(Some("books")).await.unwrap();
        // deleting again is tolerated, the index is simply absent
        engine.delete_index(Some("books")).await.unwrap();

        assert!(engine.create_index(Some("missing")).await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_drains_pending_mutations() {
        let engine = engine(search_registry());
        engine
            .upsert("searchQuery", doc(json!({"query": "alpha"})))
            .await
            .unwrap();

        engine.shutdown().await.unwrap();

        let stored = engine.get("searchQuery", "alpha").await.unwrap().unwrap();
        assert_eq!(num_field(&stored, "count"), 1.0);
    }
}
