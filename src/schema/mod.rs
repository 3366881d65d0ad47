//! Declarative type, aggregator and measure configuration
//!
//! Everything in this module is immutable process-lifetime configuration: it
//! parameterizes the engine but carries no runtime state. Type hooks
//! (id extraction, transforms, filters, weights, aggregate builders) are
//! closures registered once at startup; measure descriptors are resolved to
//! a closed tagged enum here rather than re-interpreted per event.

use crate::core::types::{Document, OpType};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Derives a document's id. Returning `None` means no id can be calculated.
pub type IdFn = Arc<dyn Fn(&Document) -> Option<String> + Send + Sync>;

/// Normalizes a document in place before it is written.
pub type TransformFn = Arc<dyn Fn(&mut Document) + Send + Sync>;

/// Inclusion predicate: `(new_doc, existing_doc, partial)`.
pub type FilterFn = Arc<dyn Fn(&Document, Option<&Document>, bool) -> bool + Send + Sync>;

/// Raw engagement score for a document; stored as `round(log1p(score), 3)`.
pub type WeightFn = Arc<dyn Fn(&Document) -> f64 + Send + Sync>;

/// Builds the partial aggregate doc for an aggregate-mode upsert:
/// `(existing_aggregate_doc, new_doc)`.
pub type AggregateBuilderFn = Arc<dyn Fn(Option<&Document>, &Document) -> Document + Send + Sync>;

/// Builds one aggregate member record from `(source_doc, field_element)`.
pub type MemberBuilderFn = Arc<dyn Fn(&Document, &Value) -> Document + Send + Sync>;

/// Computes a FUNCTION measure from the fully merged aggregate doc.
pub type MeasureFn = Arc<dyn Fn(&Document, OpType) -> f64 + Send + Sync>;

/// Default rounding for measure values.
pub const DEFAULT_ROUND: u32 = 3;

/// Post-processing applied to a FUNCTION measure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modifier {
    /// `ln(1 + x)`, the default dampening for engagement-style scores
    Log1p,
}

/// A named numeric computation rule attached to an aggregate entity.
///
/// Resolved once at configuration-load time; the engine dispatches on the
/// variant, never on dynamic descriptors.
#[derive(Clone)]
pub enum Measure {
    /// Membership count: +1 per ADD, -1 per REMOVE
    Count {
        /// Aggregate field the count is stored in
        name: String,
    },
    /// Running sum of a source-document field
    Sum {
        /// Field name, shared by source and aggregate documents
        name: String,
    },
    /// Running mean weighted by an explicit count field
    Average {
        /// Aggregate field the mean is stored in
        name: String,
        /// Field holding the per-document count
        count_field: String,
        /// Decimal places
        round: u32,
    },
    /// Running mean weighted by a weight field
    WeightedAverage {
        /// Aggregate field the mean is stored in
        name: String,
        /// Field holding the per-document weight
        weight_field: String,
        /// Decimal places
        round: u32,
    },
    /// Recomputed from the merged aggregate doc by a registered closure
    Function {
        /// Aggregate field the value is stored in
        name: String,
        /// The computation
        func: MeasureFn,
        /// Optional dampening modifier; `None` disables it
        modifier: Option<Modifier>,
        /// Decimal places
        round: u32,
    },
}

impl Measure {
    /// A COUNT measure.
    pub fn count(name: impl Into<String>) -> Self {
        Self::Count { name: name.into() }
    }

    /// A SUM measure.
    pub fn sum(name: impl Into<String>) -> Self {
        Self::Sum { name: name.into() }
    }

    /// An AVERAGE measure with default rounding.
    pub fn average(name: impl Into<String>, count_field: impl Into<String>) -> Self {
        Self::Average {
            name: name.into(),
            count_field: count_field.into(),
            round: DEFAULT_ROUND,
        }
    }

    /// A WEIGHTED_AVERAGE measure with default rounding.
    pub fn weighted_average(name: impl Into<String>, weight_field: impl Into<String>) -> Self {
        Self::WeightedAverage {
            name: name.into(),
            weight_field: weight_field.into(),
            round: DEFAULT_ROUND,
        }
    }

    /// A FUNCTION measure with the default `log1p` modifier and rounding.
    pub fn function<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Document, OpType) -> f64 + Send + Sync + 'static,
    {
        Self::Function {
            name: name.into(),
            func: Arc::new(func),
            modifier: Some(Modifier::Log1p),
            round: DEFAULT_ROUND,
        }
    }

    /// Override the rounding precision.
    pub fn with_round(mut self, places: u32) -> Self {
        match &mut self {
            Self::Count { .. } | Self::Sum { .. } => {}
            Self::Average { round, .. }
            | Self::WeightedAverage { round, .. }
            | Self::Function { round, .. } => *round = places,
        }
        self
    }

    /// Disable the FUNCTION modifier. No-op for other variants.
    pub fn without_modifier(mut self) -> Self {
        if let Self::Function { modifier, .. } = &mut self {
            *modifier = None;
        }
        self
    }

    /// The aggregate field this measure writes.
    pub fn name(&self) -> &str {
        match self {
            Self::Count { name }
            | Self::Sum { name }
            | Self::Average { name, .. }
            | Self::WeightedAverage { name, .. }
            | Self::Function { name, .. } => name,
        }
    }

    /// The count/weight field an average variant reads alongside its value.
    pub fn companion_field(&self) -> Option<&str> {
        match self {
            Self::Average { count_field, .. } => Some(count_field),
            Self::WeightedAverage { weight_field, .. } => Some(weight_field),
            _ => None,
        }
    }
}

impl fmt::Debug for Measure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::Count { .. } => "COUNT",
            Self::Sum { .. } => "SUM",
            Self::Average { .. } => "AVERAGE",
            Self::WeightedAverage { .. } => "WEIGHTED_AVERAGE",
            Self::Function { .. } => "FUNCTION",
        };
        write!(f, "Measure::{}({})", kind, self.name())
    }
}

/// Whether a type is written directly or only materialized through the
/// write-back cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TypeMode {
    /// Written directly by producers
    #[default]
    Primary,
    /// Upserts accumulate in the aggregator cache and reach the store only
    /// on flush
    Aggregate,
}

/// Per document-type configuration.
pub struct TypeConfig {
    /// Type discriminator
    pub name: String,
    /// Store index the type lives in
    pub index: String,
    /// Store mapping installed at index creation
    pub mapping: Value,
    /// Primary or aggregate-mode
    pub mode: TypeMode,
    /// Entity only reachable via aggregation, never written by producers
    pub child: bool,
    /// Measures recomputed on aggregate-mode upserts
    pub measures: Vec<Measure>,
    id: Option<IdFn>,
    transform: Option<TransformFn>,
    filter: Option<FilterFn>,
    weight: Option<WeightFn>,
    aggregate_builder: Option<AggregateBuilderFn>,
}

impl fmt::Debug for TypeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeConfig")
            .field("name", &self.name)
            .field("index", &self.index)
            .field("mode", &self.mode)
            .field("child", &self.child)
            .field("measures", &self.measures)
            .finish()
    }
}

impl TypeConfig {
    /// Start building a type bound to a store index.
    pub fn builder(name: impl Into<String>, index: impl Into<String>) -> TypeConfigBuilder {
        TypeConfigBuilder {
            config: Self {
                name: name.into(),
                index: index.into(),
                mapping: Value::Null,
                mode: TypeMode::Primary,
                child: false,
                measures: Vec::new(),
                id: None,
                transform: None,
                filter: None,
                weight: None,
                aggregate_builder: None,
            },
        }
    }

    /// Derive the document's id, falling back to a literal `id` field when
    /// no extractor is registered.
    pub fn id_of(&self, doc: &Document) -> Option<String> {
        match &self.id {
            Some(extract) => extract(doc).filter(|id| !id.is_empty()),
            None => doc
                .get("id")
                .and_then(Value::as_str)
                .filter(|id| !id.is_empty())
                .map(str::to_string),
        }
    }

    /// Apply the registered transform, if any.
    pub fn apply_transform(&self, doc: &mut Document) {
        if let Some(transform) = &self.transform {
            transform(doc);
        }
    }

    /// Run the type-level filter. Absence of a filter accepts everything.
    pub fn accepts(&self, doc: &Document, existing: Option<&Document>, partial: bool) -> bool {
        match &self.filter {
            Some(filter) => filter(doc, existing, partial),
            None => true,
        }
    }

    /// Raw engagement score, when a weight function is registered.
    pub fn weight_of(&self, doc: &Document) -> Option<f64> {
        self.weight.as_ref().map(|weight| weight(doc))
    }

    /// Build the aggregate-mode partial doc for an upsert.
    pub fn build_aggregate(&self, existing: Option<&Document>, doc: &Document) -> Document {
        match &self.aggregate_builder {
            Some(build) => build(existing, doc),
            None => doc.clone(),
        }
    }
}

/// Builder for [`TypeConfig`]; the closure fields make struct literals
/// unreadable at registration sites.
pub struct TypeConfigBuilder {
    config: TypeConfig,
}

impl TypeConfigBuilder {
    /// Register the id extractor.
    pub fn id<F>(mut self, extract: F) -> Self
    where
        F: Fn(&Document) -> Option<String> + Send + Sync + 'static,
    {
        self.config.id = Some(Arc::new(extract));
        self
    }

    /// Register the pre-write transform.
    pub fn transform<F>(mut self, transform: F) -> Self
    where
        F: Fn(&mut Document) + Send + Sync + 'static,
    {
        self.config.transform = Some(Arc::new(transform));
        self
    }

    /// Register the inclusion predicate.
    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Document, Option<&Document>, bool) -> bool + Send + Sync + 'static,
    {
        self.config.filter = Some(Arc::new(filter));
        self
    }

    /// Register the engagement-score function.
    pub fn weight<F>(mut self, weight: F) -> Self
    where
        F: Fn(&Document) -> f64 + Send + Sync + 'static,
    {
        self.config.weight = Some(Arc::new(weight));
        self
    }

    /// Install the store mapping for index creation.
    pub fn mapping(mut self, mapping: Value) -> Self {
        self.config.mapping = mapping;
        self
    }

    /// Mark the type as a child entity (only reachable via aggregation).
    pub fn child(mut self) -> Self {
        self.config.child = true;
        self
    }

    /// Switch the type to aggregate mode with its builder and measures.
    pub fn aggregate<F>(mut self, builder: F, measures: Vec<Measure>) -> Self
    where
        F: Fn(Option<&Document>, &Document) -> Document + Send + Sync + 'static,
    {
        self.config.mode = TypeMode::Aggregate;
        self.config.aggregate_builder = Some(Arc::new(builder));
        self.config.measures = measures;
        self
    }

    /// Finish the type.
    pub fn build(self) -> Arc<TypeConfig> {
        Arc::new(self.config)
    }
}

/// One nested-aggregate derivation from a primary type.
pub struct AggregateConfig {
    /// Scalar or array-valued property of the primary document whose
    /// elements become aggregate members
    pub field: String,
    /// Type the derived aggregate entities are written as
    pub index_type: Arc<TypeConfig>,
    /// Measures overriding the aggregator-level defaults
    pub measures: Option<Vec<Measure>>,
    member_builder: MemberBuilderFn,
}

impl AggregateConfig {
    /// Define a derivation over `field`, materialized as `index_type`.
    pub fn new<F>(field: impl Into<String>, index_type: Arc<TypeConfig>, member_builder: F) -> Self
    where
        F: Fn(&Document, &Value) -> Document + Send + Sync + 'static,
    {
        Self {
            field: field.into(),
            index_type,
            measures: None,
            member_builder: Arc::new(member_builder),
        }
    }

    /// Override the aggregator-level measures for this derivation.
    pub fn with_measures(mut self, measures: Vec<Measure>) -> Self {
        self.measures = Some(measures);
        self
    }

    /// Build one member record from a field element.
    pub fn build_member(&self, doc: &Document, element: &Value) -> Document {
        (self.member_builder)(doc, element)
    }

    /// Measures in effect for this derivation.
    pub fn measures<'a>(&'a self, defaults: &'a [Measure]) -> &'a [Measure] {
        self.measures.as_deref().unwrap_or(defaults)
    }
}

/// Per primary-type aggregation configuration.
pub struct AggregatorConfig {
    /// Default measures applied by every derivation
    pub measures: Vec<Measure>,
    /// Optional gate: rejecting `(new_doc, existing_doc, partial)` treats
    /// the mutation's new side as absent
    pub filter: Option<FilterFn>,
    /// Derivations keyed by aggregate name
    pub aggregates: HashMap<String, AggregateConfig>,
}

impl AggregatorConfig {
    /// An aggregator with default measures and no derivations yet.
    pub fn new(measures: Vec<Measure>) -> Self {
        Self {
            measures,
            filter: None,
            aggregates: HashMap::new(),
        }
    }

    /// Add a named derivation.
    pub fn aggregate(mut self, name: impl Into<String>, config: AggregateConfig) -> Self {
        self.aggregates.insert(name.into(), config);
        self
    }

    /// Gate the aggregator behind a filter.
    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Document, Option<&Document>, bool) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }
}

/// Store index settings.
#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Physical index name in the store
    pub store: String,
    /// Analysis settings installed at index creation
    pub analysis: Value,
}

/// The full immutable registry handed to the engine at startup.
pub struct IndicesConfig {
    indices: HashMap<String, IndexConfig>,
    types: HashMap<String, Arc<TypeConfig>>,
    aggregators: HashMap<String, AggregatorConfig>,
}

impl IndicesConfig {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            indices: HashMap::new(),
            types: HashMap::new(),
            aggregators: HashMap::new(),
        }
    }

    /// Register a store index.
    pub fn index(mut self, key: impl Into<String>, config: IndexConfig) -> Self {
        self.indices.insert(key.into(), config);
        self
    }

    /// Register a document type under its own name.
    pub fn doc_type(mut self, config: Arc<TypeConfig>) -> Self {
        self.types.insert(config.name.clone(), config);
        self
    }

    /// Attach an aggregator to a primary type name.
    pub fn aggregator(mut self, type_name: impl Into<String>, config: AggregatorConfig) -> Self {
        self.aggregators.insert(type_name.into(), config);
        self
    }

    /// Look up a type by name.
    pub fn type_config(&self, name: &str) -> Option<&Arc<TypeConfig>> {
        self.types.get(name)
    }

    /// Look up the aggregator attached to a primary type.
    pub fn aggregator_for(&self, type_name: &str) -> Option<&AggregatorConfig> {
        self.aggregators.get(type_name)
    }

    /// All configured store indices.
    pub fn indices(&self) -> impl Iterator<Item = (&String, &IndexConfig)> {
        self.indices.iter()
    }

    /// Look up a store index by key.
    pub fn index_config(&self, key: &str) -> Option<&IndexConfig> {
        self.indices.get(key)
    }

    /// Types bound to a physical store index.
    pub fn types_for_store<'a>(
        &'a self,
        store: &'a str,
    ) -> impl Iterator<Item = &'a Arc<TypeConfig>> + 'a {
        self.types.values().filter(move |t| t.index == store)
    }
}

impl Default for IndicesConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_type_builder_id_extraction() {
        let book = TypeConfig::builder("book", "books")
            .id(|d| d.get("isbn").and_then(Value::as_str).map(str::to_string))
            .build();

        let d = doc(json!({"isbn": "978-3", "title": "t"}));
        assert_eq!(book.id_of(&d), Some("978-3".to_string()));
        assert_eq!(book.id_of(&Document::new()), None);
    }

    #[test]
    fn test_id_falls_back_to_literal_field_and_rejects_empty() {
        let plain = TypeConfig::builder("note", "notes").build();
        assert_eq!(plain.id_of(&doc(json!({"id": "n1"}))), Some("n1".to_string()));
        assert_eq!(plain.id_of(&doc(json!({"id": ""}))), None);
    }

    #[test]
    fn test_measure_companion_fields() {
        let rating = Measure::weighted_average("rating", "ratingCount").with_round(1);
        assert_eq!(rating.name(), "rating");
        assert_eq!(rating.companion_field(), Some("ratingCount"));

        let count = Measure::count("bookCount");
        assert_eq!(count.companion_field(), None);

        match rating {
            Measure::WeightedAverage { round, .. } => assert_eq!(round, 1),
            _ => panic!("expected weighted average"),
        }
    }

    #[test]
    fn test_registry_lookup() {
        let author = TypeConfig::builder("author", "autocomplete").child().build();
        let registry = IndicesConfig::new()
            .index("autocomplete", IndexConfig { store: "autocomplete".into(), analysis: Value::Null })
            .doc_type(author);

        assert!(registry.type_config("author").is_some());
        assert!(registry.type_config("movie").is_none());
        assert_eq!(registry.types_for_store("autocomplete").count(), 1);
    }
}
