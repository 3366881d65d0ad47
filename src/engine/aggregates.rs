//! Aggregate membership diffing and incremental measure math
//!
//! A primary-document mutation touches zero or more aggregate entities.
//! Member extraction turns the document's aggregate-bearing field into a set
//! of member records keyed by aggregate id; classification compares the new
//! and existing sets into ADD / REMOVE / UPDATE events; the measure
//! functions fold one event into the stored measure values without ever
//! replaying membership history.

use crate::core::types::{num_field, num_field_opt, round_to, set_num_field, Document, OpType};
use crate::schema::{AggregateConfig, Measure, Modifier};
use serde_json::Value;
use std::collections::HashSet;

/// One aggregate member derived from a primary document.
pub(crate) struct AggregateMember {
    /// Derived aggregate entity id
    pub id: String,
    /// Partial aggregate fields built from the source document
    pub doc: Document,
}

/// Build members from the configured field of a source document. A scalar
/// field value is treated as a single-element collection; null elements and
/// members without a derivable id are dropped.
pub(crate) fn extract_members(
    config: &AggregateConfig,
    doc: Option<&Document>,
) -> Vec<AggregateMember> {
    let Some(doc) = doc else {
        return Vec::new();
    };

    let elements: Vec<&Value> = match doc.get(&config.field) {
        None | Some(Value::Null) => return Vec::new(),
        Some(Value::Array(items)) => items.iter().collect(),
        Some(scalar) => vec![scalar],
    };

    let mut members = Vec::new();
    for element in elements {
        if element.is_null() {
            continue;
        }

        let member = config.build_member(doc, element);
        let Some(id) = config.index_type.id_of(&member) else {
            continue;
        };

        members.push(AggregateMember { id, doc: member });
    }

    members
}

/// Classify members by id-set comparison between the new and existing sides.
///
/// Present in new only is ADD; in both is UPDATE; in existing only is REMOVE,
/// except under a partial mutation: an entirely absent new-side set means the
/// payload simply omitted the field, so existing members become UPDATE, and a
/// partial payload that does carry the field leaves its missing members
/// untouched rather than removing them.
pub(crate) fn classify_members(
    new_members: Vec<AggregateMember>,
    existing_members: Vec<AggregateMember>,
    partial: bool,
) -> Vec<(AggregateMember, OpType)> {
    let new_ids: HashSet<String> = new_members.iter().map(|m| m.id.clone()).collect();
    let existing_ids: HashSet<String> = existing_members.iter().map(|m| m.id.clone()).collect();
    let new_side_empty = new_members.is_empty();

    let mut adds = Vec::new();
    let mut removes = Vec::new();
    let mut updates = Vec::new();

    for member in new_members {
        if existing_ids.contains(&member.id) {
            updates.push(member);
        } else {
            adds.push(member);
        }
    }

    for member in existing_members {
        if new_ids.contains(&member.id) {
            continue;
        }

        if partial {
            if new_side_empty {
                updates.push(member);
            }
        } else {
            removes.push(member);
        }
    }

    adds.into_iter()
        .map(|m| (m, OpType::Add))
        .chain(removes.into_iter().map(|m| (m, OpType::Remove)))
        .chain(updates.into_iter().map(|m| (m, OpType::Update)))
        .collect()
}

/// Fold one membership event into a measure, diff style: the new value is
/// derived from the prior aggregate value plus the event's before/after
/// source fields.
///
/// Under a partial mutation a measure whose field the new source document
/// does not carry is left untouched; the payload's silence says nothing
/// about the field's value.
pub(crate) fn recompute_measure(
    measure: &Measure,
    aggregate: &mut Document,
    existing_aggregate: &Document,
    source_new: Option<&Document>,
    source_old: Option<&Document>,
    partial: bool,
    op: OpType,
) {
    let name = measure.name();

    if partial && source_new.is_some_and(|d| !d.contains_key(name)) {
        return;
    }

    let prior = num_field(existing_aggregate, name);

    let value = match measure {
        Measure::Count { .. } => match op {
            OpType::Add => prior + 1.0,
            OpType::Remove => prior - 1.0,
            OpType::Update => prior,
        },
        Measure::Sum { .. } => match op {
            OpType::Add => prior + num_field_opt(source_new, name),
            OpType::Update => {
                prior + num_field_opt(source_new, name) - num_field_opt(source_old, name)
            }
            OpType::Remove => prior - num_field_opt(source_old, name),
        },
        Measure::Average {
            count_field: companion,
            round,
            ..
        }
        | Measure::WeightedAverage {
            weight_field: companion,
            round,
            ..
        } => {
            let aggregate_companion = num_field(existing_aggregate, companion);
            let prior_total = prior * aggregate_companion;

            let new_value = num_field_opt(source_new, name);
            let new_companion = num_field_opt(source_new, companion);
            let old_value = num_field_opt(source_old, name);
            let old_companion = num_field_opt(source_old, companion);

            let (total_value, total_count) = match op {
                OpType::Add => (
                    prior_total + new_value * new_companion,
                    aggregate_companion + new_companion,
                ),
                OpType::Update => (
                    prior_total - old_value * old_companion + new_value * new_companion,
                    aggregate_companion - old_companion + new_companion,
                ),
                OpType::Remove => (
                    prior_total - old_value * old_companion,
                    aggregate_companion - old_companion,
                ),
            };

            let mean = if total_count > 0.0 {
                total_value / total_count
            } else {
                0.0
            };
            round_to(mean, *round)
        }
        Measure::Function {
            func,
            modifier,
            round,
            ..
        } => {
            let mut value = func(aggregate, op);
            if matches!(modifier, Some(Modifier::Log1p)) {
                value = value.ln_1p();
            }
            round_to(value, *round)
        }
    };

    set_num_field(aggregate, name, value);
}

/// Fold one upsert event into a measure, accumulation style: every event
/// contributes, so COUNT always increments and averages merge the incoming
/// sample into the running mean.
pub(crate) fn accumulate_measure(
    measure: &Measure,
    aggregate: &mut Document,
    existing_aggregate: &Document,
    source: &Document,
    op: OpType,
) {
    let name = measure.name();
    let prior = num_field(existing_aggregate, name);

    let value = match measure {
        Measure::Count { .. } => prior + 1.0,
        Measure::Sum { .. } => prior + num_field(source, name),
        Measure::Average {
            count_field: companion,
            round,
            ..
        }
        | Measure::WeightedAverage {
            weight_field: companion,
            round,
            ..
        } => {
            let aggregate_companion = num_field(existing_aggregate, companion);
            let total_value =
                prior * aggregate_companion + num_field(source, name) * num_field(source, companion);
            let total_count = aggregate_companion + num_field(source, companion);

            let mean = if total_count > 0.0 {
                total_value / total_count
            } else {
                0.0
            };
            round_to(mean, *round)
        }
        Measure::Function {
            func,
            modifier,
            round,
            ..
        } => {
            let mut value = func(aggregate, op);
            if matches!(modifier, Some(Modifier::Log1p)) {
                value = value.ln_1p();
            }
            round_to(value, *round)
        }
    };

    set_num_field(aggregate, name, value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::TypeConfig;
    use serde_json::json;
    use std::sync::Arc;

    fn doc(value: Value) -> Document {
        value.as_object().unwrap().clone()
    }

    fn creators_config() -> AggregateConfig {
        let author = TypeConfig::builder("authorAutocomplete", "autocomplete")
            .id(|d| d.get("key").and_then(Value::as_str).map(str::to_string))
            .build();

        AggregateConfig::new("creators", author, |_, creator| {
            let mut member = Document::new();
            member.insert("key".into(), creator.clone());
            member
        })
    }

    fn ids(classified: &[(AggregateMember, OpType)], op: OpType) -> Vec<&str> {
        classified
            .iter()
            .filter(|(_, o)| *o == op)
            .map(|(m, _)| m.id.as_str())
            .collect()
    }

    #[test]
    fn test_extract_members_coerces_scalar_and_skips_nulls() {
        let config = creators_config();

        let scalar = extract_members(&config, Some(&doc(json!({"creators": "a1"}))));
        assert_eq!(scalar.len(), 1);
        assert_eq!(scalar[0].id, "a1");

        let mixed = extract_members(&config, Some(&doc(json!({"creators": ["a1", null, "a2"]}))));
        assert_eq!(mixed.len(), 2);

        assert!(extract_members(&config, None).is_empty());
        assert!(extract_members(&config, Some(&doc(json!({"title": "t"})))).is_empty());
    }

    #[test]
    fn test_classification_diffs_member_sets() {
        let config = creators_config();
        let new = extract_members(&config, Some(&doc(json!({"creators": ["a1", "a3"]}))));
        let old = extract_members(&config, Some(&doc(json!({"creators": ["a1", "a2"]}))));

        let classified = classify_members(new, old, false);
        assert_eq!(ids(&classified, OpType::Add), vec!["a3"]);
        assert_eq!(ids(&classified, OpType::Remove), vec!["a2"]);
        assert_eq!(ids(&classified, OpType::Update), vec!["a1"]);
    }

    #[test]
    fn test_partial_with_absent_field_updates_existing_members() {
        let config = creators_config();
        let old = extract_members(&config, Some(&doc(json!({"creators": ["a1", "a2"]}))));

        let classified = classify_members(Vec::new(), old, true);
        assert!(ids(&classified, OpType::Remove).is_empty());
        assert_eq!(ids(&classified, OpType::Update), vec!["a1", "a2"]);
    }

    #[test]
    fn test_partial_with_present_field_leaves_missing_members_untouched() {
        let config = creators_config();
        let new = extract_members(&config, Some(&doc(json!({"creators": ["a1"]}))));
        let old = extract_members(&config, Some(&doc(json!({"creators": ["a1", "a2"]}))));

        let classified = classify_members(new, old, true);
        assert!(ids(&classified, OpType::Remove).is_empty());
        assert_eq!(ids(&classified, OpType::Update), vec!["a1"]);
        assert_eq!(classified.len(), 1);
    }

    #[test]
    fn test_count_and_sum_deltas() {
        let count = Measure::count("bookCount");
        let sum = Measure::sum("viewCount");
        let existing = doc(json!({"bookCount": 2, "viewCount": 30}));

        let mut aggregate = existing.clone();
        recompute_measure(&count, &mut aggregate, &existing, None, None, false, OpType::Add);
        assert_eq!(num_field(&aggregate, "bookCount"), 3.0);

        let mut aggregate = existing.clone();
        recompute_measure(&count, &mut aggregate, &existing, None, None, false, OpType::Remove);
        assert_eq!(num_field(&aggregate, "bookCount"), 1.0);

        let new_doc = doc(json!({"viewCount": 12}));
        let old_doc = doc(json!({"viewCount": 10}));
        let mut aggregate = existing.clone();
        recompute_measure(
            &sum,
            &mut aggregate,
            &existing,
            Some(&new_doc),
            Some(&old_doc),
            false,
            OpType::Update,
        );
        assert_eq!(num_field(&aggregate, "viewCount"), 32.0);
    }

    #[test]
    fn test_weighted_average_update_and_remove() {
        let rating = Measure::weighted_average("rating", "ratingCount");
        // two samples so far: (4, 2) and (3, 1) => mean 11/3
        let existing = doc(json!({"rating": 3.667, "ratingCount": 3}));

        let new_doc = doc(json!({"rating": 5, "ratingCount": 2}));
        let old_doc = doc(json!({"rating": 4, "ratingCount": 2}));
        let mut aggregate = existing.clone();
        recompute_measure(
            &rating,
            &mut aggregate,
            &existing,
            Some(&new_doc),
            Some(&old_doc),
            false,
            OpType::Update,
        );
        // (11.001 - 8 + 10) / 3 = 4.334
        assert_eq!(num_field(&aggregate, "rating"), 4.334);

        let mut aggregate = existing.clone();
        recompute_measure(
            &rating,
            &mut aggregate,
            &existing,
            None,
            Some(&old_doc),
            false,
            OpType::Remove,
        );
        // (11.001 - 8) / 1 = 3.001
        assert_eq!(num_field(&aggregate, "rating"), 3.001);
    }

    #[test]
    fn test_weighted_average_guards_empty_membership() {
        let rating = Measure::weighted_average("rating", "ratingCount");
        let existing = doc(json!({"rating": 4.0, "ratingCount": 2}));
        let old_doc = doc(json!({"rating": 4, "ratingCount": 2}));

        let mut aggregate = existing.clone();
        recompute_measure(
            &rating,
            &mut aggregate,
            &existing,
            None,
            Some(&old_doc),
            false,
            OpType::Remove,
        );
        assert_eq!(num_field(&aggregate, "rating"), 0.0);
    }

    #[test]
    fn test_partial_skips_measure_absent_from_payload() {
        let sum = Measure::sum("viewCount");
        let existing = doc(json!({"viewCount": 30}));
        let new_doc = doc(json!({"title": "renamed"}));

        let mut aggregate = existing.clone();
        recompute_measure(
            &sum,
            &mut aggregate,
            &existing,
            Some(&new_doc),
            None,
            true,
            OpType::Update,
        );
        assert_eq!(num_field(&aggregate, "viewCount"), 30.0);
    }

    #[test]
    fn test_function_measure_applies_modifier_and_rounding() {
        let score = Measure::function("score", |agg, _| num_field(agg, "downloads"));
        let existing = Document::new();

        let mut aggregate = doc(json!({"downloads": 5}));
        recompute_measure(&score, &mut aggregate, &existing, None, None, false, OpType::Add);
        assert_eq!(num_field(&aggregate, "score"), 1.792);

        let plain = Measure::function("score", |agg, _| num_field(agg, "downloads"))
            .without_modifier();
        let mut aggregate = doc(json!({"downloads": 5}));
        recompute_measure(&plain, &mut aggregate, &existing, None, None, false, OpType::Add);
        assert_eq!(num_field(&aggregate, "score"), 5.0);
    }

    #[test]
    fn test_accumulate_merges_running_mean() {
        let rating = Measure::weighted_average("rating", "ratingCount");

        let existing = Document::new();
        let mut aggregate = Document::new();
        accumulate_measure(
            &rating,
            &mut aggregate,
            &existing,
            &doc(json!({"rating": 4, "ratingCount": 2})),
            OpType::Add,
        );
        assert_eq!(num_field(&aggregate, "rating"), 4.0);

        let existing = doc(json!({"rating": 4.0, "ratingCount": 2}));
        let mut aggregate = existing.clone();
        accumulate_measure(
            &rating,
            &mut aggregate,
            &existing,
            &doc(json!({"rating": 3, "ratingCount": 1})),
            OpType::Add,
        );
        assert_eq!(num_field(&aggregate, "rating"), 3.667);
    }

    #[test]
    fn test_accumulate_count_always_increments() {
        let count = Measure::count("count");
        let existing = doc(json!({"count": 4}));
        let mut aggregate = existing.clone();
        accumulate_measure(&count, &mut aggregate, &existing, &Document::new(), OpType::Update);
        assert_eq!(num_field(&aggregate, "count"), 5.0);
    }

    // AggregateConfig holds an Arc to its index type; make sure that is the
    // same instance the diff tests assume.
    #[test]
    fn test_member_ids_use_index_type_extractor() {
        let custom = TypeConfig::builder("categoryAutocomplete", "autocomplete")
            .id(|d| {
                d.get("name")
                    .and_then(Value::as_str)
                    .map(|name| format!("cat-{name}"))
            })
            .build();

        let config = AggregateConfig::new("categories", Arc::clone(&custom), |_, value| {
            let mut member = Document::new();
            member.insert("name".into(), value.clone());
            member
        });

        let members = extract_members(&config, Some(&doc(json!({"categories": ["fiction"]}))));
        assert_eq!(members[0].id, "cat-fiction");
    }
}
