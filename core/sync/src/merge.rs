//! Stroke-level merge of overlapping annotation layers.
//!
//! Concurrent devices can transiently create several layers for the same
//! (file, member, page) triple. The merge collapses them without losing a
//! single stroke: stroke identity is a global UUID, so the union of strokes
//! deduplicated by id is well-defined regardless of how many times or in
//! what order layers are discovered.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tracing::debug;

use ensemble_common::model::{Annotation, AnnotationStroke};
use ensemble_common::{Error, Result};

/// Result of merging a set of layers for one (file, member, page) triple.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    /// The surviving primary layer carrying every unique stroke.
    pub merged: Annotation,
    /// Ids of the non-primary layers to delete locally and remotely.
    pub deleted_layer_ids: Vec<String>,
}

/// Merges duplicate annotation layers. Commutative and idempotent over the
/// layer set.
#[derive(Debug, Default, Clone)]
pub struct AnnotationMergeEngine;

impl AnnotationMergeEngine {
    pub fn new() -> Self {
        Self
    }

    /// Merge all layers sharing one (file, member, page) triple.
    ///
    /// The oldest layer keeps its identity so external references to its id
    /// stay valid; every unique stroke moves onto it, ordered by
    /// (created_at, id) so the result is independent of discovery order.
    ///
    /// # Errors
    /// - `InvalidInput` if `layers` is empty or the layers span more than
    ///   one (file, member, page) triple.
    pub fn merge(&self, layers: Vec<Annotation>) -> Result<MergeOutcome> {
        self.merge_at(layers, Utc::now())
    }

    /// `merge` with an explicit wall-clock for the primary's `updated_at`.
    pub fn merge_at(&self, layers: Vec<Annotation>, now: DateTime<Utc>) -> Result<MergeOutcome> {
        let first = layers
            .first()
            .ok_or_else(|| Error::InvalidInput("cannot merge zero layers".to_string()))?;
        let key = first.layer_key();
        if let Some(stray) = layers.iter().find(|l| l.layer_key() != key) {
            return Err(Error::InvalidInput(format!(
                "layer {} belongs to a different (file, member, page) triple",
                stray.id
            )));
        }

        // Oldest layer wins identity; id tie-break keeps the choice
        // deterministic when clocks collide.
        let primary_id = layers
            .iter()
            .min_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.id.cmp(&b.id))
            })
            .map(|l| l.id.clone())
            .unwrap();

        let mut seen: HashSet<String> = HashSet::new();
        let mut strokes: Vec<AnnotationStroke> = Vec::new();
        for layer in &layers {
            for stroke in &layer.strokes {
                if seen.insert(stroke.id.clone()) {
                    strokes.push(stroke.clone());
                }
            }
        }
        strokes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let deleted_layer_ids: Vec<String> = layers
            .iter()
            .filter(|l| l.id != primary_id)
            .map(|l| l.id.clone())
            .collect();

        let mut merged = layers
            .into_iter()
            .find(|l| l.id == primary_id)
            .unwrap();
        merged.strokes = strokes;
        merged.updated_at = now.timestamp_millis();

        debug!(
            primary = %merged.id,
            strokes = merged.strokes.len(),
            dropped_layers = deleted_layer_ids.len(),
            "Merged annotation layers"
        );

        Ok(MergeOutcome {
            merged,
            deleted_layer_ids,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ensemble_common::model::{AnnotationPoint, StrokeTool};
    use proptest::prelude::*;

    fn stroke(id: &str, created_at: i64) -> AnnotationStroke {
        AnnotationStroke {
            id: id.into(),
            tool: StrokeTool::Pen,
            color: "#FF0000".into(),
            stroke_width: 2.0,
            opacity: 1.0,
            text: None,
            created_at,
            points: vec![AnnotationPoint {
                x: 0.1,
                y: 0.2,
                pressure: 0.5,
                timestamp: created_at,
            }],
        }
    }

    fn layer(id: &str, created_at: i64, strokes: Vec<AnnotationStroke>) -> Annotation {
        Annotation {
            id: id.into(),
            file_id: "f1".into(),
            member_id: "m1".into(),
            page_number: 0,
            created_at,
            updated_at: created_at,
            strokes,
        }
    }

    #[test]
    fn test_oldest_layer_survives_with_all_strokes() {
        let a = layer("a", 4000, vec![stroke("s1", 1), stroke("s2", 2), stroke("s3", 3)]);
        let b = layer("b", 4050, vec![stroke("s4", 4), stroke("s5", 5)]);

        let engine = AnnotationMergeEngine::new();
        let outcome = engine.merge(vec![a, b]).unwrap();

        assert_eq!(outcome.merged.id, "a");
        assert_eq!(outcome.merged.strokes.len(), 5);
        assert_eq!(outcome.deleted_layer_ids, vec!["b".to_string()]);
    }

    #[test]
    fn test_redundant_strokes_do_not_double() {
        let a = layer("a", 100, vec![stroke("s1", 1), stroke("s2", 2)]);
        let b = layer("b", 200, vec![stroke("s1", 1), stroke("s3", 3)]);

        let outcome = AnnotationMergeEngine::new().merge(vec![a, b]).unwrap();
        let ids: Vec<&str> = outcome.merged.strokes.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["s1", "s2", "s3"]);
    }

    #[test]
    fn test_merge_commutes() {
        let a = layer("a", 100, vec![stroke("s1", 5), stroke("s2", 1)]);
        let b = layer("b", 200, vec![stroke("s3", 3)]);
        let now = Utc::now();

        let engine = AnnotationMergeEngine::new();
        let ab = engine.merge_at(vec![a.clone(), b.clone()], now).unwrap();
        let ba = engine.merge_at(vec![b, a], now).unwrap();

        assert_eq!(ab.merged, ba.merged);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let a = layer("a", 100, vec![stroke("s1", 1)]);
        let b = layer("b", 200, vec![stroke("s2", 2)]);
        let now = Utc::now();

        let engine = AnnotationMergeEngine::new();
        let once = engine.merge_at(vec![a, b], now).unwrap();
        let twice = engine.merge_at(vec![once.merged.clone()], now).unwrap();

        assert_eq!(once.merged, twice.merged);
        assert!(twice.deleted_layer_ids.is_empty());
    }

    #[test]
    fn test_created_at_tie_breaks_on_id() {
        let a = layer("zz", 100, vec![]);
        let b = layer("aa", 100, vec![]);
        let outcome = AnnotationMergeEngine::new().merge(vec![a, b]).unwrap();
        assert_eq!(outcome.merged.id, "aa");
    }

    #[test]
    fn test_mismatched_layers_rejected() {
        let a = layer("a", 100, vec![]);
        let mut b = layer("b", 200, vec![]);
        b.page_number = 7;
        assert!(AnnotationMergeEngine::new().merge(vec![a, b]).is_err());
    }

    #[test]
    fn test_empty_input_rejected() {
        assert!(AnnotationMergeEngine::new().merge(vec![]).is_err());
    }

    prop_compose! {
        // Stroke ids are globally unique in the data model, so equal ids
        // must mean equal strokes here too.
        fn arb_stroke()(id in 0u32..8, created_at in 0i64..100) -> AnnotationStroke {
            stroke(&format!("stroke-{}-{}", id, created_at), created_at)
        }
    }

    fn arb_layers() -> impl Strategy<Value = Vec<Annotation>> {
        prop::collection::vec(
            (0i64..1000, prop::collection::vec(arb_stroke(), 0..6)),
            1..5,
        )
        .prop_map(|raw| {
            raw.into_iter()
                .enumerate()
                .map(|(i, (created_at, strokes))| {
                    layer(&format!("layer-{}", i), created_at, strokes)
                })
                .collect()
        })
    }

    proptest! {
        #[test]
        fn prop_merge_order_independent(layers in arb_layers(), seed in 0usize..24) {
            let engine = AnnotationMergeEngine::new();
            let now = Utc::now();

            let mut shuffled = layers.clone();
            // Cheap deterministic permutation driven by the seed.
            if shuffled.len() > 1 {
                let n = shuffled.len();
                shuffled.rotate_left(seed % n);
                if seed % 2 == 1 {
                    shuffled.reverse();
                }
            }

            let a = engine.merge_at(layers, now).unwrap();
            let b = engine.merge_at(shuffled, now).unwrap();
            prop_assert_eq!(a.merged, b.merged);
        }

        #[test]
        fn prop_merge_idempotent(layers in arb_layers()) {
            let engine = AnnotationMergeEngine::new();
            let now = Utc::now();

            let once = engine.merge_at(layers, now).unwrap();
            let twice = engine.merge_at(vec![once.merged.clone()], now).unwrap();
            prop_assert_eq!(once.merged, twice.merged);
            prop_assert!(twice.deleted_layer_ids.is_empty());
        }

        #[test]
        fn prop_no_stroke_loss(layers in arb_layers()) {
            let engine = AnnotationMergeEngine::new();
            let expected: std::collections::HashSet<String> = layers
                .iter()
                .flat_map(|l| l.strokes.iter().map(|s| s.id.clone()))
                .collect();

            let outcome = engine.merge(layers).unwrap();
            let actual: std::collections::HashSet<String> = outcome
                .merged
                .strokes
                .iter()
                .map(|s| s.id.clone())
                .collect();
            prop_assert_eq!(expected, actual);
            // Dedup means no repeated ids either.
            prop_assert_eq!(
                outcome.merged.strokes.len(),
                actual_len(&outcome.merged)
            );
        }
    }

    fn actual_len(a: &Annotation) -> usize {
        a.strokes
            .iter()
            .map(|s| s.id.clone())
            .collect::<std::collections::HashSet<_>>()
            .len()
    }
}
