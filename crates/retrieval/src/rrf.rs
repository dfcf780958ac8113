use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

pub const DEFAULT_RRF_K: f64 = 60.0;

/// One system's ranked output: ordered best-first, ids stable.
#[derive(Debug, Clone)]
pub struct RankedList {
    pub system: String,
    pub items: Vec<RankedItem>,
}

#[derive(Debug, Clone)]
pub struct RankedItem {
    pub id: String,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct FusionOptions {
    pub k: f64,
    /// One weight per input list; normalized to sum 1. Uniform when the
    /// lengths disagree.
    pub weights: Vec<f64>,
    pub min_score: Option<f64>,
    pub max_results: Option<usize>,
    /// Drop items appearing in fewer than this many systems.
    pub min_consensus: Option<usize>,
    /// Min-max map fused scores onto [0, 1].
    pub normalize_scores: bool,
}

impl Default for FusionOptions {
    fn default() -> Self {
        Self {
            k: DEFAULT_RRF_K,
            weights: Vec::new(),
            min_score: None,
            max_results: None,
            min_consensus: None,
            normalize_scores: false,
        }
    }
}

/// An item's appearance in one source system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemContribution {
    pub system: String,
    /// The system's own score for the item.
    pub score: f64,
    /// 1-based rank within that system.
    pub rank: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusedItem {
    pub id: String,
    pub score: f64,
    pub per_system: Vec<SystemContribution>,
    pub systems_count: usize,
    /// 1-based position in the fused output.
    pub fusion_rank: usize,
}

fn normalized_weights(count: usize, weights: &[f64]) -> Vec<f64> {
    let weights = if weights.len() == count && weights.iter().all(|w| *w >= 0.0) {
        weights.to_vec()
    } else {
        vec![1.0; count]
    };
    let sum: f64 = weights.iter().sum();
    if sum <= 0.0 {
        vec![1.0 / count as f64; count]
    } else {
        weights.into_iter().map(|w| w / sum).collect()
    }
}

/// Weighted Reciprocal Rank Fusion:
/// `RRF(item) = Σ_i w_i · 1 / (k + rank_i(item) + 1)` with 0-based ranks.
/// Items absent from a system contribute nothing for it. Output is sorted
/// by fused score descending, ties broken by id for determinism.
pub fn fuse(lists: &[RankedList], options: &FusionOptions) -> Vec<FusedItem> {
    if lists.is_empty() {
        return Vec::new();
    }
    let weights = normalized_weights(lists.len(), &options.weights);

    let mut fused: HashMap<String, FusedItem> = HashMap::new();
    for (list, weight) in lists.iter().zip(weights) {
        for (rank, item) in list.items.iter().enumerate() {
            let contribution = weight / (options.k + rank as f64 + 1.0);
            let entry = fused.entry(item.id.clone()).or_insert_with(|| FusedItem {
                id: item.id.clone(),
                score: 0.0,
                per_system: Vec::new(),
                systems_count: 0,
                fusion_rank: 0,
            });
            entry.score += contribution;
            entry.per_system.push(SystemContribution {
                system: list.system.clone(),
                score: item.score,
                rank: rank + 1,
            });
            entry.systems_count += 1;
        }
    }

    let mut items: Vec<FusedItem> = fused.into_values().collect();
    if let Some(min_consensus) = options.min_consensus {
        items.retain(|item| item.systems_count >= min_consensus);
    }

    items.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });

    if options.normalize_scores && !items.is_empty() {
        let max = items.first().map(|i| i.score).unwrap_or(0.0);
        let min = items.last().map(|i| i.score).unwrap_or(0.0);
        let range = max - min;
        for item in &mut items {
            item.score = if range > f64::EPSILON {
                (item.score - min) / range
            } else {
                1.0
            };
        }
    }

    if let Some(min_score) = options.min_score {
        items.retain(|item| item.score >= min_score);
    }
    if let Some(max_results) = options.max_results {
        items.truncate(max_results);
    }

    for (index, item) in items.iter_mut().enumerate() {
        item.fusion_rank = index + 1;
    }
    items
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusAnalysis {
    /// (system A, system B, Jaccard overlap of their top-K id sets).
    pub pairwise_jaccard: Vec<(String, String, f64)>,
    /// Ids appearing in at least ⌈0.7·N⌉ systems.
    pub consensus_items: Vec<String>,
}

pub fn consensus_analysis(lists: &[RankedList], top_k: usize) -> ConsensusAnalysis {
    let tops: Vec<(String, HashSet<&str>)> = lists
        .iter()
        .map(|list| {
            let ids: HashSet<&str> = list
                .items
                .iter()
                .take(top_k)
                .map(|i| i.id.as_str())
                .collect();
            (list.system.clone(), ids)
        })
        .collect();

    let mut pairwise_jaccard = Vec::new();
    for i in 0..tops.len() {
        for j in (i + 1)..tops.len() {
            let intersection = tops[i].1.intersection(&tops[j].1).count();
            let union = tops[i].1.union(&tops[j].1).count();
            let jaccard = if union == 0 {
                0.0
            } else {
                intersection as f64 / union as f64
            };
            pairwise_jaccard.push((tops[i].0.clone(), tops[j].0.clone(), jaccard));
        }
    }

    let threshold = ((0.7 * lists.len() as f64).ceil() as usize).max(1);
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for (_, ids) in &tops {
        for id in ids {
            *counts.entry(id).or_insert(0) += 1;
        }
    }
    let mut consensus_items: Vec<String> = counts
        .into_iter()
        .filter(|(_, count)| *count >= threshold)
        .map(|(id, _)| id.to_string())
        .collect();
    consensus_items.sort();

    ConsensusAnalysis {
        pairwise_jaccard,
        consensus_items,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(system: &str, ids: &[&str]) -> RankedList {
        RankedList {
            system: system.to_string(),
            items: ids
                .iter()
                .enumerate()
                .map(|(i, id)| RankedItem {
                    id: id.to_string(),
                    score: 1.0 - i as f64 * 0.1,
                })
                .collect(),
        }
    }

    #[test]
    fn closed_form_matches_default_weights() {
        let lists = vec![list("vector", &["x", "y"]), list("fts", &["y", "z"])];
        let fused = fuse(&lists, &FusionOptions::default());

        let y = fused.iter().find(|i| i.id == "y").unwrap();
        let expected = 0.5 * (1.0 / 62.0) + 0.5 * (1.0 / 61.0);
        assert!((y.score - expected).abs() < 1e-12);
        assert_eq!(y.systems_count, 2);
        assert_eq!(y.fusion_rank, 1);

        let x = fused.iter().find(|i| i.id == "x").unwrap();
        assert!((x.score - 0.5 / 61.0).abs() < 1e-12);
    }

    #[test]
    fn absent_items_have_no_entry() {
        let lists = vec![list("a", &["p"]), list("b", &["q"])];
        let fused = fuse(&lists, &FusionOptions::default());
        assert!(fused.iter().all(|i| i.id == "p" || i.id == "q"));
        assert_eq!(fused.len(), 2);
    }

    #[test]
    fn weights_bias_the_fusion() {
        let lists = vec![list("vector", &["v"]), list("fts", &["f"])];
        let options = FusionOptions {
            weights: vec![0.9, 0.1],
            ..FusionOptions::default()
        };
        let fused = fuse(&lists, &options);
        assert_eq!(fused[0].id, "v");
        assert!(fused[0].score > fused[1].score * 5.0);
    }

    #[test]
    fn per_system_breakdown_has_one_based_ranks() {
        let lists = vec![list("vector", &["a", "b", "c"])];
        let fused = fuse(&lists, &FusionOptions::default());
        let c = fused.iter().find(|i| i.id == "c").unwrap();
        assert_eq!(c.per_system.len(), 1);
        assert_eq!(c.per_system[0].rank, 3);
        assert_eq!(c.per_system[0].system, "vector");
    }

    #[test]
    fn min_consensus_drops_singletons() {
        let lists = vec![
            list("a", &["shared", "only-a"]),
            list("b", &["shared", "only-b"]),
        ];
        let options = FusionOptions {
            min_consensus: Some(2),
            ..FusionOptions::default()
        };
        let fused = fuse(&lists, &options);
        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].id, "shared");
    }

    #[test]
    fn normalization_maps_to_unit_interval() {
        let lists = vec![list("a", &["1", "2", "3"]), list("b", &["1", "3", "2"])];
        let options = FusionOptions {
            normalize_scores: true,
            ..FusionOptions::default()
        };
        let fused = fuse(&lists, &options);
        assert!((fused.first().unwrap().score - 1.0).abs() < 1e-12);
        assert!((fused.last().unwrap().score - 0.0).abs() < 1e-12);
    }

    #[test]
    fn max_results_truncates_after_ranking() {
        let lists = vec![list("a", &["1", "2", "3", "4", "5"])];
        let options = FusionOptions {
            max_results: Some(2),
            ..FusionOptions::default()
        };
        let fused = fuse(&lists, &options);
        assert_eq!(fused.len(), 2);
        assert_eq!(fused[0].fusion_rank, 1);
        assert_eq!(fused[1].fusion_rank, 2);
    }

    #[test]
    fn identical_inputs_fuse_deterministically() {
        let lists = vec![list("a", &["x", "y", "z"]), list("b", &["z", "y", "x"])];
        let first = fuse(&lists, &FusionOptions::default());
        let second = fuse(&lists, &FusionOptions::default());
        let ids_first: Vec<&str> = first.iter().map(|i| i.id.as_str()).collect();
        let ids_second: Vec<&str> = second.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids_first, ids_second);
    }

    #[test]
    fn consensus_analysis_jaccard_and_threshold() {
        let lists = vec![
            list("a", &["x", "y"]),
            list("b", &["x", "z"]),
            list("c", &["x", "y"]),
        ];
        let analysis = consensus_analysis(&lists, 2);
        assert_eq!(analysis.pairwise_jaccard.len(), 3);

        let ab = analysis
            .pairwise_jaccard
            .iter()
            .find(|(a, b, _)| a == "a" && b == "b")
            .unwrap();
        assert!((ab.2 - 1.0 / 3.0).abs() < 1e-12);

        // ⌈0.7·3⌉ = 3 systems required: only x appears in all three.
        assert_eq!(analysis.consensus_items, vec!["x".to_string()]);
    }
}
