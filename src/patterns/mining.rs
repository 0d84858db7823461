use std::collections::BTreeMap;

use crate::model::patterns::{Pattern, PatternStats, Transform};

/// Candidate pairs must agree on at least this share of rhythm grid bits.
const MAX_HAMMING_RATIO: f64 = 0.15;

/// Single-linkage clustering threshold on the blended similarity.
const CLUSTER_THRESHOLD: f64 = 0.85;

const RHYTHM_WEIGHT: f64 = 0.6;
const PITCH_WEIGHT: f64 = 0.4;

/// A pattern with its current instance count, as read back from the store.
#[derive(Debug, Clone)]
pub struct MinedPattern {
    pub pattern: Pattern,
    pub instance_count: usize,
}

/// Plan for folding one near-duplicate pattern into a canonical one.
#[derive(Debug, Clone, PartialEq)]
pub struct Merge {
    pub merged_id: String,
    pub canonical_id: String,
    /// Similarity to the canonical pattern; becomes instance confidence.
    pub confidence: f64,
    /// Maps canonical onto the merged pattern's instances.
    pub transform: Transform,
}

/// Cross-corpus clustering: bucket patterns by (role, length, meter, grid),
/// single-linkage cluster near-duplicates, and elect one canonical pattern
/// per cluster. Exact duplicates never reach this point; identical
/// content already shares a pattern_id.
pub fn plan_merges(patterns: &[MinedPattern]) -> Vec<Merge> {
    let mut buckets: BTreeMap<(String, usize, String, usize), Vec<&MinedPattern>> =
        BTreeMap::new();
    for p in patterns {
        buckets
            .entry((
                p.pattern.role.as_str().to_string(),
                p.pattern.length_bars,
                p.pattern.meter.clone(),
                p.pattern.grid_resolution,
            ))
            .or_default()
            .push(p);
    }

    let mut merges = Vec::new();
    for bucket in buckets.values_mut() {
        // Sort by id for deterministic pairing and tie-breaks
        bucket.sort_by(|a, b| a.pattern.pattern_id.cmp(&b.pattern.pattern_id));
        merges.extend(cluster_bucket(bucket));
    }
    merges
}

fn cluster_bucket(bucket: &[&MinedPattern]) -> Vec<Merge> {
    let n = bucket.len();
    if n < 2 {
        return Vec::new();
    }

    let total_bits = bucket[0].pattern.length_bars * bucket[0].pattern.grid_resolution;
    let mut parent: Vec<usize> = (0..n).collect();

    for i in 0..n {
        for j in i + 1..n {
            if let Some(similarity) =
                pattern_similarity(&bucket[i].pattern, &bucket[j].pattern, total_bits)
            {
                if similarity >= CLUSTER_THRESHOLD {
                    union(&mut parent, i, j);
                }
            }
        }
    }

    // Collect clusters
    let mut clusters: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for i in 0..n {
        clusters.entry(find(&mut parent, i)).or_default().push(i);
    }

    let mut merges = Vec::new();
    for members in clusters.values() {
        if members.len() < 2 {
            continue;
        }

        // Canonical: highest instance count, ties to lowest pattern_id.
        // Members are id-sorted, so the first max wins the tie.
        let canonical = *members
            .iter()
            .max_by_key(|&&i| {
                (
                    bucket[i].instance_count,
                    std::cmp::Reverse(bucket[i].pattern.pattern_id.clone()),
                )
            })
            .unwrap_or(&members[0]);

        for &member in members {
            if member == canonical {
                continue;
            }
            let confidence =
                pattern_similarity(&bucket[canonical].pattern, &bucket[member].pattern, total_bits)
                    .unwrap_or(CLUSTER_THRESHOLD);
            let pitch_offset = median_pitch_offset(
                &bucket[canonical].pattern.stats,
                &bucket[member].pattern.stats,
            );

            merges.push(Merge {
                merged_id: bucket[member].pattern.pattern_id.clone(),
                canonical_id: bucket[canonical].pattern.pattern_id.clone(),
                confidence,
                transform: Transform {
                    pitch_offset,
                    time_scale: 1.0,
                },
            });
        }
    }
    merges
}

/// Blended similarity `0.6·rhythm + 0.4·pitch`, or None when the rhythm
/// grids differ on more than 15% of bits (not a candidate pair).
pub fn pattern_similarity(a: &Pattern, b: &Pattern, total_bits: usize) -> Option<f64> {
    let hamming = hamming_steps(&a.stats.onset_steps, &b.stats.onset_steps);
    let hamming_ratio = hamming as f64 / total_bits.max(1) as f64;
    if hamming_ratio > MAX_HAMMING_RATIO {
        return None;
    }

    let rhythm_sim = 1.0 - hamming_ratio;
    let pitch_sim = 1.0 - normalized_edit_distance(&a.stats.intervals, &b.stats.intervals);

    Some(RHYTHM_WEIGHT * rhythm_sim + PITCH_WEIGHT * pitch_sim)
}

/// Median element-wise difference between the two patterns' pitch
/// sequences, aligned by onset index; this maps the canonical onto the
/// member's instances. For a pure transposition every element agrees; with
/// substitutions the median ignores the outliers a mean would absorb.
fn median_pitch_offset(canonical: &PatternStats, member: &PatternStats) -> i32 {
    let a = pitch_sequence(canonical);
    let b = pitch_sequence(member);
    let n = a.len().min(b.len());
    if n == 0 {
        return (member.mean_pitch - canonical.mean_pitch).round() as i32;
    }

    let mut diffs: Vec<f64> = (0..n).map(|i| b[i] - a[i]).collect();
    diffs.sort_by(|x, y| x.partial_cmp(y).unwrap_or(std::cmp::Ordering::Equal));
    let median = if n % 2 == 1 {
        diffs[n / 2]
    } else {
        (diffs[n / 2 - 1] + diffs[n / 2]) / 2.0
    };
    median.round() as i32
}

/// Absolute pitch sequence recovered from a pattern's stats: intervals are
/// relative to the first onset, and the stored mean pitch anchors them.
fn pitch_sequence(stats: &PatternStats) -> Vec<f64> {
    if stats.intervals.is_empty() {
        return Vec::new();
    }
    let interval_mean =
        stats.intervals.iter().map(|&i| i as f64).sum::<f64>() / stats.intervals.len() as f64;
    let first = stats.mean_pitch - interval_mean;
    stats.intervals.iter().map(|&i| first + i as f64).collect()
}

/// Hamming distance between two onset-step sets.
fn hamming_steps(a: &[usize], b: &[usize]) -> usize {
    let set_a: std::collections::BTreeSet<usize> = a.iter().copied().collect();
    let set_b: std::collections::BTreeSet<usize> = b.iter().copied().collect();
    set_a.symmetric_difference(&set_b).count()
}

/// Levenshtein distance over interval sequences, normalized by the longer
/// length. Two empty sequences are identical.
fn normalized_edit_distance(a: &[i8], b: &[i8]) -> f64 {
    let (n, m) = (a.len(), b.len());
    if n == 0 && m == 0 {
        return 0.0;
    }
    if n == 0 || m == 0 {
        return 1.0;
    }

    let mut prev: Vec<usize> = (0..=m).collect();
    let mut curr = vec![0usize; m + 1];

    for i in 1..=n {
        curr[0] = i;
        for j in 1..=m {
            let cost = if a[i - 1] == b[j - 1] { 0 } else { 1 };
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[m] as f64 / n.max(m) as f64
}

fn find(parent: &mut Vec<usize>, i: usize) -> usize {
    if parent[i] != i {
        let root = find(parent, parent[i]);
        parent[i] = root;
    }
    parent[i]
}

fn union(parent: &mut Vec<usize>, i: usize, j: usize) {
    let ri = find(parent, i);
    let rj = find(parent, j);
    if ri != rj {
        // Lower index wins the root, for determinism
        let (lo, hi) = if ri < rj { (ri, rj) } else { (rj, ri) };
        parent[hi] = lo;
    }
}
