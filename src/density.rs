//! Density-peak clustering
//!
//! Per (channel, polarity) group: a condensed pairwise distance store, a
//! subsampled-neighbor density estimate that can be extended incrementally
//! as later passes contribute more spikes, center nomination from the
//! rho/delta joint statistic, density-ascent label assignment, a single
//! merging sweep over too-similar clusters, and pruning of undersized ones.
//!
//! All label numbering and merge ordering is a pure function of the sorted
//! distance structure; ties break toward the lowest original index.

use rayon::prelude::*;

use crate::params::MergingMethod;

/// Condensed upper-triangular pairwise distances over one group.
#[derive(Debug, Clone)]
pub struct DistanceStore {
    n: usize,
    d: Vec<f32>,
}

impl DistanceStore {
    pub fn from_points(points: &[Vec<f32>]) -> Self {
        let n = points.len();
        let d: Vec<f32> = (0..n)
            .into_par_iter()
            .flat_map_iter(|i| {
                let pi = &points[i];
                (i + 1..n).map(move |j| euclidean(pi, &points[j]))
            })
            .collect();
        Self { n, d }
    }

    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    #[inline]
    fn index(&self, i: usize, j: usize) -> usize {
        debug_assert!(i < j);
        i * self.n - i * (i + 1) / 2 + (j - i - 1)
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize) -> f32 {
        match i.cmp(&j) {
            std::cmp::Ordering::Less => self.d[self.index(i, j)],
            std::cmp::Ordering::Greater => self.d[self.index(j, i)],
            std::cmp::Ordering::Equal => 0.0,
        }
    }

    pub fn max(&self) -> f32 {
        self.d.iter().cloned().fold(0.0, f32::max)
    }
}

pub fn euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// Subsampled-neighbor density estimate, extended across passes.
///
/// `rho` here is the mean distance to the retained nearest neighbors, so
/// *smaller means denser*; the clustering step flips it.
#[derive(Debug, Clone)]
pub struct DensityState {
    /// Sorted nearest-neighbor distances retained per point
    shortlists: Vec<Vec<f32>>,
    pub rho: Vec<f32>,
    nb_selec: usize,
}

impl DensityState {
    pub fn empty() -> Self {
        Self { shortlists: Vec::new(), rho: Vec::new(), nb_selec: 0 }
    }

    pub fn len(&self) -> usize {
        self.rho.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rho.is_empty()
    }
}

/// Number of neighbors contributing to the density of a group of `n` points.
fn nb_selec(n: usize, m_ratio: f32) -> usize {
    ((m_ratio * n as f32) as usize).max(5)
}

/// Initial density estimate over the collection-pass points.
pub fn compute_rho(dist: &DistanceStore, m_ratio: f32) -> DensityState {
    let n = dist.len();
    let k = nb_selec(n, m_ratio);
    let shortlists: Vec<Vec<f32>> = (0..n)
        .into_par_iter()
        .map(|i| {
            let mut row: Vec<f32> = (0..n).filter(|&j| j != i).map(|j| dist.get(i, j)).collect();
            row.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            row.truncate(k);
            row
        })
        .collect();
    let rho = shortlists.iter().map(|s| mean(s)).collect();
    DensityState { shortlists, rho, nb_selec: k }
}

/// Extend the density estimate with the distances to newly collected points.
///
/// The clustered point set never changes; refinement passes only sharpen
/// each point's nearest-neighbor shortlist.
pub fn update_rho(state: &mut DensityState, points: &[Vec<f32>], fresh: &[Vec<f32>]) {
    if fresh.is_empty() || state.is_empty() {
        return;
    }
    debug_assert_eq!(points.len(), state.len());
    let k = state.nb_selec;
    state
        .shortlists
        .par_iter_mut()
        .zip(points.par_iter())
        .for_each(|(shortlist, p)| {
            shortlist.extend(fresh.iter().map(|q| euclidean(p, q)));
            shortlist.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            shortlist.truncate(k);
        });
    for (r, s) in state.rho.iter_mut().zip(&state.shortlists) {
        *r = mean(s);
    }
}

fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f32>() / values.len() as f32
}

fn median_of(mut values: Vec<f32>) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        0.5 * (values[mid - 1] + values[mid])
    } else {
        values[mid]
    }
}

/// Raw median absolute deviation (no Gaussian rescaling).
fn raw_mad(values: &[f32]) -> f32 {
    let center = median_of(values.to_vec());
    median_of(values.iter().map(|v| (v - center).abs()).collect())
}

/// `i` is denser than `j` under the flipped densities, ties toward the
/// lower index.
#[inline]
fn denser(rho: &[f32], i: usize, j: usize) -> bool {
    rho[i] > rho[j] || (rho[i] == rho[j] && i < j)
}

/// Distance to the nearest strictly-denser point and its index.
///
/// The globally densest point takes the maximum pairwise distance and has
/// no denser neighbor.
pub fn deltas_and_neighbors(dist: &DistanceStore, rho: &[f32]) -> (Vec<f32>, Vec<Option<usize>>) {
    let n = rho.len();
    let global_max = dist.max();
    let mut delta = vec![0.0f32; n];
    let mut nneigh = vec![None; n];
    for i in 0..n {
        let mut best = f32::MAX;
        let mut best_j = None;
        for j in 0..n {
            // Ascending scan: on equal distances the lower index wins.
            if j != i && denser(rho, j, i) {
                let d = dist.get(i, j);
                if d < best {
                    best = d;
                    best_j = Some(j);
                }
            }
        }
        if best_j.is_some() {
            delta[i] = best;
            nneigh[i] = best_j;
        } else {
            delta[i] = global_max;
        }
    }
    (delta, nneigh)
}

/// Nominate cluster centers: points whose delta lies more than
/// `alpha * MAD` above a least-squares fit of delta against rho.
pub fn nominate_centers(rho: &[f32], delta: &[f32], alpha: f32) -> Vec<usize> {
    let n = rho.len();
    if n < 2 {
        return Vec::new();
    }
    let rho_min = rho.iter().cloned().fold(f32::MAX, f32::min);
    let rho_max = rho.iter().cloned().fold(f32::MIN, f32::max);
    if rho_min == rho_max {
        return Vec::new();
    }

    let mx = mean(rho);
    let my = mean(delta);
    let mut sxx = 0.0f32;
    let mut sxy = 0.0f32;
    for (&x, &y) in rho.iter().zip(delta) {
        sxx += (x - mx) * (x - mx);
        sxy += (x - mx) * (y - my);
    }
    let slope = if sxx > 0.0 { sxy / sxx } else { 0.0 };
    let intercept = my - slope * mx;

    let residuals: Vec<f32> = rho
        .iter()
        .zip(delta)
        .map(|(&x, &y)| y - (intercept + slope * x))
        .collect();
    let spread = raw_mad(&residuals);
    residuals
        .iter()
        .enumerate()
        .filter_map(|(i, &r)| (r - alpha * spread >= 0.0).then_some(i))
        .collect()
}

/// Density-ascent assignment: every point inherits the label of its nearest
/// denser neighbor, centers seed their own labels. Chains that never reach
/// a center stay at -1.
pub fn assign_labels(rho: &[f32], nneigh: &[Option<usize>], centers: &[usize]) -> Vec<i32> {
    let n = rho.len();
    let mut labels = vec![-1i32; n];
    for (k, &c) in centers.iter().enumerate() {
        labels[c] = k as i32;
    }
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| {
        rho[b]
            .partial_cmp(&rho[a])
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.cmp(&b))
    });
    for &i in &order {
        if labels[i] == -1 {
            if let Some(j) = nneigh[i] {
                labels[i] = labels[j];
            }
        }
    }
    labels
}

/// One merging sweep over too-similar cluster pairs.
///
/// Pair metrics are computed once on the pre-merge clusters; qualifying
/// pairs are folded together in ascending metric order (ties toward the
/// lowest pair), the surviving label being the smaller one. Returns the
/// number of merges applied.
pub fn merge_clusters(
    labels: &mut [i32],
    points: &[Vec<f32>],
    method: MergingMethod,
    param: f32,
) -> usize {
    let mut ids: Vec<i32> = labels.iter().cloned().filter(|&l| l >= 0).collect();
    ids.sort_unstable();
    ids.dedup();
    if ids.len() < 2 {
        return 0;
    }
    let dim = points.first().map_or(0, |p| p.len());

    // Per-cluster medians, the projection axes of every pair test.
    let medians: Vec<Vec<f32>> = ids
        .iter()
        .map(|&id| {
            let members: Vec<&Vec<f32>> = labels
                .iter()
                .zip(points)
                .filter_map(|(&l, p)| (l == id).then_some(p))
                .collect();
            (0..dim)
                .map(|d| median_of(members.iter().map(|p| p[d]).collect()))
                .collect()
        })
        .collect();

    let mut candidates: Vec<(f32, usize, usize)> = Vec::new();
    for a in 0..ids.len() {
        for b in a + 1..ids.len() {
            let axis: Vec<f32> = medians[a]
                .iter()
                .zip(&medians[b])
                .map(|(x, y)| x - y)
                .collect();
            let axis_norm = axis.iter().map(|v| v * v).sum::<f32>().sqrt();
            let pr_a = project_members(labels, points, ids[a], &axis);
            let pr_b = project_members(labels, points, ids[b], &axis);

            let metric = match method {
                MergingMethod::Distance => {
                    // Median separation in units of the combined spread of
                    // the two projections.
                    let spread = raw_mad(&pr_a).powi(2) + raw_mad(&pr_b).powi(2);
                    if axis_norm == 0.0 {
                        0.0
                    } else if spread <= f32::EPSILON {
                        f32::MAX
                    } else {
                        axis_norm * axis_norm / spread.sqrt()
                    }
                }
                MergingMethod::Bhattacharyya => bhattacharyya(&pr_a, &pr_b),
            };
            if metric < param {
                candidates.push((metric, a, b));
            }
        }
    }

    candidates.sort_by(|x, y| {
        x.0.partial_cmp(&y.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(x.1.cmp(&y.1))
            .then(x.2.cmp(&y.2))
    });

    // Union-find over cluster indices, folding into the smaller root.
    let mut parent: Vec<usize> = (0..ids.len()).collect();
    fn find(parent: &mut Vec<usize>, mut x: usize) -> usize {
        while parent[x] != x {
            parent[x] = parent[parent[x]];
            x = parent[x];
        }
        x
    }
    let mut merges = 0;
    for (_, a, b) in candidates {
        let ra = find(&mut parent, a);
        let rb = find(&mut parent, b);
        if ra != rb {
            let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
            parent[hi] = lo;
            merges += 1;
        }
    }
    if merges > 0 {
        let remap: Vec<i32> = (0..ids.len()).map(|k| ids[find(&mut parent, k)]).collect();
        for l in labels.iter_mut() {
            if *l >= 0 {
                let pos = ids.binary_search(l).unwrap();
                *l = remap[pos];
            }
        }
    }
    merges
}

fn project_members(labels: &[i32], points: &[Vec<f32>], id: i32, axis: &[f32]) -> Vec<f32> {
    labels
        .iter()
        .zip(points)
        .filter_map(|(&l, p)| {
            (l == id).then(|| p.iter().zip(axis).map(|(x, a)| x * a).sum::<f32>())
        })
        .collect()
}

/// Gaussian Bhattacharyya distance of two 1-D samples.
fn bhattacharyya(a: &[f32], b: &[f32]) -> f32 {
    let (ma, va) = moments(a);
    let (mb, vb) = moments(b);
    let va = va.max(f32::EPSILON);
    let vb = vb.max(f32::EPSILON);
    0.25 * libm::logf(0.25 * (va / vb + vb / va + 2.0)) + 0.25 * (ma - mb).powi(2) / (va + vb)
}

fn moments(values: &[f32]) -> (f32, f32) {
    let m = mean(values);
    if values.len() < 2 {
        return (m, 0.0);
    }
    let var =
        values.iter().map(|v| (v - m) * (v - m)).sum::<f32>() / (values.len() - 1) as f32;
    (m, var)
}

/// Relabel clusters smaller than `n_min` to -1. Surviving labels keep their
/// values, so the ordering stays monotonic with sparse gaps.
pub fn prune_small(labels: &mut [i32], n_min: usize) -> usize {
    let max_label = labels.iter().cloned().max().unwrap_or(-1);
    if max_label < 0 {
        return 0;
    }
    let mut counts = vec![0usize; (max_label + 1) as usize];
    for &l in labels.iter() {
        if l >= 0 {
            counts[l as usize] += 1;
        }
    }
    let mut pruned = 0;
    for (id, &count) in counts.iter().enumerate() {
        if count > 0 && count < n_min {
            for l in labels.iter_mut() {
                if *l == id as i32 {
                    *l = -1;
                }
            }
            pruned += 1;
        }
    }
    pruned
}

/// Result of the pass-final clustering of one group.
#[derive(Debug, Clone)]
pub struct ClusterOutcome {
    pub labels: Vec<i32>,
    pub rho: Vec<f32>,
    pub delta: Vec<f32>,
    pub centers: Vec<usize>,
    pub merges: usize,
    pub pruned: usize,
}

impl ClusterOutcome {
    pub fn empty() -> Self {
        Self::unassigned(0)
    }

    /// All points unassigned; keeps index alignment for degenerate groups.
    pub fn unassigned(n: usize) -> Self {
        Self {
            labels: vec![-1; n],
            rho: vec![0.0; n],
            delta: vec![0.0; n],
            centers: Vec::new(),
            merges: 0,
            pruned: 0,
        }
    }

    /// Surviving labels in ascending order.
    pub fn surviving_labels(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = self.labels.iter().cloned().filter(|&l| l >= 0).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    pub fn n_clusters(&self) -> usize {
        self.surviving_labels().len()
    }
}

/// Full clustering of one (channel, polarity) group.
///
/// `rho_raw` is the mean-nearest-distance estimate (smaller = denser); it
/// is flipped here so the density-peak statistics see larger = denser.
pub fn cluster_group(
    rho_raw: &[f32],
    dist: &DistanceStore,
    points: &[Vec<f32>],
    n_min: usize,
    alpha: f32,
    method: MergingMethod,
    merging_param: f32,
) -> ClusterOutcome {
    let n = rho_raw.len();
    if n < 2 {
        return ClusterOutcome::unassigned(n);
    }
    let rho_max = rho_raw.iter().cloned().fold(f32::MIN, f32::max);
    let rho: Vec<f32> = rho_raw.iter().map(|&r| rho_max - r).collect();

    let (delta, nneigh) = deltas_and_neighbors(dist, &rho);
    let centers = nominate_centers(&rho, &delta, alpha);
    let mut labels = assign_labels(&rho, &nneigh, &centers);
    let merges = merge_clusters(&mut labels, points, method, merging_param);
    let pruned = prune_small(&mut labels, n_min);

    ClusterOutcome { labels, rho, delta, centers, merges, pruned }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Cheap deterministic jitter in [0, 1).
    fn lcg(state: &mut u32) -> f32 {
        *state = state.wrapping_mul(1103515245).wrapping_add(12345);
        (*state >> 8) as f32 / (1u32 << 24) as f32
    }

    /// Two tight 2-D blobs around (0,0) and (10,10), even indices on the
    /// first blob, odd on the second.
    fn two_blobs(per_side: usize) -> Vec<Vec<f32>> {
        let mut rng = 42u32;
        let mut points = Vec::new();
        for _ in 0..per_side {
            points.push(vec![lcg(&mut rng) * 0.5, lcg(&mut rng) * 0.5]);
            points.push(vec![10.0 + lcg(&mut rng) * 0.5, 10.0 + lcg(&mut rng) * 0.5]);
        }
        points
    }

    #[test]
    fn test_distance_store_symmetry() {
        let points = vec![vec![0.0, 0.0], vec![3.0, 4.0], vec![6.0, 8.0]];
        let dist = DistanceStore::from_points(&points);
        assert_eq!(dist.get(0, 1), 5.0);
        assert_eq!(dist.get(1, 0), 5.0);
        assert_eq!(dist.get(0, 0), 0.0);
        assert_eq!(dist.get(0, 2), 10.0);
        assert_eq!(dist.max(), 10.0);
    }

    #[test]
    fn test_rho_denser_points_have_smaller_mean_distance() {
        let mut points = two_blobs(20);
        points.push(vec![50.0, 50.0]); // far outlier
        let dist = DistanceStore::from_points(&points);
        let state = compute_rho(&dist, 0.1);
        let outlier = state.rho[points.len() - 1];
        let inlier = state.rho[0];
        assert!(outlier > inlier);
    }

    #[test]
    fn test_update_rho_only_sharpens() {
        let points = two_blobs(10);
        let dist = DistanceStore::from_points(&points);
        let mut state = compute_rho(&dist, 0.2);
        let before = state.rho.clone();
        // New points right on top of the first blob bring its neighbors closer.
        let fresh = vec![vec![0.0, 0.0]; 10];
        update_rho(&mut state, &points, &fresh);
        assert_eq!(state.len(), before.len());
        for (b, a) in before.iter().zip(&state.rho) {
            assert!(a <= b, "density estimate got worse: {a} > {b}");
        }
    }

    #[test]
    fn test_every_point_gets_exactly_one_label() {
        let points = two_blobs(30);
        let dist = DistanceStore::from_points(&points);
        let state = compute_rho(&dist, 0.05);
        let outcome = cluster_group(
            &state.rho,
            &dist,
            &points,
            5,
            3.0,
            MergingMethod::Distance,
            3.0,
        );
        assert_eq!(outcome.labels.len(), points.len());
        // Labels are -1 or a surviving cluster id.
        let surviving = outcome.surviving_labels();
        for &l in &outcome.labels {
            assert!(l == -1 || surviving.contains(&l));
        }
    }

    #[test]
    fn test_two_blobs_become_two_clusters() {
        let points = two_blobs(40);
        let dist = DistanceStore::from_points(&points);
        let state = compute_rho(&dist, 0.05);
        let outcome = cluster_group(
            &state.rho,
            &dist,
            &points,
            5,
            3.0,
            MergingMethod::Distance,
            3.0,
        );
        assert_eq!(outcome.n_clusters(), 2, "labels: {:?}", outcome.labels);
        // Points of the same blob share a label.
        let first = outcome.labels[0];
        let second = outcome.labels[1];
        assert_ne!(first, second);
        for (i, &l) in outcome.labels.iter().enumerate() {
            if l >= 0 {
                assert_eq!(l, if i % 2 == 0 { first } else { second });
            }
        }
    }

    #[test]
    fn test_merge_identical_clusters() {
        // Two labels over one distribution: must merge into the lower label.
        let points: Vec<Vec<f32>> = (0..40)
            .map(|i| vec![(i % 7) as f32 * 0.1, (i % 5) as f32 * 0.1])
            .collect();
        let mut labels: Vec<i32> = (0..40).map(|i| (i % 2) as i32).collect();
        let merges =
            merge_clusters(&mut labels, &points, MergingMethod::Distance, 3.0);
        assert_eq!(merges, 1);
        assert!(labels.iter().all(|&l| l == 0));
    }

    #[test]
    fn test_merge_keeps_separated_clusters() {
        let mut points = Vec::new();
        let mut labels = Vec::new();
        for i in 0..30 {
            let jitter = (i % 5) as f32 * 0.1;
            points.push(vec![jitter, jitter]);
            labels.push(0);
            points.push(vec![100.0 + jitter, jitter]);
            labels.push(1);
        }
        let merges =
            merge_clusters(&mut labels, &points, MergingMethod::Distance, 3.0);
        assert_eq!(merges, 0);
        assert!(labels.contains(&0) && labels.contains(&1));
    }

    #[test]
    fn test_bhattacharyya_merging() {
        let mut points = Vec::new();
        let mut labels = Vec::new();
        for i in 0..50 {
            let x = (i % 11) as f32 * 0.1;
            points.push(vec![x, 0.0]);
            labels.push(0);
            points.push(vec![x + 0.05, 0.0]);
            labels.push(1);
        }
        let merges =
            merge_clusters(&mut labels, &points, MergingMethod::Bhattacharyya, 0.5);
        assert_eq!(merges, 1);
    }

    #[test]
    fn test_prune_small_clusters() {
        let mut labels = vec![0, 0, 0, 0, 1, 1, -1, 2, 2, 2, 2, 2];
        let pruned = prune_small(&mut labels, 3);
        assert_eq!(pruned, 1);
        assert!(!labels.contains(&1));
        // Surviving labels keep their original values.
        assert!(labels.contains(&0) && labels.contains(&2));
    }

    #[test]
    fn test_clustering_deterministic() {
        let points = two_blobs(25);
        let dist = DistanceStore::from_points(&points);
        let state = compute_rho(&dist, 0.1);
        let a = cluster_group(&state.rho, &dist, &points, 5, 3.0, MergingMethod::Distance, 3.0);
        let b = cluster_group(&state.rho, &dist, &points, 5, 3.0, MergingMethod::Distance, 3.0);
        assert_eq!(a.labels, b.labels);
        assert_eq!(a.centers, b.centers);
    }
}
