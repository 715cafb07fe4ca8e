/// Benjamini-Hochberg threshold on a `1 - p` statistic map.
///
/// Voxels with value `<= 0` are outside the search region. With the
/// remaining `m` values sorted by p ascending, the largest rank `k` with
/// `p_k <= k / m * q` sets the cut-off; the returned statistic threshold is
/// that voxel's own value, so thresholding with `>=` keeps exactly the
/// discoveries. Returns `None` when nothing is significant.
pub fn fdr_threshold(values: &[f32], q: f64) -> Option<f32> {
    let mut stats: Vec<f32> = values
        .iter()
        .copied()
        .filter(|v| v.is_finite() && *v > 0.0)
        .collect();
    if stats.is_empty() {
        return None;
    }
    // Descending statistic is ascending p.
    stats.sort_by(|a, b| b.total_cmp(a));

    let m = stats.len() as f64;
    stats
        .iter()
        .enumerate()
        .filter(|(i, &v)| {
            let p = 1.0 - v as f64;
            let rank = (*i + 1) as f64;
            p <= rank / m * q
        })
        .last()
        .map(|(_, &v)| v)
}
