//! Monotonic alignment search and duration-to-path expansion.
//!
//! Both run on the host over flat row-major buffers; the search is a dynamic
//! program that is not differentiated through.

const NEG_INF: f32 = -1e9;

/// Most likely monotonic, surjective path through `log_p: [batch, t_x, t_y]`.
///
/// Each output frame `y` is assigned to exactly one input position, and the
/// position never decreases with `y`. When `prior: [batch, t_y, t_x]` is
/// given, cells where the prior is not positive are excluded. Returns a hard
/// `0/1` path with the same layout as `log_p`.
pub fn maximum_path(
    log_p: &[f32],
    batch: usize,
    t_x: usize,
    t_y: usize,
    x_lengths: &[usize],
    y_lengths: &[usize],
    prior: Option<&[f32]>,
) -> Vec<f32> {
    let mut path = vec![0.0_f32; batch * t_x * t_y];
    for b in 0..batch {
        let x_len = x_lengths[b].min(t_x);
        let y_len = y_lengths[b].min(t_y);
        if x_len == 0 || y_len == 0 {
            continue;
        }
        let base = b * t_x * t_y;
        let mut value = vec![0.0_f32; x_len * y_len];
        for x in 0..x_len {
            for y in 0..y_len {
                let allowed = prior.map_or(true, |prior| prior[(b * t_y + y) * t_x + x] > 0.0);
                value[x * y_len + y] = if allowed { log_p[base + x * t_y + y] } else { NEG_INF };
            }
        }
        for y in 0..y_len {
            let lo = (x_len + y).saturating_sub(y_len);
            let hi = x_len.min(y + 1);
            for x in lo..hi {
                let stay = if x == y { NEG_INF } else { value[x * y_len + y - 1] };
                let advance = match (x, y) {
                    (0, 0) => 0.0,
                    (0, _) => NEG_INF,
                    _ => value[(x - 1) * y_len + y - 1],
                };
                value[x * y_len + y] += stay.max(advance);
            }
        }
        let mut index = x_len - 1;
        for y in (0..y_len).rev() {
            path[base + index * t_y + y] = 1.0;
            if index != 0
                && (index == y || value[index * y_len + y - 1] < value[(index - 1) * y_len + y - 1])
            {
                index -= 1;
            }
        }
    }
    path
}

/// Expand per-token frame counts `durations: [batch, t_x]` into a hard path
/// `[batch, t_x, t_y]`: token `i` covers frames `[Σ_{j<i} d_j, Σ_{j≤i} d_j)`.
pub fn generate_path(durations: &[usize], batch: usize, t_x: usize, t_y: usize) -> Vec<f32> {
    let mut path = vec![0.0_f32; batch * t_x * t_y];
    for b in 0..batch {
        let mut start = 0usize;
        for x in 0..t_x {
            let end = (start + durations[b * t_x + x]).min(t_y);
            for y in start..end {
                path[(b * t_x + x) * t_y + y] = 1.0;
            }
            start = end;
        }
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column_owner(path: &[f32], t_x: usize, t_y: usize, y: usize) -> Vec<usize> {
        (0..t_x).filter(|&x| path[x * t_y + y] == 1.0).collect()
    }

    #[test]
    fn path_is_monotonic_and_covers_every_frame() {
        let t_x = 3;
        let t_y = 5;
        let log_p: Vec<f32> = (0..t_x * t_y).map(|i| ((i * 7) % 5) as f32 * -0.3).collect();
        let path = maximum_path(&log_p, 1, t_x, t_y, &[3], &[5], None);
        let mut previous = 0;
        for y in 0..t_y {
            let owners = column_owner(&path, t_x, t_y, y);
            assert_eq!(owners.len(), 1);
            assert!(owners[0] >= previous && owners[0] <= previous + 1);
            previous = owners[0];
        }
        assert_eq!(column_owner(&path, t_x, t_y, 0), vec![0]);
        assert_eq!(column_owner(&path, t_x, t_y, t_y - 1), vec![t_x - 1]);
    }

    #[test]
    fn path_follows_strong_diagonal_scores() {
        let t_x = 2;
        let t_y = 4;
        // Token 0 prefers frames 0..3, token 1 only frame 3.
        let log_p = vec![0.0, 0.0, 0.0, -9.0, -9.0, -9.0, -9.0, 0.0];
        let path = maximum_path(&log_p, 1, t_x, t_y, &[2], &[4], None);
        assert_eq!(path, vec![1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn prior_excludes_cells() {
        let t_x = 2;
        let t_y = 4;
        let log_p = vec![0.0; 8];
        // Prior layout [t_y, t_x]: frame 1 may only belong to token 1.
        let prior = vec![1.0, 1.0, 0.0, 1.0, 1.0, 1.0, 1.0, 1.0];
        let path = maximum_path(&log_p, 1, t_x, t_y, &[2], &[4], Some(&prior));
        assert_eq!(column_owner(&path, t_x, t_y, 1), vec![1]);
    }

    #[test]
    fn generated_path_spans_durations() {
        let path = generate_path(&[2, 1, 3], 1, 3, 5);
        assert_eq!(
            path,
            vec![
                1.0, 1.0, 0.0, 0.0, 0.0, //
                0.0, 0.0, 1.0, 0.0, 0.0, //
                0.0, 0.0, 0.0, 1.0, 1.0,
            ]
        );
    }
}
