//! Minimum-cost perfect matching on a square cost matrix (Kuhn-Munkres with
//! row/column potentials). Used to realign cluster labels between adjacent
//! SNP columns.

use ndarray::Array2;

/// Returns `assignment` with `assignment[row] = column` minimizing the summed cost.
///
/// The matrix must be square; an empty matrix yields an empty assignment.
pub fn min_cost_assignment(cost: &Array2<f64>) -> Vec<usize> {
    let n = cost.nrows();
    debug_assert_eq!(n, cost.ncols());
    if n == 0 {
        return Vec::new();
    }

    // 1-based bookkeeping; index 0 is the virtual start column.
    let mut u = vec![0.0f64; n + 1];
    let mut v = vec![0.0f64; n + 1];
    let mut matched_row = vec![0usize; n + 1];
    let mut way = vec![0usize; n + 1];

    for row in 1..=n {
        matched_row[0] = row;
        let mut col0 = 0usize;
        let mut min_slack = vec![f64::INFINITY; n + 1];
        let mut used = vec![false; n + 1];
        loop {
            used[col0] = true;
            let row0 = matched_row[col0];
            let mut delta = f64::INFINITY;
            let mut col1 = 0usize;
            for col in 1..=n {
                if used[col] {
                    continue;
                }
                let reduced = cost[[row0 - 1, col - 1]] - u[row0] - v[col];
                if reduced < min_slack[col] {
                    min_slack[col] = reduced;
                    way[col] = col0;
                }
                if min_slack[col] < delta {
                    delta = min_slack[col];
                    col1 = col;
                }
            }
            for col in 0..=n {
                if used[col] {
                    u[matched_row[col]] += delta;
                    v[col] -= delta;
                } else {
                    min_slack[col] -= delta;
                }
            }
            col0 = col1;
            if matched_row[col0] == 0 {
                break;
            }
        }
        loop {
            let col1 = way[col0];
            matched_row[col0] = matched_row[col1];
            col0 = col1;
            if col0 == 0 {
                break;
            }
        }
    }

    let mut assignment = vec![0usize; n];
    for col in 1..=n {
        assignment[matched_row[col] - 1] = col - 1;
    }
    assignment
}

/// Maximum-weight variant of [`min_cost_assignment`].
pub fn max_weight_assignment(weights: &Array2<f64>) -> Vec<usize> {
    min_cost_assignment(&weights.mapv(|w| -w))
}
