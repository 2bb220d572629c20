use space::{Knn, KnnFromBatch, LinearKnn};

use super::{Descriptor, Match};

/// Up to `k` `(train index, unit)` neighbours of every query row, closest first
pub fn knn<D: Descriptor>(query: &[D], train: &[D], k: usize) -> Vec<Vec<(usize, u32)>> {
    let data = train.iter().map(|row| (*row, ())).collect::<Vec<_>>();
    let search: LinearKnn<D::Metric, _> = KnnFromBatch::from_batch(data.iter());

    query
        .iter()
        .map(|row| {
            search
                .knn(row, k)
                .into_iter()
                .map(|found| (found.0.index, found.0.distance))
                .collect()
        })
        .collect()
}

/// Nearest neighbour matches that are also nearest neighbours in the reverse direction
pub fn cross_checked<D: Descriptor>(query: &[D], train: &[D]) -> Vec<Match> {
    let forward = knn(query, train, 1);
    let backward = knn(train, query, 1);

    forward
        .into_iter()
        .enumerate()
        .filter_map(|(query_idx, found)| {
            let &(train_idx, unit) = found.first()?;
            let &(back, _) = backward.get(train_idx)?.first()?;
            (back == query_idx).then(|| Match {
                query_idx,
                train_idx,
                distance: D::from_unit(unit),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::descriptor::BinaryDescriptor;

    fn with_bits(bits: usize) -> BinaryDescriptor {
        let mut descriptor = [0u8; 64];
        for bit in 0..bits {
            descriptor[bit / 8] |= 0x80 >> (bit % 8);
        }
        descriptor
    }

    #[test]
    fn knn_is_sorted_and_truncated() {
        let train = vec![with_bits(9), with_bits(1), with_bits(4), with_bits(6)];
        let found = knn(&[with_bits(0)], &train, 3);
        assert_eq!(found, vec![vec![(1, 1), (2, 4), (3, 6)]]);
        assert_eq!(knn(&[with_bits(0)], &train, 10)[0].len(), 4);
    }

    #[test]
    fn cross_check_requires_mutual_nearest() {
        // query 0 and 1 both prefer train 0, which prefers query 1
        let query = vec![with_bits(0), with_bits(3)];
        let train = vec![with_bits(4), with_bits(20)];
        let matches = cross_checked(&query, &train);
        assert_eq!(matches.len(), 1);
        assert_eq!((matches[0].query_idx, matches[0].train_idx), (1, 0));
        assert_eq!(matches[0].distance, 1.0);
    }
}
