use crate::crypto::{hash, Hash, HASH_SIZE};

// Binary merkle root over the payload transaction ids.
//
// Leaves are the transaction ids in payload order. A level with an odd
// number of nodes duplicates its last node. The empty payload has the
// zero hash as its root. This is part of the consensus contract: the
// root is embedded in the signed header.
pub fn compute_transaction_root<I>(ids: I) -> Hash
where
    I: IntoIterator<Item = Hash>,
{
    let mut level: Vec<Hash> = ids.into_iter().collect();
    if level.is_empty() {
        return Hash::zero();
    }

    while level.len() > 1 {
        if level.len() % 2 != 0 {
            let last = level[level.len() - 1].clone();
            level.push(last);
        }

        level = level
            .chunks_exact(2)
            .map(|pair| hash_pair(&pair[0], &pair[1]))
            .collect();
    }

    level.pop().expect("merkle level cannot be empty")
}

fn hash_pair(left: &Hash, right: &Hash) -> Hash {
    let mut bytes = [0u8; HASH_SIZE * 2];
    bytes[..HASH_SIZE].copy_from_slice(left.as_bytes());
    bytes[HASH_SIZE..].copy_from_slice(right.as_bytes());
    hash(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(n: u8) -> Hash {
        hash(&[n])
    }

    #[test]
    fn test_empty_root_is_zero() {
        assert_eq!(compute_transaction_root([]), Hash::zero());
    }

    #[test]
    fn test_single_leaf_is_its_own_root() {
        assert_eq!(compute_transaction_root([leaf(1)]), leaf(1));
    }

    #[test]
    fn test_pair() {
        let expected = hash_pair(&leaf(1), &leaf(2));
        assert_eq!(compute_transaction_root([leaf(1), leaf(2)]), expected);
    }

    #[test]
    fn test_odd_level_duplicates_last() {
        let left = hash_pair(&leaf(1), &leaf(2));
        let right = hash_pair(&leaf(3), &leaf(3));
        let expected = hash_pair(&left, &right);
        assert_eq!(
            compute_transaction_root([leaf(1), leaf(2), leaf(3)]),
            expected
        );
    }

    #[test]
    fn test_order_matters() {
        assert_ne!(
            compute_transaction_root([leaf(1), leaf(2)]),
            compute_transaction_root([leaf(2), leaf(1)])
        );
    }
}
