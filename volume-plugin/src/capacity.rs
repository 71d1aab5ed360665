//! Pool selection for new volumes.

use freenas_client::StoragePool;

/// Pick the pool with the most available space.
///
/// Ties go to the pool listed first. Returns `None` for an empty list.
pub fn select_pool(pools: &[StoragePool]) -> Option<&StoragePool> {
    let mut best: Option<&StoragePool> = None;
    for pool in pools {
        match best {
            Some(current) if pool.available_bytes <= current.available_bytes => {}
            _ => best = Some(pool),
        }
    }
    best
}

/// Whether `pool` can hold `size_bytes`.
pub fn fits(pool: &StoragePool, size_bytes: u64) -> bool {
    pool.available_bytes >= size_bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(name: &str, available_bytes: u64) -> StoragePool {
        StoragePool {
            name: name.to_string(),
            available_bytes,
        }
    }

    #[test]
    fn test_selects_largest_pool() {
        let pools = vec![pool("A", 10), pool("B", 30), pool("C", 20)];
        assert_eq!(select_pool(&pools).unwrap().name, "B");
    }

    #[test]
    fn test_empty_input_selects_nothing() {
        assert!(select_pool(&[]).is_none());
    }

    #[test]
    fn test_tie_goes_to_first_seen() {
        let pools = vec![pool("A", 5), pool("B", 40), pool("C", 40)];
        assert_eq!(select_pool(&pools).unwrap().name, "B");
    }

    #[test]
    fn test_single_empty_pool_is_still_selected() {
        let pools = vec![pool("only", 0)];
        assert_eq!(select_pool(&pools).unwrap().name, "only");
    }

    #[test]
    fn test_fits_is_inclusive() {
        let p = pool("A", 100);
        assert!(fits(&p, 100));
        assert!(fits(&p, 99));
        assert!(!fits(&p, 101));
    }
}
