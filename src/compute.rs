//! Nth prime computation.
//!
//! The algorithm is plain trial division with no sieve and no caching
//! between calls. Its cost is the reason compute can be offloaded to the
//! [`WorkerPool`].

use crate::pool::WorkerPool;
use std::num::NonZeroU64;
use std::sync::Arc;

/// Trial-division primality test. Numbers below 2 are not prime.
pub fn is_prime(candidate: u64) -> bool {
    if candidate <= 1 {
        return false;
    }

    let mut divisor = 2;
    while divisor <= candidate / divisor {
        if candidate % divisor == 0 {
            return false;
        }
        divisor += 1;
    }
    true
}

/// Return the `n`th prime, counting 2 as the first.
pub fn nth_prime(n: NonZeroU64) -> u64 {
    let mut found = 0;
    let mut candidate = 2;
    loop {
        if is_prime(candidate) {
            found += 1;
            if found == n.get() {
                return candidate;
            }
        }
        candidate += 1;
    }
}

/// Errors from running a computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeError {
    /// No pool worker could be started.
    PoolUnavailable,
    /// The job was dropped before producing a result.
    WorkerLost,
}

impl std::fmt::Display for ComputeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComputeError::PoolUnavailable => write!(f, "worker pool unavailable"),
            ComputeError::WorkerLost => write!(f, "worker exited before returning a result"),
        }
    }
}

impl std::error::Error for ComputeError {}

/// Where a session's computations run.
#[derive(Clone)]
pub enum ComputeEngine {
    /// On the calling thread.
    InProcess,
    /// On a shared worker pool; the caller waits for the result.
    Offload(Arc<WorkerPool>),
}

impl ComputeEngine {
    /// Build an engine from an optional pool.
    pub fn new(pool: Option<Arc<WorkerPool>>) -> Self {
        match pool {
            Some(pool) => ComputeEngine::Offload(pool),
            None => ComputeEngine::InProcess,
        }
    }

    /// The pool, when compute is offloaded.
    pub fn pool(&self) -> Option<&Arc<WorkerPool>> {
        match self {
            ComputeEngine::InProcess => None,
            ComputeEngine::Offload(pool) => Some(pool),
        }
    }

    /// Compute the `n`th prime, blocking until it is available.
    pub fn nth_prime(&self, n: NonZeroU64) -> Result<u64, ComputeError> {
        match self {
            ComputeEngine::InProcess => Ok(nth_prime(n)),
            ComputeEngine::Offload(pool) => pool.submit(n)?.result(),
        }
    }
}

impl std::fmt::Debug for ComputeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComputeEngine::InProcess => write!(f, "InProcess"),
            ComputeEngine::Offload(pool) => write!(f, "Offload(workers={})", pool.size()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nz(n: u64) -> NonZeroU64 {
        NonZeroU64::new(n).unwrap()
    }

    /// Sieve of Eratosthenes returning the first `count` primes.
    fn sieve(count: usize) -> Vec<u64> {
        let limit = 110_000;
        let mut composite = vec![false; limit + 1];
        let mut primes = Vec::with_capacity(count);
        for i in 2..=limit {
            if composite[i] {
                continue;
            }
            primes.push(i as u64);
            if primes.len() == count {
                break;
            }
            let mut j = i * i;
            while j <= limit {
                composite[j] = true;
                j += i;
            }
        }
        primes
    }

    #[test]
    fn test_is_prime() {
        assert!(!is_prime(0));
        assert!(!is_prime(1));
        assert!(is_prime(2));
        assert!(is_prime(3));
        assert!(!is_prime(4));
        assert!(!is_prime(25));
        assert!(is_prime(97));
        assert!(!is_prime(7919 * 7919));
    }

    #[test]
    fn test_known_values() {
        assert_eq!(nth_prime(nz(1)), 2);
        assert_eq!(nth_prime(nz(2)), 3);
        assert_eq!(nth_prime(nz(5)), 11);
        assert_eq!(nth_prime(nz(6)), 13);
        assert_eq!(nth_prime(nz(1000)), 7919);
    }

    #[test]
    fn test_matches_sieve() {
        let primes = sieve(10_000);
        assert_eq!(primes.len(), 10_000);
        // Spot-check across the range; a full scan is quadratic in test time.
        for n in (1..=10_000).step_by(97).chain([10_000]) {
            assert_eq!(nth_prime(nz(n as u64)), primes[n - 1], "n = {n}");
        }
    }

    #[test]
    fn test_primality_matches_sieve_up_to_ten_thousandth_prime() {
        let primes = sieve(10_000);
        let last = *primes.last().unwrap();
        assert_eq!(last, 104_729);

        let mut expected = primes.iter().peekable();
        for candidate in 0..=last {
            let sieve_says = expected.next_if_eq(&&candidate).is_some();
            assert_eq!(is_prime(candidate), sieve_says, "candidate = {candidate}");
        }
    }

    #[test]
    fn test_first_primes_exhaustive() {
        let primes = sieve(500);
        for (i, &p) in primes.iter().enumerate() {
            assert_eq!(nth_prime(nz(i as u64 + 1)), p);
        }
    }

    #[test]
    fn test_engines_agree() {
        let local = ComputeEngine::new(None);
        let pooled = ComputeEngine::new(Some(Arc::new(WorkerPool::new(2))));
        assert!(local.pool().is_none());
        assert!(pooled.pool().is_some());

        for n in [1, 2, 5, 6, 250] {
            let expected = local.nth_prime(nz(n)).unwrap();
            assert_eq!(pooled.nth_prime(nz(n)).unwrap(), expected);
            assert_eq!(pooled.nth_prime(nz(n)).unwrap(), expected);
        }
    }
}
