/// Configuration for a [`crate::ThreadPool`].
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Number of worker threads.
    pub workers: usize,

    /// Prefix for worker thread names; the worker index is appended.
    pub thread_name_prefix: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: default_worker_count(),
            thread_name_prefix: "kestrel-worker-".to_string(),
        }
    }
}

/// One core is left to the rest of the application, with a floor of two
/// workers so nested waits always have a peer to hand work to.
pub fn default_worker_count() -> usize {
    num_cpus::get().saturating_sub(1).max(2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_worker_count_has_floor_of_two() {
        assert!(default_worker_count() >= 2);
        assert_eq!(PoolConfig::default().workers, default_worker_count());
    }
}
