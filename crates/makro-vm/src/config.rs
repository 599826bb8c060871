/// Tunables for the collector. The defaults honour the `gc-stress` feature.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    /// Collect before every allocation.
    pub gc_stress: bool,
    /// Bytes allocated before the first collection.
    pub gc_initial_threshold: usize,
    /// After a collection, the next one is due at `bytes_allocated * gc_growth_factor`.
    pub gc_growth_factor: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gc_stress: cfg!(feature = "gc-stress"),
            gc_initial_threshold: 1024 * 1024,
            gc_growth_factor: 2,
        }
    }
}
