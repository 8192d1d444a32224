//! Construction-time configuration of a coordinator's capacities.

const DEFAULT_HAZARD_CAPACITY: usize = 64;
const DEFAULT_RETIRE_THRESHOLD: usize = 128;

////////////////////////////////////////////////////////////////////////////////////////////////////
// Config
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Capacity parameters for a [`Coordinator`](crate::Coordinator).
#[derive(Copy, Clone, Debug)]
pub struct Config {
    hazard_capacity: usize,
    retire_threshold: usize,
}

/********** impl Default **************************************************************************/

impl Default for Config {
    #[inline]
    fn default() -> Self {
        ConfigBuilder::new().build()
    }
}

/********** impl inherent *************************************************************************/

impl Config {
    /// Creates a new [`Config`] with the given parameters.
    ///
    /// A `hazard_capacity` of zero is raised to one (a slot table must be
    /// able to hold at least one hazard) and `retire_threshold` likewise.
    #[inline]
    pub fn with_params(hazard_capacity: usize, retire_threshold: usize) -> Self {
        Self {
            hazard_capacity: hazard_capacity.max(1),
            retire_threshold: retire_threshold.max(1),
        }
    }

    /// Returns the number of hazard slots of a dynamically sized coordinator.
    #[inline]
    pub fn hazard_capacity(&self) -> usize {
        self.hazard_capacity
    }

    /// Returns the retire-list threshold handed to each per-thread list.
    #[inline]
    pub fn retire_threshold(&self) -> usize {
        self.retire_threshold
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// ConfigBuilder
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A builder type for gradually initializing a [`Config`].
#[derive(Copy, Clone, Debug, Default)]
pub struct ConfigBuilder {
    hazard_capacity: Option<usize>,
    retire_threshold: Option<usize>,
}

/********** impl inherent *************************************************************************/

impl ConfigBuilder {
    /// Creates a new [`ConfigBuilder`] with default values.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of hazard slots.
    #[inline]
    pub fn hazard_capacity(mut self, hazard_capacity: usize) -> Self {
        self.hazard_capacity = Some(hazard_capacity);
        self
    }

    /// Sets the per-thread retire-list threshold.
    #[inline]
    pub fn retire_threshold(mut self, retire_threshold: usize) -> Self {
        self.retire_threshold = Some(retire_threshold);
        self
    }

    /// Consumes the [`ConfigBuilder`] and returns an initialized [`Config`].
    ///
    /// Unspecified parameters are initialized with their default values.
    #[inline]
    pub fn build(self) -> Config {
        Config::with_params(
            self.hazard_capacity.unwrap_or(DEFAULT_HAZARD_CAPACITY),
            self.retire_threshold.unwrap_or(DEFAULT_RETIRE_THRESHOLD),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, ConfigBuilder};

    #[test]
    fn builder_defaults() {
        let config = Config::default();
        assert_eq!(config.hazard_capacity(), 64);
        assert_eq!(config.retire_threshold(), 128);
    }

    #[test]
    fn builder_overrides() {
        let config = ConfigBuilder::new().hazard_capacity(8).retire_threshold(4).build();
        assert_eq!(config.hazard_capacity(), 8);
        assert_eq!(config.retire_threshold(), 4);
    }

    #[test]
    fn zero_capacities_are_raised() {
        let config = Config::with_params(0, 0);
        assert_eq!(config.hazard_capacity(), 1);
        assert_eq!(config.retire_threshold(), 1);
    }
}
