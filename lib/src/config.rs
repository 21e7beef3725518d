//! Runtime configuration of a [`crate::api::Store`]. Unlike
//! [`StoreParams`], nothing here is persisted with the data.

use crate::consts::DEFAULT_EXCLUSIVE_TIMEOUT;
use crate::errors::{Result, StoreError};
use crate::location::Location;
use crate::options::OldGeneration;
use crate::params::StoreParams;
use derive_builder::{Builder, UninitializedFieldError};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Builder, Debug, Clone)]
#[builder(build_fn(error = "StoreConfigBuilderError"))]
pub struct StoreConfig {
    pub location: Location,
    /// Parameters for a brand new location. An existing generation always
    /// keeps the parameters it was created with.
    #[builder(default, setter(strip_option))]
    pub params: Option<StoreParams>,
    /// Bound on waiting for an active writer when entering exclusive mode.
    #[builder(default = "DEFAULT_EXCLUSIVE_TIMEOUT")]
    pub exclusive_timeout: Duration,
    /// Default treatment of superseded generations by `Store::compact`.
    #[builder(default)]
    pub old_generations: OldGeneration,
}

#[derive(Debug)]
pub struct StoreConfigBuilderError(String);

impl From<UninitializedFieldError> for StoreConfigBuilderError {
    fn from(err: UninitializedFieldError) -> Self {
        StoreConfigBuilderError(err.to_string())
    }
}

impl std::fmt::Display for StoreConfigBuilderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for StoreConfigBuilderError {}

impl From<StoreConfigBuilderError> for StoreError {
    fn from(err: StoreConfigBuilderError) -> Self {
        StoreError::Config(err.0)
    }
}

impl StoreConfig {
    pub fn builder() -> StoreConfigBuilder {
        StoreConfigBuilder::default()
    }

    pub fn directory<P: Into<PathBuf>>(path: P) -> Result<Self> {
        Ok(Self::builder().location(Location::dir(path)).build()?)
    }

    pub fn memory() -> Result<Self> {
        Ok(Self::builder().location(Location::mem()).build()?)
    }

    pub fn params_or_default(&self) -> StoreParams {
        self.params.clone().unwrap_or_default()
    }

    /// Prints out the configuration for command line output.
    pub fn print(&self) {
        println!("Configuration:");
        println!("  Location: {}", self.location);
        println!(
            "  Exclusive timeout: {}ms",
            self.exclusive_timeout.as_millis()
        );
        println!("  Old generations: {:?}", self.old_generations);
        if let Some(params) = &self.params {
            println!("  Quad indexes: {}", params.quad_indexes.join(", "));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let config = StoreConfig::builder()
            .location(Location::mem())
            .build()
            .unwrap();
        assert_eq!(config.exclusive_timeout, DEFAULT_EXCLUSIVE_TIMEOUT);
        assert!(config.params.is_none());
        assert_eq!(config.old_generations, OldGeneration::Keep);
    }

    #[test]
    fn location_is_required() {
        let err: StoreError = StoreConfig::builder().build().unwrap_err().into();
        assert!(matches!(err, StoreError::Config(_)));
    }

    #[test]
    fn params_setter_strips_option() {
        let config = StoreConfig::builder()
            .location(Location::dir("/tmp/genstore"))
            .params(StoreParams::with_indexes(["SPOG"]))
            .exclusive_timeout(Duration::from_millis(50))
            .build()
            .unwrap();
        assert_eq!(config.params_or_default().quad_indexes, vec!["SPOG"]);
    }
}
