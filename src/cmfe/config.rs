//! Options for one `perform_cmfe` call.

use crate::algs::communicator::{CmfeCommTags, CommTag};
use crate::geometry::bounds::BoundingBox;
use crate::mesh_error::CmfeError;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CmfeOptions {
    /// Skip partitioning and relocation; evaluate against local sources only.
    /// Implied when the communicator has a single rank.
    pub serial_only: bool,
    /// Value written for points no source cell contains.
    pub fill_value: f64,
    /// Ask neighbouring regions for points missed locally near a region boundary.
    pub boundary_retry: bool,
    /// Upper bound on neighbours asked per missed point.
    pub max_boundary_retries: usize,
    /// Retry radius, as a fraction of the partition extent diagonal.
    pub boundary_tolerance: f64,
    /// Histogram resolution used to place each bisection plane.
    pub partition_bins: usize,
    /// Caller-known problem extent, used to pad degenerate partition axes.
    pub global_extent: Option<BoundingBox>,
    /// Component count the caller expects the source field to have.
    pub expected_components: Option<usize>,
    /// First tag of the message-tag block used by this call.
    pub comm_tag_base: u16,
}

impl Default for CmfeOptions {
    fn default() -> Self {
        Self {
            serial_only: false,
            fill_value: 0.0,
            boundary_retry: true,
            max_boundary_retries: 2,
            boundary_tolerance: 1e-6,
            partition_bins: 64,
            global_extent: None,
            expected_components: None,
            comm_tag_base: 0xC300,
        }
    }
}

impl CmfeOptions {
    pub fn tags(&self) -> CmfeCommTags {
        CmfeCommTags::from_base(CommTag::new(self.comm_tag_base))
    }

    pub fn validate(&self) -> Result<(), CmfeError> {
        if self.partition_bins < 2 {
            return Err(CmfeError::InvalidState("partition_bins must be at least 2"));
        }
        if !(self.boundary_tolerance >= 0.0) {
            return Err(CmfeError::InvalidState(
                "boundary_tolerance must be non-negative",
            ));
        }
        if let Some(0) = self.expected_components {
            return Err(CmfeError::InvalidState(
                "expected_components must be positive",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_uses_defaults() {
        let opts: CmfeOptions =
            serde_json::from_str(r#"{ "serial_only": true, "fill_value": -1.0 }"#).unwrap();
        assert!(opts.serial_only);
        assert_eq!(opts.fill_value, -1.0);
        assert_eq!(opts.partition_bins, 64);
        assert_eq!(opts.comm_tag_base, 0xC300);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn rejects_degenerate_histograms() {
        let opts = CmfeOptions {
            partition_bins: 1,
            ..Default::default()
        };
        assert!(opts.validate().is_err());
    }
}
