//! The (variant, location) key every quantity is tracked under.

use serde::{Deserialize, Serialize};

use stockflow_core::{LocationId, ProductVariantId, ValueObject};

/// A trackable quantity: one product variant at one location.
///
/// The derived ordering (location, then variant) is the global lock order for
/// operations that touch several dimensions at once.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Dimension {
    pub location_id: LocationId,
    pub variant_id: ProductVariantId,
}

impl Dimension {
    pub fn new(variant_id: ProductVariantId, location_id: LocationId) -> Self {
        Self {
            location_id,
            variant_id,
        }
    }
}

impl ValueObject for Dimension {}

impl core::fmt::Display for Dimension {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}@{}", self.variant_id, self.location_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_groups_by_location_first() {
        let loc_a = LocationId::from_uuid(uuid::Uuid::from_u128(1));
        let loc_b = LocationId::from_uuid(uuid::Uuid::from_u128(2));
        let v_hi = ProductVariantId::from_uuid(uuid::Uuid::from_u128(9));
        let v_lo = ProductVariantId::from_uuid(uuid::Uuid::from_u128(3));

        let mut dims = vec![
            Dimension::new(v_lo, loc_b),
            Dimension::new(v_hi, loc_a),
            Dimension::new(v_lo, loc_a),
        ];
        dims.sort();

        assert_eq!(
            dims,
            vec![
                Dimension::new(v_lo, loc_a),
                Dimension::new(v_hi, loc_a),
                Dimension::new(v_lo, loc_b),
            ]
        );
    }
}
