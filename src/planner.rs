//! Capacity planning for per-voxel vector fields.
//!
//! A vector field holds four components per voxel. When the whole field does not
//! fit in one device allocation it is produced into two linear buffers split along
//! z and copied into the target afterwards.

use ndarray::{Array4, ArrayView4, s};
use tracing::debug;

use crate::{device::DeviceError, device::ExecutionProfile, volume::Dims};

/// Stored components per voxel: x, y, z and magnitude.
pub const COMPONENTS: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlanMode {
    /// Kernels write the target volume directly
    Direct,
    /// One linear buffer holds the whole field
    Single,
    /// Slices `[0, split_z)` go to the first buffer, the rest to the second
    Split {
        split_z: usize,
        first_voxels: usize,
        second_voxels: usize,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VectorFieldPlan {
    pub dims: Dims,
    pub total_voxels: usize,
    /// 2 for snorm16, 4 for f32
    pub bytes_per_component: usize,
    pub device_max_alloc_bytes: u64,
    pub mode: PlanMode,
}

impl VectorFieldPlan {
    pub fn required_bytes(&self) -> u64 {
        voxel_bytes(self.bytes_per_component) * self.total_voxels as u64
    }

    /// The un-split field is larger than one allocation.
    pub fn exceeds_capacity(&self) -> bool {
        self.required_bytes() > self.device_max_alloc_bytes
    }

    /// Slices held by the first staging region.
    pub fn split_z(&self) -> usize {
        match self.mode {
            PlanMode::Split { split_z, .. } => split_z,
            PlanMode::Direct | PlanMode::Single => self.dims.z,
        }
    }

    /// Voxel counts of the two staging regions; the second is empty unless split.
    pub fn region_voxels(&self) -> (usize, usize) {
        match self.mode {
            PlanMode::Split {
                first_voxels,
                second_voxels,
                ..
            } => (first_voxels, second_voxels),
            PlanMode::Direct | PlanMode::Single => (self.total_voxels, 0),
        }
    }

    pub fn region_bytes(&self) -> (u64, u64) {
        let (first, second) = self.region_voxels();
        let per_voxel = voxel_bytes(self.bytes_per_component);
        (first as u64 * per_voxel, second as u64 * per_voxel)
    }

    /// Copy the staging regions into `target` (`[z, y, x, c]`): the first region
    /// fills slices `[0, split_z)`, the second fills `[split_z, z)`.
    pub fn assemble<C: Copy>(
        &self,
        first: &[C],
        second: &[C],
        target: &mut Array4<C>,
    ) -> Result<(), DeviceError> {
        let Dims { x, y, z } = self.dims;
        let split_z = self.split_z();
        if target.dim() != (z, y, x, COMPONENTS) {
            return Err(DeviceError::Other(format!(
                "vector field target has shape {:?}, expected {:?}",
                target.dim(),
                (z, y, x, COMPONENTS)
            )));
        }

        let first = ArrayView4::from_shape((split_z, y, x, COMPONENTS), first)
            .map_err(|e| DeviceError::Other(format!("first staging region: {e}")))?;
        target.slice_mut(s![..split_z, .., .., ..]).assign(&first);

        if split_z < z {
            let second = ArrayView4::from_shape((z - split_z, y, x, COMPONENTS), second)
                .map_err(|e| DeviceError::Other(format!("second staging region: {e}")))?;
            target.slice_mut(s![split_z.., .., .., ..]).assign(&second);
        }
        Ok(())
    }
}

fn voxel_bytes(bytes_per_component: usize) -> u64 {
    (COMPONENTS * bytes_per_component) as u64
}

pub struct BufferPlanner;

impl BufferPlanner {
    pub fn plan(dims: Dims, profile: &ExecutionProfile) -> Result<VectorFieldPlan, DeviceError> {
        let bytes_per_component = profile.precision.component_bytes();
        let per_voxel = voxel_bytes(bytes_per_component);
        let max_alloc = profile.max_alloc_bytes;
        let total_voxels = dims.voxels();
        let required = per_voxel * total_voxels as u64;

        let mode = if required < max_alloc {
            if profile.direct_write {
                PlanMode::Direct
            } else {
                PlanMode::Single
            }
        } else {
            let slice_voxels = (dims.x * dims.y) as u64;
            let limit = max_alloc / per_voxel;
            let split_z = ((limit / slice_voxels) as usize).min(dims.z);
            // a single slice is already larger than one allocation
            if split_z == 0 {
                return Err(DeviceError::Allocation {
                    label: "vector field slab",
                    requested: slice_voxels * per_voxel,
                    max_alloc,
                });
            }
            let first_voxels = split_z * dims.x * dims.y;
            let second_voxels = total_voxels - first_voxels;
            let second_bytes = second_voxels as u64 * per_voxel;
            if second_bytes > max_alloc {
                return Err(DeviceError::Allocation {
                    label: "vector field second region",
                    requested: second_bytes,
                    max_alloc,
                });
            }
            PlanMode::Split {
                split_z,
                first_voxels,
                second_voxels,
            }
        };

        let plan = VectorFieldPlan {
            dims,
            total_voxels,
            bytes_per_component,
            device_max_alloc_bytes: max_alloc,
            mode,
        };
        debug!(?dims, required, max_alloc, mode = ?plan.mode, "planned vector field");
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::VectorPrecision;

    fn profile(precision: VectorPrecision, direct_write: bool, max_alloc_bytes: u64) -> ExecutionProfile {
        ExecutionProfile {
            precision,
            direct_write,
            max_alloc_bytes,
        }
    }

    #[test]
    fn small_fields_are_direct_or_single() {
        let dims = Dims::new(8, 8, 8);
        let direct = BufferPlanner::plan(dims, &profile(VectorPrecision::Snorm16, true, 1 << 20)).unwrap();
        assert_eq!(direct.mode, PlanMode::Direct);
        assert_eq!(direct.required_bytes(), 8 * 8 * 8 * 8);
        assert!(!direct.exceeds_capacity());

        let single = BufferPlanner::plan(dims, &profile(VectorPrecision::Float32, false, 1 << 20)).unwrap();
        assert_eq!(single.mode, PlanMode::Single);
        assert_eq!(single.split_z(), 8);
        assert_eq!(single.region_voxels(), (512, 0));
    }

    #[test]
    fn oversized_fields_split_into_fitting_regions() {
        for (dims, max_alloc) in [
            (Dims::new(16, 16, 16), 40_000u64),
            (Dims::new(12, 8, 9), 8_000),
            (Dims::new(4, 4, 64), 8_192),
        ] {
            let plan = BufferPlanner::plan(dims, &profile(VectorPrecision::Float32, true, max_alloc)).unwrap();
            let PlanMode::Split {
                split_z,
                first_voxels,
                second_voxels,
            } = plan.mode
            else {
                panic!("expected a split plan for {dims:?}");
            };
            assert!(split_z > 0 && split_z < dims.z);
            assert_eq!(first_voxels + second_voxels, dims.voxels());
            assert_eq!(first_voxels, split_z * dims.x * dims.y);
            let (a, b) = plan.region_bytes();
            assert!(a <= max_alloc && b <= max_alloc);
            assert!(plan.exceeds_capacity());
        }
    }

    #[test]
    fn field_exactly_at_capacity_splits_with_empty_remainder() {
        let dims = Dims::new(4, 4, 8);
        let plan = BufferPlanner::plan(dims, &profile(VectorPrecision::Float32, true, 16 * 16 * 8)).unwrap();
        assert_eq!(
            plan.mode,
            PlanMode::Split {
                split_z: 8,
                first_voxels: 128,
                second_voxels: 0
            }
        );
        assert_eq!(plan.region_bytes(), (2048, 0));
        assert!(!plan.exceeds_capacity());

        let first = vec![3.0f32; 128 * COMPONENTS];
        let mut target = Array4::zeros((8, 4, 4, COMPONENTS));
        plan.assemble(&first, &[], &mut target).unwrap();
        assert!(target.iter().all(|&v| v == 3.0));
    }

    #[test]
    fn slice_larger_than_one_allocation_is_an_error() {
        let err = BufferPlanner::plan(Dims::new(64, 64, 4), &profile(VectorPrecision::Float32, false, 1024)).unwrap_err();
        assert_eq!(
            err,
            DeviceError::Allocation {
                label: "vector field slab",
                requested: 64 * 64 * 16,
                max_alloc: 1024
            }
        );
    }

    #[test]
    fn remainder_larger_than_one_allocation_is_an_error() {
        // one slice = 256 bytes fits, but 3 of 4 slices land in the second region
        let err = BufferPlanner::plan(Dims::new(4, 4, 4), &profile(VectorPrecision::Float32, false, 300)).unwrap_err();
        assert!(matches!(
            err,
            DeviceError::Allocation {
                label: "vector field second region",
                ..
            }
        ));
    }

    #[test]
    fn assemble_places_regions_on_either_side_of_split() {
        let dims = Dims::new(2, 2, 3);
        let plan = VectorFieldPlan {
            dims,
            total_voxels: 12,
            bytes_per_component: 4,
            device_max_alloc_bytes: 128,
            mode: PlanMode::Split {
                split_z: 2,
                first_voxels: 8,
                second_voxels: 4,
            },
        };
        let first = vec![1.0f32; 8 * COMPONENTS];
        let second = vec![2.0f32; 4 * COMPONENTS];
        let mut target = Array4::zeros((3, 2, 2, COMPONENTS));
        plan.assemble(&first, &second, &mut target).unwrap();
        assert_eq!(target[[1, 1, 1, 3]], 1.0);
        assert_eq!(target[[2, 0, 0, 0]], 2.0);

        let mut wrong = Array4::zeros((2, 2, 2, COMPONENTS));
        assert!(plan.assemble(&first, &second, &mut wrong).is_err());
    }
}
