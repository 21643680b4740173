//! Staging slot pool
//!
//! `S` fixed slots, each a vertex counter plus a vertex range big enough for
//! the worst-case region. All counters share one buffer and all vertex ranges
//! share another, each at a per-slot stride rounded up to the device's
//! storage offset alignment. A readback buffer receives the counters at the
//! end of every meshing batch.

use crate::core::{Error, Result};
use crate::gpu::{
    align_up, BindingDesc, BindingHandle, BindingLayout, BindingResource, BufferDesc,
    BufferHandle, BufferKind, GpuBackend,
};
use crate::voxel::{RegionId, RegionVertex, MAX_VERTICES_PER_REGION};

/// Bytes per vertex counter
pub const COUNTER_SIZE: u64 = std::mem::size_of::<u32>() as u64;

/// Per-slot byte layout inside the shared staging buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagingLayout {
    pub slots: u32,
    pub counter_stride: u64,
    pub vertex_stride: u64,
    /// Vertices one slot can hold
    pub slot_capacity: u32,
}

impl StagingLayout {
    pub fn new(slots: u32, alignment: u32, slot_capacity: u32) -> Self {
        let alignment = alignment.max(1) as u64;
        Self {
            slots,
            counter_stride: align_up(COUNTER_SIZE, alignment),
            vertex_stride: align_up(slot_capacity as u64 * RegionVertex::SIZE, alignment),
            slot_capacity,
        }
    }

    pub fn counter_offset(&self, slot: u32) -> u64 {
        slot as u64 * self.counter_stride
    }

    pub fn vertex_offset(&self, slot: u32) -> u64 {
        slot as u64 * self.vertex_stride
    }

    /// Offset of a slot's count in the readback buffer
    pub fn readback_offset(&self, slot: u32) -> u64 {
        slot as u64 * COUNTER_SIZE
    }

    /// Bytes of staging memory; depends only on the slot count
    pub fn total_bytes(&self) -> u64 {
        self.slots as u64 * (self.counter_stride + self.vertex_stride + COUNTER_SIZE)
    }
}

/// Fixed pool of reusable staging slots
pub struct StagingPool {
    layout: StagingLayout,
    counters: BufferHandle,
    vertices: BufferHandle,
    readback: BufferHandle,
    bindings: Vec<BindingHandle>,
    leases: Vec<Option<RegionId>>,
}

impl StagingPool {
    /// Allocate `slots` slots sized for the worst-case region
    pub fn new<B: GpuBackend + ?Sized>(backend: &mut B, slots: u32) -> Result<Self> {
        Self::with_capacity(backend, slots, MAX_VERTICES_PER_REGION)
    }

    /// Allocate `slots` slots holding `slot_capacity` vertices each
    pub fn with_capacity<B: GpuBackend + ?Sized>(backend: &mut B, slots: u32, slot_capacity: u32) -> Result<Self> {
        if slots == 0 {
            return Err(Error::Config("staging pool needs at least one slot".into()));
        }
        let limits = backend.limits();
        let layout = StagingLayout::new(slots, limits.min_storage_buffer_offset_alignment, slot_capacity);

        let slot_bytes = slot_capacity as u64 * RegionVertex::SIZE;
        if slot_bytes > limits.max_storage_buffer_binding_size {
            return Err(Error::ResourceCreation(format!(
                "staging slot of {slot_bytes} bytes exceeds max_storage_buffer_binding_size {}",
                limits.max_storage_buffer_binding_size
            )));
        }

        let counters = backend.create_buffer(&BufferDesc {
            label: "staging_counters".into(),
            size: layout.counter_stride * slots as u64,
            kind: BufferKind::StagingCounter,
        })?;
        let vertices = match backend.create_buffer(&BufferDesc {
            label: "staging_vertices".into(),
            size: layout.vertex_stride * slots as u64,
            kind: BufferKind::StagingVertices,
        }) {
            Ok(buffer) => buffer,
            Err(e) => {
                let _ = backend.destroy_buffer(counters);
                return Err(e);
            }
        };
        let readback = match backend.create_buffer(&BufferDesc {
            label: "staging_readback".into(),
            size: COUNTER_SIZE * slots as u64,
            kind: BufferKind::Readback,
        }) {
            Ok(buffer) => buffer,
            Err(e) => {
                let _ = backend.destroy_buffer(vertices);
                let _ = backend.destroy_buffer(counters);
                return Err(e);
            }
        };

        let mut pool = Self {
            layout,
            counters,
            vertices,
            readback,
            bindings: Vec::with_capacity(slots as usize),
            leases: vec![None; slots as usize],
        };

        for slot in 0..slots {
            let binding = backend.create_binding(&BindingDesc {
                label: format!("staging_slot_{slot}"),
                layout: BindingLayout::StagingSlot,
                resources: vec![
                    BindingResource::Buffer {
                        buffer: counters,
                        offset: layout.counter_offset(slot),
                        size: Some(COUNTER_SIZE),
                    },
                    BindingResource::Buffer {
                        buffer: vertices,
                        offset: layout.vertex_offset(slot),
                        size: Some(slot_bytes),
                    },
                ],
            });
            match binding {
                Ok(binding) => pool.bindings.push(binding),
                Err(e) => {
                    let _ = pool.release(backend);
                    return Err(e);
                }
            }
        }

        log::info!(
            "Staging pool: {} slots x {} vertices, {:.1} MB",
            slots,
            slot_capacity,
            layout.total_bytes() as f64 / (1024.0 * 1024.0)
        );
        Ok(pool)
    }

    /// Free bindings, then buffers
    pub fn release<B: GpuBackend + ?Sized>(self, backend: &mut B) -> Result<()> {
        let mut first_error = None;
        for binding in self.bindings {
            if let Err(e) = backend.destroy_binding(binding) {
                first_error.get_or_insert(e);
            }
        }
        for buffer in [self.readback, self.vertices, self.counters] {
            if let Err(e) = backend.destroy_buffer(buffer) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn layout(&self) -> &StagingLayout {
        &self.layout
    }

    pub fn slot_count(&self) -> u32 {
        self.layout.slots
    }

    pub fn counters(&self) -> BufferHandle {
        self.counters
    }

    pub fn vertices(&self) -> BufferHandle {
        self.vertices
    }

    pub fn readback(&self) -> BufferHandle {
        self.readback
    }

    pub fn binding(&self, slot: u32) -> Result<BindingHandle> {
        self.bindings
            .get(slot as usize)
            .copied()
            .ok_or_else(|| Error::InvalidHandle(format!("staging slot {slot}")))
    }

    /// Give `slot` to `region`; fails if the slot is already leased
    pub fn lease(&mut self, slot: u32, region: RegionId) -> Result<()> {
        let lease = self
            .leases
            .get_mut(slot as usize)
            .ok_or_else(|| Error::InvalidHandle(format!("staging slot {slot}")))?;
        if let Some(holder) = lease {
            return Err(Error::InvalidHandle(format!(
                "staging slot {slot} still leased to {holder}, cannot lease to {region}"
            )));
        }
        *lease = Some(region);
        Ok(())
    }

    pub fn release_slot(&mut self, slot: u32) {
        if let Some(lease) = self.leases.get_mut(slot as usize) {
            *lease = None;
        }
    }

    pub fn holder(&self, slot: u32) -> Option<RegionId> {
        self.leases.get(slot as usize).copied().flatten()
    }

    pub fn leased(&self) -> usize {
        self.leases.iter().filter(|l| l.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{DeviceLimits, SoftwareBackend};

    #[test]
    fn test_layout_strides_aligned() {
        let layout = StagingLayout::new(8, 256, MAX_VERTICES_PER_REGION);
        assert_eq!(layout.counter_stride, 256);
        assert_eq!(layout.vertex_stride % 256, 0);
        assert!(layout.vertex_stride >= MAX_VERTICES_PER_REGION as u64 * RegionVertex::SIZE);
        assert_eq!(layout.counter_offset(3), 768);
        assert_eq!(layout.vertex_offset(2), 2 * layout.vertex_stride);
        assert_eq!(layout.readback_offset(5), 20);
    }

    #[test]
    fn test_unaligned_capacity_rounds_up() {
        let layout = StagingLayout::new(2, 256, 3);
        assert_eq!(layout.vertex_stride, 256);
        let layout = StagingLayout::new(2, 64, 5);
        assert_eq!(layout.vertex_stride, 192);
    }

    #[test]
    fn test_pool_memory_independent_of_region_count() {
        let mut backend = SoftwareBackend::new();
        let pool = StagingPool::with_capacity(&mut backend, 4, 64).unwrap();
        let live = backend.live_resources();
        assert_eq!((live.buffers, live.bindings), (3, 4));
        assert_eq!(
            backend.buffer_size(pool.vertices()).unwrap(),
            4 * pool.layout().vertex_stride
        );

        pool.release(&mut backend).unwrap();
        assert_eq!(backend.live_resources(), Default::default());
    }

    #[test]
    fn test_lease_is_exclusive() {
        let mut backend = SoftwareBackend::new();
        let mut pool = StagingPool::with_capacity(&mut backend, 2, 64).unwrap();

        pool.lease(0, RegionId(4)).unwrap();
        assert_eq!(pool.holder(0), Some(RegionId(4)));
        assert!(pool.lease(0, RegionId(5)).is_err());
        assert!(pool.lease(2, RegionId(5)).is_err());
        assert_eq!(pool.leased(), 1);

        pool.release_slot(0);
        pool.lease(0, RegionId(5)).unwrap();
        assert_eq!(pool.holder(0), Some(RegionId(5)));
    }

    #[test]
    fn test_slot_exceeding_binding_limit() {
        let limits = DeviceLimits {
            max_storage_buffer_binding_size: 1024,
            ..Default::default()
        };
        let mut backend = SoftwareBackend::with_limits(limits);
        let result = StagingPool::with_capacity(&mut backend, 2, 64);
        assert!(matches!(result, Err(Error::ResourceCreation(_))));
        assert_eq!(backend.live_resources(), Default::default());
    }

    #[test]
    fn test_zero_slots_rejected() {
        let mut backend = SoftwareBackend::new();
        assert!(matches!(StagingPool::new(&mut backend, 0), Err(Error::Config(_))));
    }
}
