//! The fixed-size cache registry.

use crate::{SlabCache, SlabError};
use kernel_vmem::{FrameAlloc, PhysMapper};
use log::info;

/// Maximum number of caches the kernel can create.
pub const MAX_CACHES: usize = 16;

/// A small, fixed table of named caches, looked up by name or by the id
/// handed out at creation.
pub struct SlabRegistry {
    caches: [Option<SlabCache>; MAX_CACHES],
}

impl Default for SlabRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SlabRegistry {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            caches: [const { None }; MAX_CACHES],
        }
    }

    /// Create a cache and return its id.
    ///
    /// # Errors
    /// - [`SlabError::CacheFull`] once all slots are taken.
    /// - [`SlabError::AlreadyInit`] for a duplicate name.
    /// - Size/alignment errors from [`SlabCache::new`].
    pub fn create(
        &mut self,
        name: &'static str,
        obj_size: u32,
        align: u32,
    ) -> Result<u32, SlabError> {
        if self.find(name).is_some() {
            return Err(SlabError::AlreadyInit);
        }
        let slot = self
            .caches
            .iter()
            .position(Option::is_none)
            .ok_or(SlabError::CacheFull)?;
        #[allow(clippy::cast_possible_truncation)]
        let id = slot as u32;
        let cache = SlabCache::new(name, id, obj_size, align)?;
        info!(
            "slab: cache '{name}' ({obj_size} B, {} per slab)",
            cache.objects_per_slab()
        );
        self.caches[slot] = Some(cache);
        Ok(id)
    }

    /// Find a cache id by name.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<u32> {
        self.caches.iter().enumerate().find_map(|(i, c)| {
            #[allow(clippy::cast_possible_truncation)]
            c.as_ref().filter(|c| c.name() == name).map(|_| i as u32)
        })
    }

    /// Borrow a cache by id.
    #[must_use]
    pub fn get(&self, id: u32) -> Option<&SlabCache> {
        self.caches.get(id as usize)?.as_ref()
    }

    /// Borrow a cache mutably by id.
    #[must_use]
    pub fn get_mut(&mut self, id: u32) -> Option<&mut SlabCache> {
        self.caches.get_mut(id as usize)?.as_mut()
    }

    /// Tear down a cache, returning its pages to `frames`.
    ///
    /// # Errors
    /// - [`SlabError::NotFound`] for an unknown id.
    /// - [`SlabError::Invalid`] while objects are live.
    pub fn destroy<M: PhysMapper>(
        &mut self,
        id: u32,
        mapper: &M,
        frames: &mut impl FrameAlloc,
    ) -> Result<(), SlabError> {
        let cache = self
            .caches
            .get_mut(id as usize)
            .and_then(Option::as_mut)
            .ok_or(SlabError::NotFound)?;
        cache.destroy(mapper, frames)?;
        self.caches[id as usize] = None;
        Ok(())
    }
}
