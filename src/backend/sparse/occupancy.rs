// Residency of sparse images with a residency scope
//
// One record per group of aspects. Aspects whose driver-reported
// requirements overlap (combined depth/stencil, typically) share a record.
// A record holds, per layer, a tile grid for each mip below the mip tail and
// one slot per mip tail page. The metadata aspect, when the driver reports
// one, is tracked separately and always bound as a whole.

use anyhow::Result;
use ash::vk;

use super::SparseBinding;
use crate::AnvilError;

fn region_error(message: String) -> anyhow::Error {
    AnvilError::InvalidSparseRegion(message).into()
}

pub(crate) fn mip_extent(extent: vk::Extent3D, mip: u32) -> vk::Extent3D {
    vk::Extent3D {
        width: (extent.width >> mip).max(1),
        height: (extent.height >> mip).max(1),
        depth: (extent.depth >> mip).max(1),
    }
}

#[derive(Clone, Debug)]
struct TileGrid {
    /// Number of tiles along each axis.
    tiles: vk::Extent3D,
    slots: Vec<Option<SparseBinding>>,
}

impl TileGrid {
    fn new(mip: vk::Extent3D, granularity: vk::Extent3D) -> Self {
        let tiles = vk::Extent3D {
            width: mip.width.div_ceil(granularity.width.max(1)),
            height: mip.height.div_ceil(granularity.height.max(1)),
            depth: mip.depth.div_ceil(granularity.depth.max(1)),
        };
        let count = tiles.width as usize * tiles.height as usize * tiles.depth as usize;
        Self {
            tiles,
            slots: vec![None; count],
        }
    }

    fn index(&self, x: u32, y: u32, z: u32) -> usize {
        ((z * self.tiles.height + y) * self.tiles.width + x) as usize
    }
}

/// Residency of one aspect group.
#[derive(Clone, Debug)]
pub struct AspectOccupancy {
    aspects: vk::ImageAspectFlags,
    granularity: vk::Extent3D,
    mip_tail_first_lod: u32,
    mip_tail_offset: vk::DeviceSize,
    mip_tail_size: vk::DeviceSize,
    mip_tail_stride: vk::DeviceSize,
    single_miptail: bool,
    /// One entry per layer, or a single one for a single mip tail.
    tails: Vec<Vec<Option<SparseBinding>>>,
    /// `mips[layer][mip]` for every mip below the tail.
    mips: Vec<Vec<TileGrid>>,
}

impl AspectOccupancy {
    fn new(
        requirements: &vk::SparseImageMemoryRequirements,
        extent: vk::Extent3D,
        mip_levels: u32,
        array_layers: u32,
        page_size: vk::DeviceSize,
    ) -> Self {
        let properties = &requirements.format_properties;
        let single_miptail = properties
            .flags
            .contains(vk::SparseImageFormatFlags::SINGLE_MIPTAIL);
        let first_lod = requirements.image_mip_tail_first_lod.min(mip_levels);
        let tail_pages = requirements.image_mip_tail_size.div_ceil(page_size) as usize;
        let tail_count = if single_miptail { 1 } else { array_layers as usize };

        let mips = (0..array_layers)
            .map(|_| {
                (0..first_lod)
                    .map(|mip| TileGrid::new(mip_extent(extent, mip), properties.image_granularity))
                    .collect()
            })
            .collect();

        Self {
            aspects: properties.aspect_mask,
            granularity: properties.image_granularity,
            mip_tail_first_lod: first_lod,
            mip_tail_offset: requirements.image_mip_tail_offset,
            mip_tail_size: requirements.image_mip_tail_size,
            mip_tail_stride: requirements.image_mip_tail_stride,
            single_miptail,
            tails: vec![vec![None; tail_pages]; tail_count],
            mips,
        }
    }

    pub fn aspects(&self) -> vk::ImageAspectFlags {
        self.aspects
    }

    pub fn granularity(&self) -> vk::Extent3D {
        self.granularity
    }

    pub fn mip_tail_first_lod(&self) -> u32 {
        self.mip_tail_first_lod
    }

    pub fn mip_tail_size(&self) -> vk::DeviceSize {
        self.mip_tail_size
    }

    /// Resource offset of the mip tail used by `layer`.
    pub fn mip_tail_offset(&self, layer: u32) -> vk::DeviceSize {
        if self.single_miptail {
            self.mip_tail_offset
        } else {
            self.mip_tail_offset + u64::from(layer) * self.mip_tail_stride
        }
    }

    fn tail_index(&self, layer: u32) -> usize {
        if self.single_miptail {
            0
        } else {
            layer as usize
        }
    }

    /// Which tail `[offset, offset + size)` falls into, as (tail, first page).
    fn locate_tail(
        &self,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
        page_size: vk::DeviceSize,
    ) -> Option<(usize, usize)> {
        if self.mip_tail_size == 0 {
            return None;
        }
        (0..self.tails.len() as u32).find_map(|layer| {
            let start = self.mip_tail_offset(layer);
            let end = start + self.mip_tail_size;
            (offset >= start && offset + size <= end)
                .then(|| (self.tail_index(layer), ((offset - start) / page_size) as usize))
        })
    }

    fn tail_bound(&self, layer: u32) -> bool {
        self.tails
            .get(self.tail_index(layer))
            .map_or(false, |pages| pages.iter().all(|p| p.as_ref().map_or(false, SparseBinding::is_bound)))
    }
}

/// Metadata mip tail.
#[derive(Clone, Debug)]
struct MetadataTail {
    offset: vk::DeviceSize,
    size: vk::DeviceSize,
    stride: vk::DeviceSize,
    single: bool,
    slots: Vec<Option<SparseBinding>>,
}

#[derive(Clone, Debug)]
pub struct SparseImageOccupancy {
    extent: vk::Extent3D,
    mip_levels: u32,
    array_layers: u32,
    page_size: vk::DeviceSize,
    aspects: Vec<AspectOccupancy>,
    metadata: Option<MetadataTail>,
}

impl SparseImageOccupancy {
    pub fn new(
        extent: vk::Extent3D,
        mip_levels: u32,
        array_layers: u32,
        page_size: vk::DeviceSize,
        requirements: &[vk::SparseImageMemoryRequirements],
    ) -> Self {
        let page_size = page_size.max(1);
        let mut aspects: Vec<AspectOccupancy> = Vec::new();
        let mut metadata = None;

        for requirement in requirements {
            let mask = requirement.format_properties.aspect_mask;
            if mask.contains(vk::ImageAspectFlags::METADATA) {
                let single = requirement
                    .format_properties
                    .flags
                    .contains(vk::SparseImageFormatFlags::SINGLE_MIPTAIL);
                metadata = Some(MetadataTail {
                    offset: requirement.image_mip_tail_offset,
                    size: requirement.image_mip_tail_size,
                    stride: requirement.image_mip_tail_stride,
                    single,
                    slots: vec![None; if single { 1 } else { array_layers as usize }],
                });
                continue;
            }

            match aspects.iter_mut().find(|a| a.aspects.intersects(mask)) {
                Some(shared) => shared.aspects |= mask,
                None => aspects.push(AspectOccupancy::new(
                    requirement,
                    extent,
                    mip_levels,
                    array_layers,
                    page_size,
                )),
            }
        }

        Self {
            extent,
            mip_levels,
            array_layers,
            page_size,
            aspects,
            metadata,
        }
    }

    pub fn page_size(&self) -> vk::DeviceSize {
        self.page_size
    }

    pub fn aspect(&self, aspect: vk::ImageAspectFlags) -> Option<&AspectOccupancy> {
        self.aspects.iter().find(|a| a.aspects.contains(aspect))
    }

    pub fn aspect_records(&self) -> &[AspectOccupancy] {
        &self.aspects
    }

    pub fn has_metadata(&self) -> bool {
        self.metadata.is_some()
    }

    fn aspect_index(&self, aspect: vk::ImageAspectFlags) -> Result<usize> {
        self.aspects
            .iter()
            .position(|a| a.aspects.contains(aspect))
            .ok_or_else(|| region_error(format!("image has no sparse aspect {:?}", aspect)))
    }

    /// Check a tile-aligned region of one subresource.
    pub fn validate_tiles(
        &self,
        subresource: vk::ImageSubresource,
        offset: vk::Offset3D,
        extent: vk::Extent3D,
    ) -> Result<()> {
        let record = &self.aspects[self.aspect_index(subresource.aspect_mask)?];

        if subresource.array_layer >= self.array_layers || subresource.mip_level >= self.mip_levels {
            return Err(region_error(format!(
                "subresource (layer {}, mip {}) out of range",
                subresource.array_layer, subresource.mip_level
            )));
        }
        if subresource.mip_level >= record.mip_tail_first_lod {
            return Err(region_error(format!(
                "mip {} lies in the mip tail and must be bound as opaque memory",
                subresource.mip_level
            )));
        }

        let mip = mip_extent(self.extent, subresource.mip_level);
        let g = record.granularity;
        let axes = [
            (offset.x, extent.width, mip.width, g.width, "x"),
            (offset.y, extent.height, mip.height, g.height, "y"),
            (offset.z, extent.depth, mip.depth, g.depth, "z"),
        ];
        for (start, len, dim, granularity, axis) in axes {
            let Ok(start) = u32::try_from(start) else {
                return Err(region_error(format!("negative {} offset", axis)));
            };
            let end = start.checked_add(len).filter(|end| len > 0 && *end <= dim);
            let Some(end) = end else {
                return Err(region_error(format!(
                    "{} range {}+{} outside mip size {}",
                    axis, start, len, dim
                )));
            };
            if start % granularity != 0 || (end != dim && len % granularity != 0) {
                return Err(region_error(format!(
                    "{} range {}+{} not aligned to tile size {}",
                    axis, start, len, granularity
                )));
            }
        }
        Ok(())
    }

    /// Store `binding` in every tile of the region. Tiles take consecutive
    /// pages of memory, x fastest.
    pub fn update_tiles(
        &mut self,
        subresource: vk::ImageSubresource,
        offset: vk::Offset3D,
        extent: vk::Extent3D,
        binding: Option<SparseBinding>,
    ) -> Result<()> {
        self.validate_tiles(subresource, offset, extent)?;
        let page_size = self.page_size;
        let index = self.aspect_index(subresource.aspect_mask)?;
        let record = &mut self.aspects[index];
        let g = record.granularity;
        let grid = &mut record.mips[subresource.array_layer as usize][subresource.mip_level as usize];

        let first = [offset.x as u32 / g.width, offset.y as u32 / g.height, offset.z as u32 / g.depth];
        let count = [
            extent.width.div_ceil(g.width),
            extent.height.div_ceil(g.height),
            extent.depth.div_ceil(g.depth),
        ];

        let mut n = 0u64;
        for z in first[2]..first[2] + count[2] {
            for y in first[1]..first[1] + count[1] {
                for x in first[0]..first[0] + count[0] {
                    let slot = grid.index(x, y, z);
                    grid.slots[slot] = binding.as_ref().map(|b| SparseBinding {
                        block: b.block.clone(),
                        memory_offset: b.memory_offset + n * page_size,
                    });
                    n += 1;
                }
            }
        }
        Ok(())
    }

    /// Check an opaque update against the mip tails and the metadata tail.
    pub fn validate_opaque(
        &self,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
        flags: vk::SparseMemoryBindFlags,
    ) -> Result<()> {
        if flags.contains(vk::SparseMemoryBindFlags::METADATA) {
            return self.locate_metadata(offset, size).map(|_| ());
        }
        if size == 0 || offset % self.page_size != 0 {
            return Err(region_error(format!(
                "opaque range at {} is empty or not page aligned",
                offset
            )));
        }
        if self
            .aspects
            .iter()
            .any(|a| a.locate_tail(offset, size, self.page_size).is_some())
        {
            Ok(())
        } else {
            Err(region_error(format!(
                "opaque range [{}, {}+{}) is not inside any mip tail",
                offset, offset, size
            )))
        }
    }

    fn locate_metadata(&self, offset: vk::DeviceSize, size: vk::DeviceSize) -> Result<usize> {
        let Some(metadata) = &self.metadata else {
            return Err(region_error("image has no metadata aspect".to_string()));
        };
        (0..metadata.slots.len())
            .find(|slot| {
                let start = if metadata.single {
                    metadata.offset
                } else {
                    metadata.offset + *slot as u64 * metadata.stride
                };
                start == offset && size == metadata.size
            })
            .ok_or_else(|| {
                region_error(format!(
                    "metadata binds cover a whole metadata tail ({} bytes at {})",
                    metadata.size, metadata.offset
                ))
            })
    }

    /// Bind or unbind mip tail pages, or the metadata tail when `flags`
    /// carries METADATA.
    pub fn update_opaque(
        &mut self,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
        flags: vk::SparseMemoryBindFlags,
        binding: Option<SparseBinding>,
    ) -> Result<()> {
        self.validate_opaque(offset, size, flags)?;

        if flags.contains(vk::SparseMemoryBindFlags::METADATA) {
            let slot = self.locate_metadata(offset, size)?;
            if let Some(metadata) = &mut self.metadata {
                metadata.slots[slot] = binding;
            }
            return Ok(());
        }

        let page_size = self.page_size;
        for record in &mut self.aspects {
            if let Some((tail, first_page)) = record.locate_tail(offset, size, page_size) {
                let pages = size.div_ceil(page_size) as usize;
                for (i, page) in record.tails[tail][first_page..first_page + pages]
                    .iter_mut()
                    .enumerate()
                {
                    *page = binding.as_ref().map(|b| SparseBinding {
                        block: b.block.clone(),
                        memory_offset: b.memory_offset + i as u64 * page_size,
                    });
                }
            }
        }
        Ok(())
    }

    /// Is the texel at `(x, y, z)` of the given subresource backed by memory?
    /// Texels in the mip tail are bound when the whole tail is.
    pub fn is_memory_bound_for_texel(
        &self,
        aspect: vk::ImageAspectFlags,
        layer: u32,
        mip: u32,
        x: u32,
        y: u32,
        z: u32,
    ) -> bool {
        let Some(record) = self.aspect(aspect) else {
            return false;
        };
        if layer >= self.array_layers || mip >= self.mip_levels {
            return false;
        }
        let dims = mip_extent(self.extent, mip);
        if x >= dims.width || y >= dims.height || z >= dims.depth {
            return false;
        }
        if mip >= record.mip_tail_first_lod {
            return record.tail_bound(layer);
        }

        let g = record.granularity;
        let grid = &record.mips[layer as usize][mip as usize];
        grid.slots[grid.index(x / g.width, y / g.height, z / g.depth)]
            .as_ref()
            .map_or(false, SparseBinding::is_bound)
    }

    /// Every page of the mip tail used by `layer` is bound.
    pub fn is_mip_tail_bound(&self, aspect: vk::ImageAspectFlags, layer: u32) -> bool {
        self.aspect(aspect).map_or(false, |a| a.tail_bound(layer))
    }

    /// Number of tail pages of `layer` that are currently bound.
    pub fn bound_tail_pages(&self, aspect: vk::ImageAspectFlags, layer: u32) -> usize {
        self.aspect(aspect)
            .and_then(|a| a.tails.get(a.tail_index(layer)))
            .map_or(0, |pages| {
                pages
                    .iter()
                    .filter(|p| p.as_ref().map_or(false, SparseBinding::is_bound))
                    .count()
            })
    }

    pub fn is_metadata_bound(&self) -> bool {
        self.metadata.as_ref().map_or(false, |m| {
            m.slots
                .iter()
                .all(|s| s.as_ref().map_or(false, SparseBinding::is_bound))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: vk::DeviceSize = 0x10000;

    fn requirement(
        aspect: vk::ImageAspectFlags,
        first_lod: u32,
        tail_offset: vk::DeviceSize,
        stride: vk::DeviceSize,
        flags: vk::SparseImageFormatFlags,
    ) -> vk::SparseImageMemoryRequirements {
        vk::SparseImageMemoryRequirements {
            format_properties: vk::SparseImageFormatProperties {
                aspect_mask: aspect,
                image_granularity: vk::Extent3D {
                    width: 128,
                    height: 128,
                    depth: 1,
                },
                flags,
            },
            image_mip_tail_first_lod: first_lod,
            image_mip_tail_size: PAGE,
            image_mip_tail_offset: tail_offset,
            image_mip_tail_stride: stride,
        }
    }

    fn extent() -> vk::Extent3D {
        vk::Extent3D {
            width: 256,
            height: 256,
            depth: 1,
        }
    }

    #[test]
    fn overlapping_aspects_share_a_record() {
        let occupancy = SparseImageOccupancy::new(
            extent(),
            3,
            1,
            PAGE,
            &[
                requirement(
                    vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
                    2,
                    5 * PAGE,
                    6 * PAGE,
                    vk::SparseImageFormatFlags::empty(),
                ),
                requirement(
                    vk::ImageAspectFlags::STENCIL,
                    2,
                    5 * PAGE,
                    6 * PAGE,
                    vk::SparseImageFormatFlags::empty(),
                ),
            ],
        );
        assert_eq!(occupancy.aspect_records().len(), 1);
        assert!(occupancy.aspect(vk::ImageAspectFlags::STENCIL).is_some());
    }

    #[test]
    fn tail_mips_must_be_bound_opaquely() {
        let occupancy = SparseImageOccupancy::new(
            extent(),
            3,
            1,
            PAGE,
            &[requirement(
                vk::ImageAspectFlags::COLOR,
                2,
                5 * PAGE,
                6 * PAGE,
                vk::SparseImageFormatFlags::empty(),
            )],
        );
        let subresource = vk::ImageSubresource {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 2,
            array_layer: 0,
        };
        assert!(occupancy
            .validate_tiles(subresource, vk::Offset3D::default(), vk::Extent3D { width: 64, height: 64, depth: 1 })
            .is_err());

        // Mip 1 is 128x128: exactly one tile.
        let mip1 = vk::ImageSubresource { mip_level: 1, ..subresource };
        assert!(occupancy
            .validate_tiles(mip1, vk::Offset3D::default(), vk::Extent3D { width: 128, height: 128, depth: 1 })
            .is_ok());
        assert!(occupancy
            .validate_tiles(mip1, vk::Offset3D { x: 64, y: 0, z: 0 }, vk::Extent3D { width: 64, height: 128, depth: 1 })
            .is_err());
    }

    #[test]
    fn single_miptail_is_shared_by_all_layers() {
        let occupancy = SparseImageOccupancy::new(
            extent(),
            3,
            4,
            PAGE,
            &[requirement(
                vk::ImageAspectFlags::COLOR,
                2,
                20 * PAGE,
                0,
                vk::SparseImageFormatFlags::SINGLE_MIPTAIL,
            )],
        );
        let record = occupancy.aspect(vk::ImageAspectFlags::COLOR).unwrap();
        assert_eq!(record.mip_tail_offset(3), 20 * PAGE);
        assert!(occupancy
            .validate_opaque(20 * PAGE, PAGE, vk::SparseMemoryBindFlags::empty())
            .is_ok());
        assert!(occupancy
            .validate_opaque(21 * PAGE, PAGE, vk::SparseMemoryBindFlags::empty())
            .is_err());
    }
}
