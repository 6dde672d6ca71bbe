//! Textures with explicit layout tracking, and render targets built from them.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use slotmap::{new_key_type, SlotMap};

use super::reclaim::{ReclaimQueue, Retired};
use super::TransferSink;
use crate::device::{
    BufferUsage, CommandBufferHandle, DeviceResult, GpuDevice, ImageDesc, ImageHandle, ImageLayout, ImageUsage,
    MemoryLocation, SamplerFilter, SamplerHandle, TextureFormat,
};
use crate::error::{RenderError, RenderResult};

new_key_type! {
    pub struct TextureId;
    pub struct RenderTargetId;
}

const UPLOADED_USAGE: ImageUsage = ImageUsage::SAMPLED
    .union(ImageUsage::TRANSFER_DST)
    .union(ImageUsage::STORAGE);

/// Image currently backing a texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureState {
    pub image: ImageHandle,
    pub width: u32,
    pub height: u32,
    pub layout: ImageLayout,
}

pub struct Texture {
    pub name: String,
    pub format: TextureFormat,
    state: Mutex<TextureState>,
}

impl Texture {
    fn new(name: &str, format: TextureFormat, state: TextureState) -> Self {
        Self {
            name: name.to_string(),
            format,
            state: Mutex::new(state),
        }
    }

    pub fn state(&self) -> TextureState {
        *self.state.lock()
    }

    /// Move the image to `layout`, recording a barrier only when it is not
    /// already there. Returns the image and whether a barrier was recorded,
    /// or `None` if the texture has no image yet.
    pub fn transition(
        &self,
        device: &dyn GpuDevice,
        cmd: CommandBufferHandle,
        layout: ImageLayout,
    ) -> Option<(ImageHandle, bool)> {
        let mut state = self.state.lock();
        if state.image.is_null() {
            return None;
        }
        if state.layout == layout {
            return Some((state.image, false));
        }
        device.cmd_image_barrier(cmd, state.image, state.layout, layout);
        state.layout = layout;
        Some((state.image, true))
    }

    /// Whether reading the texture now would require a transition first.
    pub fn needs_transition(&self, layout: ImageLayout) -> bool {
        let state = self.state.lock();
        !state.image.is_null() && state.layout != layout
    }
}

/// Color and depth attachments drawn into together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderTarget {
    pub width: u32,
    pub height: u32,
    pub color: Option<TextureId>,
    pub depth: Option<TextureId>,
}

pub struct TexturePool {
    textures: RwLock<SlotMap<TextureId, Arc<Texture>>>,
    targets: RwLock<SlotMap<RenderTargetId, RenderTarget>>,
    sampler: SamplerHandle,
}

impl TexturePool {
    pub fn new(device: &dyn GpuDevice) -> DeviceResult<Self> {
        Ok(Self {
            textures: RwLock::new(SlotMap::with_key()),
            targets: RwLock::new(SlotMap::with_key()),
            sampler: device.create_sampler(SamplerFilter::Linear, true)?,
        })
    }

    /// Sampler used for every sampled texture.
    pub fn sampler(&self) -> SamplerHandle {
        self.sampler
    }

    /// Register a texture with no image. It samples as the default texture
    /// until its first upload.
    pub fn create(&self, name: &str) -> TextureId {
        let state = TextureState {
            image: ImageHandle::NULL,
            width: 0,
            height: 0,
            layout: ImageLayout::Undefined,
        };
        self.textures
            .write()
            .insert(Arc::new(Texture::new(name, TextureFormat::Rgba8Unorm, state)))
    }

    pub fn get(&self, id: TextureId) -> Option<Arc<Texture>> {
        self.textures.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.textures.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace a texture's pixels with tightly packed RGBA8 data. The copy
    /// and its transitions go on the transfer commands. Returns `false` if
    /// `rgba` does not match the dimensions.
    #[allow(clippy::too_many_arguments)]
    pub fn upload(
        &self,
        device: &dyn GpuDevice,
        id: TextureId,
        width: u32,
        height: u32,
        rgba: &[u8],
        frame: u64,
        sink: &mut dyn TransferSink,
        reclaim: &ReclaimQueue,
    ) -> RenderResult<bool> {
        let texture = self.get(id).ok_or_else(|| {
            log::warn!("Texture: upload to unknown texture {:?}", id);
            RenderError::ResourceNotFound(format!("texture {:?}", id))
        })?;
        let expected = width as usize * height as usize * 4;
        if width == 0 || height == 0 || rgba.len() != expected {
            log::warn!(
                "Texture: {} upload of {} bytes does not match {}x{}",
                texture.name,
                rgba.len(),
                width,
                height
            );
            return Ok(false);
        }

        let mut state = texture.state.lock();
        if state.image.is_null() || state.width != width || state.height != height {
            if !state.image.is_null() {
                reclaim.retire(frame, Retired::Image(state.image));
            }
            let desc = ImageDesc {
                width,
                height,
                format: texture.format,
                usage: UPLOADED_USAGE,
            };
            *state = TextureState {
                image: device.create_image(&desc, &texture.name)?,
                width,
                height,
                layout: ImageLayout::Undefined,
            };
        }

        let staging = device.create_buffer(
            rgba.len() as u64,
            BufferUsage::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
            "lumen texture staging",
        )?;
        reclaim.retire(frame, Retired::Buffer(staging));
        device.write_buffer(staging, 0, rgba)?;

        let cmd = sink.transfer_commands(device)?;
        device.cmd_image_barrier(cmd, state.image, state.layout, ImageLayout::TransferDst);
        device.cmd_copy_buffer_to_image(cmd, staging, state.image, width, height);
        device.cmd_image_barrier(cmd, state.image, ImageLayout::TransferDst, ImageLayout::ShaderRead);
        state.layout = ImageLayout::ShaderRead;
        Ok(true)
    }

    /// Remove a texture, retiring its image.
    pub fn dispose(&self, id: TextureId, frame: u64, reclaim: &ReclaimQueue) -> bool {
        match self.textures.write().remove(id) {
            Some(texture) => {
                let state = texture.state();
                if !state.image.is_null() {
                    reclaim.retire(frame, Retired::Image(state.image));
                }
                true
            }
            None => {
                log::warn!("Texture: dispose of unknown texture {:?}", id);
                false
            }
        }
    }

    pub fn create_render_target(
        &self,
        device: &dyn GpuDevice,
        name: &str,
        width: u32,
        height: u32,
        color: bool,
        depth: bool,
    ) -> RenderResult<RenderTargetId> {
        let attach = |format: TextureFormat, usage: ImageUsage, suffix: &str| -> RenderResult<TextureId> {
            let label = format!("{} {}", name, suffix);
            let image = device.create_image(
                &ImageDesc {
                    width,
                    height,
                    format,
                    usage,
                },
                &label,
            )?;
            let state = TextureState {
                image,
                width,
                height,
                layout: ImageLayout::Undefined,
            };
            Ok(self.textures.write().insert(Arc::new(Texture::new(&label, format, state))))
        };

        let color = if color {
            Some(attach(
                TextureFormat::Rgba8Unorm,
                ImageUsage::COLOR_ATTACHMENT | ImageUsage::SAMPLED | ImageUsage::TRANSFER_DST,
                "color",
            )?)
        } else {
            None
        };
        let depth = if depth {
            Some(attach(
                TextureFormat::Depth32Float,
                ImageUsage::DEPTH_ATTACHMENT | ImageUsage::SAMPLED,
                "depth",
            )?)
        } else {
            None
        };

        log::debug!("Texture: render target {} {}x{}", name, width, height);
        Ok(self.targets.write().insert(RenderTarget {
            width,
            height,
            color,
            depth,
        }))
    }

    pub fn target(&self, id: RenderTargetId) -> Option<RenderTarget> {
        self.targets.read().get(id).copied()
    }

    pub fn dispose_render_target(&self, id: RenderTargetId, frame: u64, reclaim: &ReclaimQueue) -> bool {
        let Some(target) = self.targets.write().remove(id) else {
            log::warn!("Texture: dispose of unknown render target {:?}", id);
            return false;
        };
        for texture in [target.color, target.depth].into_iter().flatten() {
            self.dispose(texture, frame, reclaim);
        }
        true
    }

    /// Destroy every image and the sampler. Only valid after a full sync.
    pub fn destroy_all(&self, device: &dyn GpuDevice) {
        self.targets.write().clear();
        let textures = std::mem::take(&mut *self.textures.write());
        for (_, texture) in textures {
            let image = texture.state().image;
            if !image.is_null() {
                device.destroy_image(image);
            }
        }
        device.destroy_sampler(self.sampler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{HeadlessDevice, RecordedCommand};
    use crate::resources::testing::RecordingSink;

    fn setup() -> (HeadlessDevice, TexturePool, ReclaimQueue) {
        let device = HeadlessDevice::new();
        let pool = TexturePool::new(&device).unwrap();
        (device, pool, ReclaimQueue::new())
    }

    #[test]
    fn test_upload_records_copy_between_transitions() {
        let (device, pool, reclaim) = setup();
        let id = pool.create("white");
        let mut sink = RecordingSink::new();
        assert!(pool
            .upload(&device, id, 1, 1, &[255; 4], 1, &mut sink, &reclaim)
            .unwrap());

        let image = pool.get(id).unwrap().state().image;
        let log = device.command_log(sink.cmd.unwrap());
        assert_eq!(
            log[0],
            RecordedCommand::ImageBarrier {
                image,
                old: ImageLayout::Undefined,
                new: ImageLayout::TransferDst
            }
        );
        assert!(matches!(log[1], RecordedCommand::CopyBufferToImage { .. }));
        assert_eq!(
            log[2],
            RecordedCommand::ImageBarrier {
                image,
                old: ImageLayout::TransferDst,
                new: ImageLayout::ShaderRead
            }
        );
        assert_eq!(pool.get(id).unwrap().state().layout, ImageLayout::ShaderRead);
    }

    #[test]
    fn test_resize_retires_old_image() {
        let (device, pool, reclaim) = setup();
        let id = pool.create("t");
        let mut sink = RecordingSink::new();
        pool.upload(&device, id, 1, 1, &[0; 4], 1, &mut sink, &reclaim).unwrap();
        let first = pool.get(id).unwrap().state().image;
        pool.upload(&device, id, 1, 1, &[1; 4], 2, &mut sink, &reclaim).unwrap();
        assert_eq!(pool.get(id).unwrap().state().image, first);
        pool.upload(&device, id, 2, 2, &[1; 16], 3, &mut sink, &reclaim).unwrap();
        assert_ne!(pool.get(id).unwrap().state().image, first);
        assert!(reclaim.drain_all(&device) >= 4);
        assert_eq!(device.live_images(), 1);
    }

    #[test]
    fn test_mismatched_data_is_rejected() {
        let (device, pool, reclaim) = setup();
        let id = pool.create("t");
        let ok = pool
            .upload(&device, id, 2, 2, &[0; 4], 1, &mut RecordingSink::new(), &reclaim)
            .unwrap();
        assert!(!ok);
        assert!(pool.get(id).unwrap().state().image.is_null());
    }

    #[test]
    fn test_transition_is_memoized() {
        let (device, pool, reclaim) = setup();
        let target = pool
            .create_render_target(&device, "rt", 64, 64, true, true)
            .unwrap();
        let color = pool.get(pool.target(target).unwrap().color.unwrap()).unwrap();
        let mut sink = RecordingSink::new();
        let cmd = sink.transfer_commands(&device).unwrap();

        assert!(color.needs_transition(ImageLayout::ColorAttachment));
        assert_eq!(color.transition(&device, cmd, ImageLayout::ColorAttachment).map(|t| t.1), Some(true));
        assert_eq!(color.transition(&device, cmd, ImageLayout::ColorAttachment).map(|t| t.1), Some(false));
        assert_eq!(color.transition(&device, cmd, ImageLayout::ShaderRead).map(|t| t.1), Some(true));
        assert_eq!(device.command_log(cmd).len(), 2);

        assert!(pool.dispose_render_target(target, 1, &reclaim));
        assert_eq!(reclaim.len(), 2);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_unuploaded_texture_has_no_image() {
        let (device, pool, _) = setup();
        let id = pool.create("empty");
        let cmd = RecordingSink::new().transfer_commands(&device).unwrap();
        assert!(pool.get(id).unwrap().transition(&device, cmd, ImageLayout::ShaderRead).is_none());
    }
}
