use crate::error::{GfxError, GfxResult, SubmissionError};
use crate::hal::{GpuAddress, HalError, TextureUsage};
use crate::resource::Texture;
use crate::upload::CONSTANT_BUFFER_ALIGNMENT;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum DescriptorKind {
    RenderTarget,
    DepthStencil,
    /// Constant buffer, shader resource and unordered access views.
    CbvSrvUav,
}

/// One populated descriptor slot.
#[derive(Debug, Clone)]
pub enum DescriptorView {
    RenderTarget(Texture),
    DepthStencil(Texture),
    ConstantBuffer { location: GpuAddress, size: u64 },
}

/// Fixed-size table of views of a single kind.
#[derive(Debug)]
pub struct DescriptorHeap {
    kind: DescriptorKind,
    shader_visible: bool,
    slots: Vec<Option<DescriptorView>>,
}

impl DescriptorHeap {
    pub(crate) fn new(kind: DescriptorKind, len: usize, shader_visible: bool) -> GfxResult<Self> {
        let fail = |reason: String| GfxError::ResourceCreation {
            what: "descriptor heap",
            source: HalError::Unsupported(reason),
        };
        if len == 0 {
            return Err(fail(format!("empty {kind:?} heap")));
        }
        if shader_visible && kind != DescriptorKind::CbvSrvUav {
            return Err(fail(format!("{kind:?} heaps cannot be shader visible")));
        }

        Ok(Self {
            kind,
            shader_visible,
            slots: vec![None; len],
        })
    }

    pub fn kind(&self) -> DescriptorKind {
        self.kind
    }

    pub fn is_shader_visible(&self) -> bool {
        self.shader_visible
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn view(&self, index: usize) -> GfxResult<Option<&DescriptorView>> {
        self.slots
            .get(index)
            .map(Option::as_ref)
            .ok_or(GfxError::IndexOutOfBounds {
                index,
                len: self.slots.len(),
            })
    }

    /// Texture behind the render target view at `index`.
    pub fn render_target(&self, index: usize) -> GfxResult<&Texture> {
        match self.view(index)? {
            Some(DescriptorView::RenderTarget(texture)) => Ok(texture),
            other => Err(invalid(format!(
                "slot {index} holds {other:?}, not a render target view"
            ))),
        }
    }

    pub(crate) fn create_render_target_view(
        &mut self,
        index: usize,
        texture: &Texture,
    ) -> GfxResult<()> {
        self.expect_kind(DescriptorKind::RenderTarget)?;
        let desc = texture.desc();
        if desc.usage != TextureUsage::RenderTarget || desc.format.is_depth() {
            return Err(invalid(format!("`{}` is not a colour target", desc.label)));
        }
        self.store(index, DescriptorView::RenderTarget(texture.clone()))
    }

    pub(crate) fn create_depth_stencil_view(
        &mut self,
        index: usize,
        texture: &Texture,
    ) -> GfxResult<()> {
        self.expect_kind(DescriptorKind::DepthStencil)?;
        let desc = texture.desc();
        if desc.usage != TextureUsage::DepthStencil || !desc.format.is_depth() {
            return Err(invalid(format!("`{}` is not a depth target", desc.label)));
        }
        self.store(index, DescriptorView::DepthStencil(texture.clone()))
    }

    pub(crate) fn create_constant_buffer_view(
        &mut self,
        index: usize,
        location: GpuAddress,
        size: u64,
    ) -> GfxResult<()> {
        self.expect_kind(DescriptorKind::CbvSrvUav)?;
        if size == 0 || size % CONSTANT_BUFFER_ALIGNMENT != 0 {
            return Err(invalid(format!(
                "constant buffer view of {size} bytes is not a multiple of {CONSTANT_BUFFER_ALIGNMENT}"
            )));
        }
        if location.0 % CONSTANT_BUFFER_ALIGNMENT != 0 {
            return Err(invalid(format!("constant buffer view at unaligned {location}")));
        }
        self.store(index, DescriptorView::ConstantBuffer { location, size })
    }

    fn expect_kind(&self, kind: DescriptorKind) -> GfxResult<()> {
        if self.kind == kind {
            Ok(())
        } else {
            Err(invalid(format!(
                "{kind:?} view written into a {:?} heap",
                self.kind
            )))
        }
    }

    fn store(&mut self, index: usize, view: DescriptorView) -> GfxResult<()> {
        let len = self.slots.len();
        let slot = self
            .slots
            .get_mut(index)
            .ok_or(GfxError::IndexOutOfBounds { index, len })?;
        *slot = Some(view);
        Ok(())
    }
}

fn invalid(reason: String) -> GfxError {
    SubmissionError::InvalidDescriptor(reason).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::device::Device;
    use crate::hal::{ResourceState, TextureDesc, TextureFormat};

    fn texture(device: &Device, format: TextureFormat, usage: TextureUsage) -> Texture {
        device
            .create_texture(&TextureDesc {
                label: "test target",
                width: 4,
                height: 4,
                format,
                usage,
                initial_state: ResourceState::Common,
            })
            .unwrap()
    }

    #[test]
    fn only_cbv_heaps_are_shader_visible() {
        assert!(DescriptorHeap::new(DescriptorKind::CbvSrvUav, 2, true).is_ok());
        assert!(DescriptorHeap::new(DescriptorKind::RenderTarget, 2, true).is_err());
        assert!(DescriptorHeap::new(DescriptorKind::DepthStencil, 0, false).is_err());
    }

    #[test]
    fn views_must_match_heap_kind() {
        let device = Device::create(&DeviceConfig::soft()).unwrap();
        let color = texture(&device, TextureFormat::Rgba8Unorm, TextureUsage::RenderTarget);
        let depth = texture(
            &device,
            TextureFormat::Depth32FloatStencil8,
            TextureUsage::DepthStencil,
        );

        let mut rtv = DescriptorHeap::new(DescriptorKind::RenderTarget, 1, false).unwrap();
        rtv.create_render_target_view(0, &color).unwrap();
        assert_eq!(rtv.render_target(0).unwrap().raw(), color.raw());
        assert!(rtv.create_depth_stencil_view(0, &depth).is_err());
        assert!(rtv.create_render_target_view(0, &depth).is_err());
        assert!(matches!(
            rtv.create_render_target_view(1, &color),
            Err(GfxError::IndexOutOfBounds { index: 1, len: 1 })
        ));
    }

    #[test]
    fn constant_buffer_views_need_256_byte_sizes() {
        let mut cbv = DescriptorHeap::new(DescriptorKind::CbvSrvUav, 1, true).unwrap();
        let base = GpuAddress(1 << 32);
        assert!(cbv.create_constant_buffer_view(0, base, 64).is_err());
        assert!(cbv.create_constant_buffer_view(0, base, 0).is_err());
        cbv.create_constant_buffer_view(0, base, 512).unwrap();
        assert!(matches!(
            cbv.view(0).unwrap(),
            Some(DescriptorView::ConstantBuffer { size: 512, .. })
        ));
        assert!(cbv.render_target(0).is_err());
    }
}
