use std::fmt;
use std::sync::Arc;

use crate::error::{GfxError, GfxResult};
use crate::hal::{Backend, RawTexture, TextureDesc};

struct TextureInner {
    backend: Arc<dyn Backend>,
    raw: RawTexture,
    desc: TextureDesc,
    /// Back buffers belong to their swap chain and are not destroyed here.
    owned: bool,
}

impl Drop for TextureInner {
    fn drop(&mut self) {
        if self.owned {
            self.backend.destroy_texture(self.raw);
        }
    }
}

/// Shared handle to a 2D texture.
///
/// Clones refer to the same texture; the last owned handle destroys it.
#[derive(Clone)]
pub struct Texture(Arc<TextureInner>);

impl Texture {
    pub(crate) fn new(backend: Arc<dyn Backend>, desc: &TextureDesc) -> GfxResult<Self> {
        let raw = backend
            .create_texture(desc)
            .map_err(GfxError::resource(desc.label))?;
        Ok(Self(Arc::new(TextureInner {
            backend,
            raw,
            desc: *desc,
            owned: true,
        })))
    }

    pub(crate) fn borrowed(backend: Arc<dyn Backend>, raw: RawTexture, desc: TextureDesc) -> Self {
        Self(Arc::new(TextureInner {
            backend,
            raw,
            desc,
            owned: false,
        }))
    }

    pub fn raw(&self) -> RawTexture {
        self.0.raw
    }

    pub fn desc(&self) -> &TextureDesc {
        &self.0.desc
    }

    pub fn width(&self) -> u32 {
        self.0.desc.width
    }

    pub fn height(&self) -> u32 {
        self.0.desc.height
    }

    /// Reads one texel as stored (format byte order).
    pub fn read_texel(&self, x: u32, y: u32) -> GfxResult<[u8; 4]> {
        self.0
            .backend
            .read_texel(self.0.raw, x, y)
            .map_err(GfxError::ReadBack)
    }
}

impl fmt::Debug for Texture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Texture")
            .field("raw", &self.0.raw)
            .field("desc", &self.0.desc)
            .field("owned", &self.0.owned)
            .finish()
    }
}
