//! Shader sources and the process-wide shader registry.

pub mod layout;
pub mod lexer;
pub mod preprocess;
pub mod transpiler;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use slotmap::{new_key_type, SlotMap};

use crate::device::BindingKind;
use crate::error::{RenderError, RenderResult};
pub use layout::{UniformSlot, UniformType};

new_key_type! {
    /// Registry handle of a transpiled shader.
    pub struct ShaderId;
}

/// Binding placeholder of a stage's generated uniform block.
pub const BLOCK_PLACEHOLDER: &str = "@block@";

/// Binding placeholder of a named opaque resource.
pub fn resource_placeholder(name: &str) -> String {
    format!("@res:{}@", name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

impl ShaderStage {
    /// Stage name as understood by `glslc -fshader-stage=`.
    pub fn glslc_name(self) -> &'static str {
        match self {
            ShaderStage::Vertex => "vert",
            ShaderStage::Fragment => "frag",
            ShaderStage::Compute => "comp",
        }
    }
}

/// Opaque resources that live outside the uniform block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Sampler,
    StorageBuffer,
    StorageImage,
}

impl ResourceKind {
    pub fn binding_kind(self) -> BindingKind {
        match self {
            ResourceKind::Sampler => BindingKind::CombinedImageSampler,
            ResourceKind::StorageBuffer => BindingKind::StorageBuffer,
            ResourceKind::StorageImage => BindingKind::StorageImage,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderResource {
    pub name: String,
    pub kind: ResourceKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Varying {
    pub name: String,
    pub location: u32,
    pub flat: bool,
}

/// A transpiled shader stage. Immutable once created; link-time binding
/// indices are substituted into a copy of `text` owned by the program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderSource {
    pub name: String,
    pub stage: ShaderStage,
    /// Caller-supplied `#define` lines spliced into the source.
    pub definitions: String,
    /// Rewritten source with binding placeholders.
    pub text: String,
    /// Flattened block entries in declaration order.
    pub uniforms: Vec<UniformSlot>,
    /// Byte size of the generated uniform block (0 when there is none).
    pub block_size: u32,
    pub resources: Vec<ShaderResource>,
    pub inputs: Vec<Varying>,
    pub outputs: Vec<Varying>,
}

impl ShaderSource {
    pub fn has_block(&self) -> bool {
        self.block_size > 0
    }

    pub fn uniform(&self, name: &str) -> Option<&UniformSlot> {
        self.uniforms.iter().find(|u| u.name == name)
    }

    /// Substitute binding indices for every placeholder.
    pub fn bind(&self, block: Option<u32>, resource: impl Fn(&str) -> Option<u32>) -> Result<String, String> {
        let mut text = self.text.clone();
        if self.has_block() {
            let binding = block.ok_or_else(|| format!("{}: uniform block has no binding", self.name))?;
            text = text.replace(BLOCK_PLACEHOLDER, &binding.to_string());
        }
        for r in &self.resources {
            let binding = resource(&r.name).ok_or_else(|| format!("{}: {} has no binding", self.name, r.name))?;
            text = text.replace(&resource_placeholder(&r.name), &binding.to_string());
        }
        Ok(text)
    }
}

/// Identity of a loaded shader: one registry entry per tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ShaderKey {
    stage: ShaderStage,
    path: String,
    file: String,
    definitions: String,
}

/// Process-wide (per backend) registry of transpiled shaders.
#[derive(Default)]
pub struct ShaderRegistry {
    shaders: RwLock<SlotMap<ShaderId, Arc<ShaderSource>>>,
    by_key: RwLock<HashMap<ShaderKey, ShaderId>>,
}

impl ShaderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `path/file` from disk and transpile it.
    pub fn load(&self, stage: ShaderStage, path: &str, file: &str, definitions: &str) -> RenderResult<ShaderId> {
        let key = ShaderKey {
            stage,
            path: path.to_string(),
            file: file.to_string(),
            definitions: definitions.to_string(),
        };
        if let Some(id) = self.by_key.read().get(&key) {
            return Ok(*id);
        }

        let full = Path::new(path).join(file);
        let source = std::fs::read_to_string(&full).map_err(|e| {
            log::warn!("Shader: cannot read {}: {}", full.display(), e);
            RenderError::ResourceNotFound(format!("shader file {}", full.display()))
        })?;
        self.insert(key, &full.to_string_lossy(), &source)
    }

    /// Transpile in-memory source registered under `name`.
    pub fn load_source(
        &self,
        stage: ShaderStage,
        name: &str,
        source: &str,
        definitions: &str,
    ) -> RenderResult<ShaderId> {
        let key = ShaderKey {
            stage,
            path: String::new(),
            file: name.to_string(),
            definitions: definitions.to_string(),
        };
        if let Some(id) = self.by_key.read().get(&key) {
            return Ok(*id);
        }
        self.insert(key, name, source)
    }

    fn insert(&self, key: ShaderKey, name: &str, source: &str) -> RenderResult<ShaderId> {
        let shader = transpiler::transpile(name, key.stage, source, &key.definitions).inspect_err(|e| {
            log::warn!("Shader: {}", e);
        })?;

        let mut by_key = self.by_key.write();
        // Another thread may have loaded the same tuple meanwhile.
        if let Some(id) = by_key.get(&key) {
            return Ok(*id);
        }
        let id = self.shaders.write().insert(Arc::new(shader));
        by_key.insert(key, id);
        Ok(id)
    }

    pub fn get(&self, id: ShaderId) -> Option<Arc<ShaderSource>> {
        self.shaders.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.shaders.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every shader. Only valid at teardown.
    pub fn clear(&self) {
        self.by_key.write().clear();
        self.shaders.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = "uniform vec4 color;\nuniform sampler2D tex;\nvoid main() {}\n";

    #[test]
    fn test_same_tuple_loads_once() {
        let registry = ShaderRegistry::new();
        let a = registry.load_source(ShaderStage::Fragment, "a.frag", SOURCE, "").unwrap();
        let b = registry.load_source(ShaderStage::Fragment, "a.frag", SOURCE, "").unwrap();
        let c = registry.load_source(ShaderStage::Fragment, "a.frag", SOURCE, "#define X").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_failed_transpile_leaves_registry_empty() {
        let registry = ShaderRegistry::new();
        let result = registry.load_source(ShaderStage::Fragment, "bad.frag", "uniform banana x;\n", "");
        assert!(matches!(result, Err(RenderError::ShaderTranspile { .. })));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let registry = ShaderRegistry::new();
        let result = registry.load(ShaderStage::Vertex, "/nonexistent/shaders", "none.vert", "");
        assert!(matches!(result, Err(RenderError::ResourceNotFound(_))));
    }

    #[test]
    fn test_load_from_disk() {
        let dir = std::env::temp_dir().join(format!("lumen-shader-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("disk.frag"), SOURCE).unwrap();
        let registry = ShaderRegistry::new();
        let id = registry
            .load(ShaderStage::Fragment, &dir.to_string_lossy(), "disk.frag", "")
            .unwrap();
        assert_eq!(registry.get(id).unwrap().uniforms[0].name, "color");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_bind_substitutes_placeholders() {
        let registry = ShaderRegistry::new();
        let id = registry.load_source(ShaderStage::Fragment, "a.frag", SOURCE, "").unwrap();
        let shader = registry.get(id).unwrap();
        let text = shader
            .bind(Some(0), |name| if name == "tex" { Some(1) } else { None })
            .unwrap();
        assert!(text.contains("set = 0, binding = 0) uniform LumenFragmentUniforms"));
        assert!(text.contains("layout(set = 0, binding = 1) uniform sampler2D tex;"));
        assert!(shader.bind(None, |_| Some(1)).is_err());
    }
}
