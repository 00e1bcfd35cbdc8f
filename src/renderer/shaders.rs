use crate::backend::{GpuBackend, ProgramHandle};
use crate::error::GpuError;
use crate::filters::Shader;
use crate::id::{ContextId, ShaderId};
use ahash::AHashMap;
use std::rc::{Rc, Weak};

/// Programs one renderer compiled, so they can be freed when their shader
/// goes away or the renderer is torn down.
#[derive(Debug)]
pub(crate) struct ShaderRegistry {
    context: ContextId,
    compiled: AHashMap<ShaderId, (Weak<Shader>, ProgramHandle)>,
}

impl ShaderRegistry {
    pub(crate) fn new(context: ContextId) -> Self {
        Self {
            context,
            compiled: AHashMap::new(),
        }
    }

    /// The shader's program on this context, compiling on first use.
    pub(crate) fn program<B: GpuBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        shader: &Rc<Shader>,
    ) -> Result<ProgramHandle, GpuError> {
        let program = shader.program(backend)?;
        self.compiled
            .entry(shader.id())
            .or_insert_with(|| (Rc::downgrade(shader), program))
            .1 = program;
        Ok(program)
    }

    /// Deletes programs whose shader has been dropped.
    pub(crate) fn prune<B: GpuBackend + ?Sized>(&mut self, backend: &mut B) {
        self.compiled.retain(|id, (shader, program)| {
            if shader.strong_count() > 0 {
                return true;
            }
            tracing::trace!(shader = id.0, ?program, "freeing program of dropped shader");
            backend.delete_program(*program);
            false
        });
    }

    /// Clears this context from every shader's cache and hands back the programs.
    pub(crate) fn forget_all(&mut self) -> Vec<ProgramHandle> {
        self.compiled
            .drain()
            .map(|(_, (shader, program))| {
                if let Some(shader) = shader.upgrade() {
                    shader.forget_context(self.context);
                }
                program
            })
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.compiled.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SoftwareBackend;

    #[test]
    fn dropped_shaders_release_their_program() {
        let mut backend = SoftwareBackend::new(2, 2);
        let mut registry = ShaderRegistry::new(backend.context_id());
        let shader = Rc::new(Shader::custom("short-lived", ""));
        registry.program(&mut backend, &shader).unwrap();
        assert_eq!(registry.len(), 1);

        drop(shader);
        registry.prune(&mut backend);
        assert_eq!(registry.len(), 0);
        assert!(backend
            .calls()
            .iter()
            .any(|call| matches!(call, crate::backend::BackendCall::DeleteProgram(_))));
    }

    #[test]
    fn forgetting_clears_the_shader_cache() {
        let mut backend = SoftwareBackend::new(2, 2);
        let mut registry = ShaderRegistry::new(backend.context_id());
        let shader = Rc::new(Shader::custom("kept", ""));
        registry.program(&mut backend, &shader).unwrap();

        assert_eq!(registry.forget_all().len(), 1);
        assert!(!shader.is_compiled_for(backend.context_id()));
    }
}
