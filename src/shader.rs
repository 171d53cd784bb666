use std::{fs::File, path::PathBuf, sync::Arc};

use ash::vk;

use crate::{error::Check, Context, Error, Result};

/// Locates compiled SPIR-V by stage name, e.g. `sky.frag` resolves to `<dir>/sky.frag.spv`
#[derive(Debug, Clone)]
pub struct ShaderLibrary {
    dir: PathBuf,
}

impl ShaderLibrary {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.spv", name))
    }

    pub fn code(&self, name: &str) -> Result<Vec<u32>> {
        let path = self.path(name);
        let not_found = |source| Error::ShaderNotFound {
            name: name.into(),
            path: path.clone(),
            source,
        };
        let mut file = File::open(&path).map_err(not_found)?;
        ash::util::read_spv(&mut file).map_err(not_found)
    }

    pub unsafe fn load(&self, ctx: &Arc<Context>, name: &str) -> Result<ShaderModule> {
        let code = self.code(name)?;
        let handle = ctx
            .device
            .create_shader_module(&vk::ShaderModuleCreateInfo::default().code(&code), None)
            .check("shader module")?;
        Ok(ShaderModule {
            ctx: ctx.clone(),
            handle,
        })
    }
}

/// Destroyed on drop; only needed until the pipelines using it are created
pub struct ShaderModule {
    ctx: Arc<Context>,
    pub handle: vk::ShaderModule,
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe {
            self.ctx.device.destroy_shader_module(self.handle, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn resolves_stage_names() {
        let lib = ShaderLibrary::new("/opt/cerulean");
        assert_eq!(
            lib.path("transmittance.comp"),
            std::path::Path::new("/opt/cerulean/transmittance.comp.spv")
        );
    }

    #[test]
    fn missing_shader() {
        let dir = tempfile::tempdir().unwrap();
        let lib = ShaderLibrary::new(dir.path());
        match lib.code("sky.frag") {
            Err(Error::ShaderNotFound { name, path, .. }) => {
                assert_eq!(name, "sky.frag");
                assert_eq!(path, dir.path().join("sky.frag.spv"));
            }
            x => panic!("unexpected {:?}", x.map(|c| c.len())),
        }
    }

    #[test]
    fn reads_words() {
        let dir = tempfile::tempdir().unwrap();
        let words = [0x0723_0203u32, 0x0001_0000, 0, 1, 0];
        let bytes = words
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect::<Vec<u8>>();
        fs::write(dir.path().join("post.frag.spv"), bytes).unwrap();
        let lib = ShaderLibrary::new(dir.path());
        assert_eq!(lib.code("post.frag").unwrap(), words);
    }

    #[test]
    fn rejects_truncated_code() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("bad.comp.spv"), [0x03, 0x02, 0x23]).unwrap();
        let lib = ShaderLibrary::new(dir.path());
        assert!(matches!(
            lib.code("bad.comp"),
            Err(Error::ShaderNotFound { .. })
        ));
    }
}
