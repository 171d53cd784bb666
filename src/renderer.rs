use std::{
    ops::{Deref, DerefMut},
    sync::Arc,
};

use ash::vk;

use crate::{
    frame::Orchestrator, precompute, vulkan::VulkanBackend, AtmosphereParams, Config, Context,
    Result,
};

/// A frame orchestrator presenting to the context's surface, with a precomputed Earth-like sky
///
/// Dereferences to the [`Orchestrator`] for the frame loop.
pub struct Renderer {
    orchestrator: Orchestrator<VulkanBackend>,
}

impl Renderer {
    /// Precompute the atmosphere, then create the swapchain and per-frame resources
    ///
    /// Blocks until the precompute completes. `extent` is used only if the surface doesn't
    /// dictate one.
    pub fn new(ctx: Arc<Context>, config: &Config, extent: vk::Extent2D) -> Result<Self> {
        Self::with_params(ctx, config, &AtmosphereParams::default(), extent)
    }

    pub fn with_params(
        ctx: Arc<Context>,
        config: &Config,
        params: &AtmosphereParams,
        extent: vk::Extent2D,
    ) -> Result<Self> {
        let atmosphere = precompute::build(&ctx, config, params)?;
        let backend = VulkanBackend::new(&ctx, config, atmosphere, extent)?;
        let extent = backend.extent();
        Ok(Self {
            orchestrator: Orchestrator::new(backend, extent),
        })
    }
}

impl Deref for Renderer {
    type Target = Orchestrator<VulkanBackend>;
    fn deref(&self) -> &Self::Target {
        &self.orchestrator
    }
}

impl DerefMut for Renderer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.orchestrator
    }
}
