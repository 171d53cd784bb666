use std::{io, path::PathBuf};

use ash::{prelude::VkResult, vk};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failures surfaced by the renderer
///
/// None of these are retried internally. Apart from the zero-extent and out-of-date-acquire paths,
/// which are reported as `Ok(false)` from `begin_frame` rather than as errors, every variant
/// indicates a programmer or environment error and should be treated as fatal.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("device lost")]
    DeviceLost,
    #[error("swapchain is out of date")]
    SwapchainOutOfDate,
    #[error("failed to create {what}: {result}")]
    ResourceCreation {
        what: &'static str,
        result: vk::Result,
    },
    #[error("no suitable memory type for {what}")]
    NoMemoryType { what: &'static str },
    #[error("no device with the required queues")]
    NoSuitableDevice,
    #[error("shader {name} not found at {}", path.display())]
    ShaderNotFound {
        name: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("timed out waiting for {what}")]
    Timeout { what: &'static str },
    #[error("invalid configuration: {0}")]
    Config(#[from] toml::de::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    fn from_vk(what: &'static str, result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => Error::DeviceLost,
            vk::Result::ERROR_OUT_OF_DATE_KHR => Error::SwapchainOutOfDate,
            vk::Result::TIMEOUT => Error::Timeout { what },
            result => Error::ResourceCreation { what, result },
        }
    }
}

/// Attaches a description of the operation to a raw Vulkan result
pub(crate) trait Check<T> {
    fn check(self, what: &'static str) -> Result<T>;
}

impl<T> Check<T> for VkResult<T> {
    fn check(self, what: &'static str) -> Result<T> {
        self.map_err(|result| Error::from_vk(what, result))
    }
}

impl<T> Check<Vec<T>> for std::result::Result<Vec<T>, (Vec<T>, vk::Result)> {
    fn check(self, what: &'static str) -> Result<Vec<T>> {
        self.map_err(|(_, result)| Error::from_vk(what, result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_loss_is_distinguished() {
        let r: VkResult<()> = Err(vk::Result::ERROR_DEVICE_LOST);
        assert!(matches!(r.check("fence wait"), Err(Error::DeviceLost)));
        let r: VkResult<()> = Err(vk::Result::TIMEOUT);
        assert!(matches!(
            r.check("fence wait"),
            Err(Error::Timeout { what: "fence wait" })
        ));
        let r: VkResult<()> = Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        match r.check("image") {
            Err(Error::ResourceCreation { what, result }) => {
                assert_eq!(what, "image");
                assert_eq!(result, vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
            }
            x => panic!("unexpected {:?}", x),
        }
    }
}
