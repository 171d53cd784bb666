use std::{env, fs, path::Path, path::PathBuf, time::Duration};

use ash::vk;
use serde::Deserialize;

use crate::Result;

/// Construction-time settings, threaded explicitly into every component that needs them
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Directory containing compiled shaders, named `<stage-name>.spv`
    pub shader_dir: PathBuf,
    /// Upper bound on any single fence or acquire wait, in milliseconds
    ///
    /// `None` waits forever. A driver hang is then unrecoverable, but frame pacing is unaffected.
    pub fence_timeout_ms: Option<u64>,
    /// Number of light bounces to simulate when precomputing the atmosphere
    pub scattering_order: u32,
    /// Preferred number of swapchain images, and hence of frames in flight
    pub desired_image_count: u32,
    pub present_mode: PresentMode,
    /// The background pass renders at `1 / background_scale` of the surface resolution
    pub background_scale: u32,
    /// Attach debug names to Vulkan objects
    pub validation: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shader_dir: executable_dir(),
            fence_timeout_ms: None,
            scattering_order: 5,
            desired_image_count: 3,
            present_mode: PresentMode::Fifo,
            background_scale: 2,
            validation: false,
        }
    }
}

impl Config {
    /// Read a TOML configuration file; absent keys take their default values
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    /// Timeout in the form expected by `vkWaitForFences` and `vkAcquireNextImageKHR`
    pub fn timeout_ns(&self) -> u64 {
        match self.fence_timeout_ms {
            None => u64::MAX,
            Some(ms) => u64::try_from(Duration::from_millis(ms).as_nanos()).unwrap_or(u64::MAX),
        }
    }

    pub(crate) fn order(&self) -> u32 {
        self.scattering_order.max(2)
    }

    pub(crate) fn background_extent(&self, extent: vk::Extent2D) -> vk::Extent2D {
        let scale = self.background_scale.max(1);
        vk::Extent2D {
            width: (extent.width / scale).max(1),
            height: (extent.height / scale).max(1),
        }
    }
}

fn executable_dir() -> PathBuf {
    env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_default()
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresentMode {
    Fifo,
    Mailbox,
    Immediate,
}

impl From<PresentMode> for vk::PresentModeKHR {
    fn from(x: PresentMode) -> Self {
        match x {
            PresentMode::Fifo => vk::PresentModeKHR::FIFO,
            PresentMode::Mailbox => vk::PresentModeKHR::MAILBOX,
            PresentMode::Immediate => vk::PresentModeKHR::IMMEDIATE,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
shader_dir = "/opt/shaders"
scattering_order = 8
present_mode = "mailbox"
"#
        )
        .unwrap();
        let cfg = Config::load(file.path()).unwrap();
        assert_eq!(cfg.shader_dir, Path::new("/opt/shaders"));
        assert_eq!(cfg.scattering_order, 8);
        assert_eq!(cfg.present_mode, PresentMode::Mailbox);
        assert_eq!(cfg.desired_image_count, 3);
        assert_eq!(cfg.fence_timeout_ms, None);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "shaders = \"x\"").unwrap();
        assert!(matches!(
            Config::load(file.path()),
            Err(crate::Error::Config(_))
        ));
    }

    #[test]
    fn timeout() {
        let mut cfg = Config::default();
        assert_eq!(cfg.timeout_ns(), u64::MAX);
        cfg.fence_timeout_ms = Some(250);
        assert_eq!(cfg.timeout_ns(), 250_000_000);
    }

    #[test]
    fn background_extent_never_collapses() {
        let cfg = Config::default();
        let e = cfg.background_extent(vk::Extent2D {
            width: 1024,
            height: 1,
        });
        assert_eq!((e.width, e.height), (512, 1));
    }
}
