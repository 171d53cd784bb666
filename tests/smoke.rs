use std::{
    env,
    ffi::{c_void, CStr},
    path::PathBuf,
    ptr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use ash::{ext, vk, Entry};
use renderdoc::{RenderDoc, V100};

use cerulean::{precompute, AtmosphereParams, Config, Context};

static HAD_ERROR: AtomicBool = AtomicBool::new(false);

/// Runs the full precompute on whatever device is available
///
/// Requires compiled shaders in `$CERULEAN_SHADER_DIR`, or next to the test executable.
#[test]
#[ignore]
fn smoke() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
    let mut rd = RenderDoc::<V100>::new().ok();
    let mut config = Config {
        validation: true,
        scattering_order: 3,
        ..Config::default()
    };
    if let Some(dir) = env::var_os("CERULEAN_SHADER_DIR") {
        config.shader_dir = PathBuf::from(dir);
    }

    unsafe {
        let entry = Entry::load().unwrap();
        let app_name = c"cerulean smoke test";
        let instance = entry
            .create_instance(
                &vk::InstanceCreateInfo::default()
                    .application_info(
                        &vk::ApplicationInfo::default()
                            .application_name(app_name)
                            .engine_name(app_name)
                            .api_version(vk::make_api_version(0, 1, 1, 0)),
                    )
                    .enabled_extension_names(&[ext::debug_utils::NAME.as_ptr()]),
                None,
            )
            .unwrap();

        let debug_utils = ext::debug_utils::Instance::new(&entry, &instance);
        let messenger = debug_utils
            .create_debug_utils_messenger(
                &vk::DebugUtilsMessengerCreateInfoEXT::default()
                    .message_severity(
                        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                            | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
                    )
                    .message_type(
                        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                            | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                            | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                    )
                    .pfn_user_callback(Some(vulkan_debug_callback)),
                None,
            )
            .unwrap();

        let ctx = Arc::new(Context::new(entry, instance, None, &config).unwrap());

        if let Some(ref mut rd) = rd {
            rd.start_frame_capture(renderdoc::DevicePointer::from(ptr::null()), ptr::null());
        }

        let atmosphere = precompute::build(&ctx, &config, &AtmosphereParams::default()).unwrap();
        assert_ne!(atmosphere.descriptor_set(), vk::DescriptorSet::null());
        assert_eq!(atmosphere.transmittance().mip_levels, 9);
        assert_eq!(atmosphere.scattering().extent.depth, 32);
        ctx.wait_idle().unwrap();

        if let Some(ref mut rd) = rd {
            rd.end_frame_capture(renderdoc::DevicePointer::from(ptr::null()), ptr::null());
        }

        drop(atmosphere);
        debug_utils.destroy_debug_utils_messenger(messenger, None);
        drop(ctx);
    }

    if HAD_ERROR.load(Ordering::Relaxed) {
        panic!("vulkan reported an error");
    }
}

unsafe extern "system" fn vulkan_debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _: *mut c_void,
) -> vk::Bool32 {
    let message = (*data).p_message;
    if !message.is_null() {
        eprintln!("{:?} {}", severity, CStr::from_ptr(message).to_string_lossy());
    }
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        HAD_ERROR.store(true, Ordering::Relaxed);
    }
    vk::FALSE
}
