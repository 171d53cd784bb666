use bytemuck::{Pod, Zeroable};
use glam::{DVec3, Mat4, Vec2, Vec3, Vec4};

/// Camera and lighting state for one frame
#[derive(Debug, Copy, Clone)]
pub struct View {
    /// World to eye
    pub view: Mat4,
    pub projection: Mat4,
    /// World-space camera position; may be far from the origin
    pub position: DVec3,
    /// Unit vector towards the sun
    pub sun_direction: Vec3,
}

impl Default for View {
    fn default() -> Self {
        Self {
            view: Mat4::IDENTITY,
            projection: Mat4::IDENTITY,
            position: DVec3::ZERO,
            sun_direction: Vec3::Y,
        }
    }
}

/// Per-frame uniform block, in the order shaders declare it
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Pod, Zeroable)]
pub struct FrameUniforms {
    pub view_projection: Mat4,
    pub view: Mat4,
    pub view_inverse: Mat4,
    pub projection: Mat4,
    pub projection_inverse: Mat4,
    /// `position - CameraPosition`, so that the two sum to the full-precision position
    pub camera_position_high_precision: Vec4,
    pub camera_position: Vec4,
    pub sun_direction: Vec4,
    pub camera_up: Vec4,
    pub camera_right: Vec4,
    pub camera_forward: Vec4,
    pub resolution: Vec2,
    /// Seconds since the renderer was constructed
    pub time: f32,
    pub _padding: f32,
}

impl FrameUniforms {
    pub fn new(view: &View, resolution: Vec2, time: f32) -> Self {
        let view_inverse = view.view.inverse();
        let truncated = view.position.as_vec3();
        let residual = (view.position - truncated.as_dvec3()).as_vec3();
        Self {
            view_projection: view.projection * view.view,
            view: view.view,
            view_inverse,
            projection: view.projection,
            projection_inverse: view.projection.inverse(),
            camera_position_high_precision: residual.extend(0.0),
            camera_position: truncated.extend(1.0),
            sun_direction: view.sun_direction.normalize_or_zero().extend(0.0),
            camera_up: view_inverse.y_axis.truncate().extend(0.0),
            camera_right: view_inverse.x_axis.truncate().extend(0.0),
            camera_forward: (-view_inverse.z_axis.truncate()).extend(0.0),
            resolution,
            time,
            _padding: 0.0,
        }
    }
}

/// Shape of the cloud layer, read by the background and composition shaders
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct CloudLayerSettings {
    /// Fraction of the sky covered, in [0, 1]
    pub coverage: f32,
    /// Thickness of the layer relative to its altitude band, in [0, 1]
    pub vertical_span: f32,
    pub absorption: f32,
    pub wind_speed: f32,
}

impl Default for CloudLayerSettings {
    fn default() -> Self {
        Self {
            coverage: 0.5,
            vertical_span: 0.5,
            absorption: 0.025,
            wind_speed: 0.25,
        }
    }
}

/// GPU layout of [`CloudLayerSettings`]
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Pod, Zeroable)]
pub struct CloudLayerRaw {
    coverage: f32,
    vertical_span: f32,
    absorption: f32,
    wind_speed: f32,
}

impl From<&CloudLayerSettings> for CloudLayerRaw {
    fn from(x: &CloudLayerSettings) -> Self {
        Self {
            coverage: x.coverage,
            vertical_span: x.vertical_span,
            absorption: x.absorption,
            wind_speed: x.wind_speed,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::mem;

    use super::*;

    #[test]
    fn std140_layout() {
        assert_eq!(mem::size_of::<FrameUniforms>(), 5 * 64 + 6 * 16 + 16);
        assert_eq!(mem::offset_of!(FrameUniforms, view), 64);
        assert_eq!(mem::offset_of!(FrameUniforms, camera_position_high_precision), 320);
        assert_eq!(mem::offset_of!(FrameUniforms, sun_direction), 352);
        assert_eq!(mem::offset_of!(FrameUniforms, camera_forward), 400);
        assert_eq!(mem::offset_of!(FrameUniforms, resolution), 416);
        assert_eq!(mem::offset_of!(FrameUniforms, time), 424);
    }

    #[test]
    fn high_precision_position() {
        let view = View {
            position: DVec3::new(6_360_000.123_456, -1.0e-9, 42.0),
            ..View::default()
        };
        let u = FrameUniforms::new(&view, Vec2::new(1024.0, 720.0), 0.0);
        let recovered = u.camera_position.truncate().as_dvec3()
            + u.camera_position_high_precision.truncate().as_dvec3();
        assert!((recovered - view.position).abs().max_element() < 1e-6);
        assert_eq!(u.camera_position.z, 42.0);
        assert_eq!(u.camera_position_high_precision.z, 0.0);
    }

    #[test]
    fn camera_basis() {
        let view = View {
            view: Mat4::look_at_rh(glam::Vec3::ZERO, glam::Vec3::X, glam::Vec3::Z),
            ..View::default()
        };
        let u = FrameUniforms::new(&view, Vec2::ONE, 1.5);
        assert!(u.camera_forward.abs_diff_eq(Vec4::X, 1e-6));
        assert!(u.camera_up.abs_diff_eq(Vec4::Z, 1e-6));
        assert!(u.camera_right.abs_diff_eq(-Vec4::Y, 1e-6));
        assert_eq!(u.time, 1.5);
    }

    #[test]
    fn cloud_block_order() {
        let settings = CloudLayerSettings {
            coverage: 0.5,
            vertical_span: 0.5,
            absorption: 0.025,
            wind_speed: 0.25,
        };
        let raw = CloudLayerRaw::from(&settings);
        let floats: &[f32] = bytemuck::cast_slice(bytemuck::bytes_of(&raw));
        assert_eq!(floats, [0.5, 0.5, 0.025, 0.25]);
    }
}
