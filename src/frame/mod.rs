//! Per-frame state machine and resize handling
//!
//! A frame passes through `begin_frame`, a fixed sequence of [`Step`]s during which the caller
//! records draws, and `end_frame`. Each frame uses one of the backend's resource sets, selected
//! round-robin; a set is only reused once its fence shows the GPU has finished with it.

pub mod uniforms;

use std::time::Instant;

use ash::vk;
use glam::Vec2;
use tracing::{info, info_span, trace, warn};

pub use uniforms::{CloudLayerRaw, CloudLayerSettings, FrameUniforms, View};

use crate::Result;

/// Position within a frame
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Step {
    /// Reduced-resolution sky and volumetrics
    Background,
    /// Opaque scene geometry into color, normal, deferred and depth
    Geometry,
    /// Geometry composited with the atmosphere, in HDR
    Composite,
    ToneMap,
    PostEffects,
    /// UI, drawn over the finished image
    Overlay,
}

impl Step {
    pub const ALL: [Step; 6] = [
        Step::Background,
        Step::Geometry,
        Step::Composite,
        Step::ToneMap,
        Step::PostEffects,
        Step::Overlay,
    ];

    pub fn next(self) -> Option<Step> {
        Self::ALL.get(self as usize + 1).copied()
    }
}

/// GPU operations the orchestrator sequences
///
/// `slot` identifies a resource set: command buffer, fence, semaphores, uniforms and framebuffers.
/// `image` is a swapchain image index returned by `acquire`.
pub trait Backend {
    /// Number of resource sets, equal to the swapchain image count; zero while parked
    fn slots(&self) -> usize;
    /// Extent a swapchain for the surface would have now
    ///
    /// Surfaces that leave the size to the swapchain yield `window`, clamped to their limits.
    fn surface_extent(&self, window: vk::Extent2D) -> Result<vk::Extent2D>;
    /// Block until the slot's previous submission has completed
    fn wait_fence(&mut self, slot: usize) -> Result<()>;
    fn reset_fence(&mut self, slot: usize) -> Result<()>;
    /// Acquire the next swapchain image, signaling the slot's acquire semaphore
    ///
    /// `None` if the swapchain no longer matches the surface.
    fn acquire(&mut self, slot: usize) -> Result<Option<u32>>;
    /// Begin recording: write uniforms, make targets writable, enter `Step::Background`
    fn begin(&mut self, slot: usize, image: u32, uniforms: &FrameUniforms) -> Result<()>;
    /// Record the transition from the step preceding `step` into `step`
    fn enter(&mut self, slot: usize, image: u32, step: Step) -> Result<()>;
    /// Finish recording, submit, and present `image`
    fn submit(&mut self, slot: usize, image: u32) -> Result<()>;
    fn command_buffer(&self, slot: usize) -> vk::CommandBuffer;
    /// Block until every submission has completed
    fn wait_all(&mut self) -> Result<()>;
    /// Rebuild every extent-dependent resource at `extent`, or release them all if it's zero
    fn recreate(&mut self, extent: vk::Extent2D) -> Result<()>;
    fn write_clouds(&mut self, clouds: &CloudLayerRaw) -> Result<()>;
}

#[derive(Debug, Copy, Clone)]
struct Recording {
    image: u32,
    step: Step,
}

pub struct Orchestrator<B> {
    backend: B,
    extent: vk::Extent2D,
    /// Resource set used by the next frame
    current: usize,
    frame_count: u64,
    recording: Option<Recording>,
    epoch: Instant,
}

impl<B: Backend> Orchestrator<B> {
    /// Drive `backend`, whose resources were created at `extent`
    pub fn new(backend: B, extent: vk::Extent2D) -> Self {
        Self {
            backend,
            extent,
            current: 0,
            frame_count: 0,
            recording: None,
            epoch: Instant::now(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Index of the resource set the next frame will use
    ///
    /// Always `frame_count() % slots`, including across resizes.
    pub fn current(&self) -> usize {
        self.current
    }

    /// Number of frames submitted
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Whether rendering is suspended for lack of a drawable surface
    pub fn is_parked(&self) -> bool {
        self.extent.width == 0 || self.extent.height == 0 || self.backend.slots() == 0
    }

    /// Start a frame, blocking until its resource set is free
    ///
    /// Returns `false` without recording anything if the surface has no area or the swapchain is
    /// out of date; skip `end_frame` and call `handle_resize` in that case.
    pub fn begin_frame(&mut self, view: &View) -> Result<bool> {
        debug_assert!(
            self.recording.is_none(),
            "begin_frame called twice without end_frame"
        );
        if self.is_parked() {
            return Ok(false);
        }
        let slot = self.current;
        self.backend.wait_fence(slot)?;
        let Some(image) = self.backend.acquire(slot)? else {
            warn!("swapchain out of date; skipping frame");
            return Ok(false);
        };
        // Reset only once acquisition succeeded, so an abandoned frame leaves the fence signaled.
        self.backend.reset_fence(slot)?;

        let uniforms = FrameUniforms::new(
            view,
            Vec2::new(self.extent.width as f32, self.extent.height as f32),
            self.epoch.elapsed().as_secs_f32(),
        );
        self.backend.begin(slot, image, &uniforms)?;
        self.recording = Some(Recording {
            image,
            step: Step::Background,
        });
        trace!(frame = self.frame_count, slot, image, "began frame");
        Ok(true)
    }

    /// The step currently being recorded, if a frame is in progress
    pub fn step(&self) -> Option<Step> {
        self.recording.map(|x| x.step)
    }

    /// Command buffer of the frame in progress, for the caller's own draws
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        debug_assert!(self.recording.is_some(), "no frame in progress");
        self.backend.command_buffer(self.current)
    }

    /// Move to the next step, returning it, or `None` if already at the last
    pub fn advance(&mut self) -> Result<Option<Step>> {
        let Some(ref mut recording) = self.recording else {
            debug_assert!(false, "advance called outside a frame");
            return Ok(None);
        };
        let Some(next) = recording.step.next() else {
            return Ok(None);
        };
        self.backend.enter(self.current, recording.image, next)?;
        recording.step = next;
        Ok(Some(next))
    }

    /// Advance until `step` is reached; no-op if it's already been passed
    pub fn advance_to(&mut self, step: Step) -> Result<()> {
        while self.step().is_some_and(|x| x < step) {
            self.advance()?;
        }
        Ok(())
    }

    /// Finish any remaining steps, submit and present
    pub fn end_frame(&mut self) -> Result<()> {
        debug_assert!(self.recording.is_some(), "end_frame without begin_frame");
        while self.advance()?.is_some() {}
        let Some(recording) = self.recording.take() else {
            return Ok(());
        };
        self.backend.submit(self.current, recording.image)?;
        self.current = (self.current + 1) % self.backend.slots();
        self.frame_count += 1;
        trace!(frame = self.frame_count, "ended frame");
        Ok(())
    }

    /// Block until every frame in flight has completed
    pub fn wait(&mut self) -> Result<()> {
        self.backend.wait_all()
    }

    /// Rebuild extent-dependent resources for a window now `window` pixels in size
    ///
    /// A window or surface with no area parks the renderer until a later call finds a drawable
    /// surface. The precomputed atmosphere is unaffected.
    pub fn handle_resize(&mut self, window: vk::Extent2D) -> Result<()> {
        let span = info_span!("resize", width = window.width, height = window.height);
        let _guard = span.enter();
        debug_assert!(self.recording.is_none(), "resize during a frame");
        self.backend.wait_all()?;
        let extent = if window.width == 0 || window.height == 0 {
            vk::Extent2D::default()
        } else {
            self.backend.surface_extent(window)?
        };
        if extent.width == 0 || extent.height == 0 {
            if !self.is_parked() {
                info!("surface has no area; parking");
                self.backend.recreate(vk::Extent2D::default())?;
            }
            self.extent = vk::Extent2D::default();
            return Ok(());
        }
        self.backend.recreate(extent)?;
        self.extent = extent;
        self.current = (self.frame_count % self.backend.slots().max(1) as u64) as usize;
        Ok(())
    }

    /// Update the cloud parameters read by subsequent frames
    pub fn set_cloud_layer_settings(&mut self, settings: &CloudLayerSettings) -> Result<()> {
        self.backend.write_clouds(&CloudLayerRaw::from(settings))
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Condvar, Mutex},
        thread,
        time::Duration,
    };

    use super::*;

    #[derive(Default)]
    struct Gpu {
        /// Per slot: a submission the simulated GPU hasn't finished
        pending: Vec<bool>,
        max_outstanding: usize,
    }

    #[derive(Default)]
    struct Shared {
        gpu: Mutex<Gpu>,
        done: Condvar,
    }

    impl Shared {
        fn outstanding(gpu: &Gpu) -> usize {
            gpu.pending.iter().filter(|&&x| x).count()
        }
    }

    const WINDOW: vk::Extent2D = vk::Extent2D {
        width: 1024,
        height: 720,
    };

    /// Pretends to be a GPU that takes `latency` to finish each submission
    struct Mock {
        shared: Arc<Shared>,
        latency: Duration,
        /// Extent reported by the surface; `None` if it follows the window
        surface: Option<vk::Extent2D>,
        /// Stands in for the precomputed atmosphere
        luts: Vec<f32>,
        precomputes: usize,
        images: usize,
        next_image: u32,
        out_of_date: bool,
        fence_waits: usize,
        recreated: Vec<vk::Extent2D>,
        steps: Vec<Step>,
        uniforms: Vec<FrameUniforms>,
        clouds: [u8; 16],
    }

    impl Mock {
        fn new(images: usize, latency: Duration) -> Self {
            let shared = Arc::new(Shared::default());
            shared.gpu.lock().unwrap().pending = vec![false; images];
            Self {
                shared,
                latency,
                surface: None,
                luts: (0..64).map(|x| x as f32 * 0.25).collect(),
                precomputes: 1,
                images,
                next_image: 0,
                out_of_date: false,
                fence_waits: 0,
                recreated: Vec::new(),
                steps: Vec::new(),
                uniforms: Vec::new(),
                clouds: [0; 16],
            }
        }
    }

    impl Backend for Mock {
        fn slots(&self) -> usize {
            self.images
        }

        fn surface_extent(&self, window: vk::Extent2D) -> Result<vk::Extent2D> {
            Ok(self.surface.unwrap_or(window))
        }

        fn wait_fence(&mut self, slot: usize) -> Result<()> {
            self.fence_waits += 1;
            let mut gpu = self.shared.gpu.lock().unwrap();
            while gpu.pending[slot] {
                gpu = self.shared.done.wait(gpu).unwrap();
            }
            Ok(())
        }

        fn reset_fence(&mut self, slot: usize) -> Result<()> {
            assert!(!self.shared.gpu.lock().unwrap().pending[slot]);
            Ok(())
        }

        fn acquire(&mut self, _: usize) -> Result<Option<u32>> {
            if self.out_of_date {
                return Ok(None);
            }
            let image = self.next_image;
            self.next_image = (self.next_image + 1) % self.images as u32;
            Ok(Some(image))
        }

        fn begin(&mut self, slot: usize, _: u32, uniforms: &FrameUniforms) -> Result<()> {
            assert!(
                !self.shared.gpu.lock().unwrap().pending[slot],
                "resource set reused while in flight"
            );
            self.steps.clear();
            self.steps.push(Step::Background);
            self.uniforms.push(*uniforms);
            Ok(())
        }

        fn enter(&mut self, _: usize, _: u32, step: Step) -> Result<()> {
            self.steps.push(step);
            Ok(())
        }

        fn submit(&mut self, slot: usize, _: u32) -> Result<()> {
            {
                let mut gpu = self.shared.gpu.lock().unwrap();
                gpu.pending[slot] = true;
                gpu.max_outstanding = gpu.max_outstanding.max(Shared::outstanding(&gpu));
            }
            let shared = self.shared.clone();
            let latency = self.latency;
            thread::spawn(move || {
                thread::sleep(latency);
                shared.gpu.lock().unwrap().pending[slot] = false;
                shared.done.notify_all();
            });
            Ok(())
        }

        fn command_buffer(&self, _: usize) -> vk::CommandBuffer {
            vk::CommandBuffer::null()
        }

        fn wait_all(&mut self) -> Result<()> {
            for slot in 0..self.images {
                self.wait_fence(slot)?;
            }
            Ok(())
        }

        fn recreate(&mut self, extent: vk::Extent2D) -> Result<()> {
            self.recreated.push(extent);
            self.images = if extent.width == 0 { 0 } else { 3 };
            self.next_image = 0;
            let mut gpu = self.shared.gpu.lock().unwrap();
            assert_eq!(Shared::outstanding(&gpu), 0, "recreated while in flight");
            gpu.pending = vec![false; self.images];
            Ok(())
        }

        fn write_clouds(&mut self, clouds: &CloudLayerRaw) -> Result<()> {
            self.clouds.copy_from_slice(bytemuck::bytes_of(clouds));
            Ok(())
        }
    }

    fn orchestrator(images: usize, latency: Duration) -> Orchestrator<Mock> {
        Orchestrator::new(Mock::new(images, latency), WINDOW)
    }

    fn frame(o: &mut Orchestrator<Mock>) -> bool {
        let began = o.begin_frame(&View::default()).unwrap();
        if began {
            o.end_frame().unwrap();
        }
        began
    }

    #[test]
    fn current_cycles() {
        let mut o = orchestrator(3, Duration::ZERO);
        let start = o.current();
        for i in 1..=3 {
            assert!(frame(&mut o));
            assert_eq!(o.current(), i % 3);
        }
        assert_eq!(o.current(), start);
    }

    #[test]
    fn steps_run_in_order() {
        let mut o = orchestrator(2, Duration::ZERO);
        assert!(o.begin_frame(&View::default()).unwrap());
        assert_eq!(o.step(), Some(Step::Background));
        o.advance_to(Step::Composite).unwrap();
        assert_eq!(o.step(), Some(Step::Composite));
        o.advance_to(Step::Geometry).unwrap();
        assert_eq!(o.step(), Some(Step::Composite));
        o.end_frame().unwrap();
        assert_eq!(o.step(), None);
        assert_eq!(o.backend().steps, Step::ALL);
        assert_eq!(
            o.backend().uniforms[0].resolution,
            Vec2::new(1024.0, 720.0)
        );
    }

    #[test]
    fn fence_gates_reuse() {
        let mut o = orchestrator(2, Duration::from_millis(20));
        for _ in 0..6 {
            assert!(frame(&mut o));
        }
        o.wait().unwrap();
        let gpu = o.backend().shared.gpu.lock().unwrap();
        assert!(gpu.max_outstanding <= 2);
        assert_eq!(Shared::outstanding(&gpu), 0);
    }

    #[test]
    fn sixty_frames() {
        let mut o = orchestrator(3, Duration::from_millis(1));
        for _ in 0..60 {
            assert!(frame(&mut o));
        }
        assert_eq!(o.frame_count(), 60);
        assert_eq!(o.current(), 60 % 3);
        assert_eq!(o.backend().fence_waits, 60);
        assert!(o.backend().shared.gpu.lock().unwrap().max_outstanding <= 3);
    }

    #[test]
    fn zero_extent_parks() {
        let mut o = orchestrator(3, Duration::ZERO);
        assert!(frame(&mut o));

        o.backend_mut().surface = Some(vk::Extent2D::default());
        o.handle_resize(WINDOW).unwrap();
        assert!(o.is_parked());
        assert!(!frame(&mut o));
        // Still parked; nothing to rebuild
        o.handle_resize(WINDOW).unwrap();
        assert_eq!(o.backend().recreated, [vk::Extent2D::default()]);
        let waits = o.backend().fence_waits;
        assert!(!frame(&mut o));
        assert_eq!(o.backend().fence_waits, waits);

        let restored = vk::Extent2D {
            width: 800,
            height: 600,
        };
        o.backend_mut().surface = Some(restored);
        o.handle_resize(WINDOW).unwrap();
        assert!(!o.is_parked());
        assert_eq!(o.extent(), restored);
        assert!(frame(&mut o));
        assert_eq!(
            o.backend().recreated,
            [vk::Extent2D::default(), restored]
        );
    }

    #[test]
    fn minimized_window_parks() {
        let mut o = orchestrator(3, Duration::ZERO);
        assert!(frame(&mut o));
        o.handle_resize(vk::Extent2D {
            width: 1920,
            height: 0,
        })
        .unwrap();
        assert!(o.is_parked());
        assert!(!frame(&mut o));
        assert_eq!(o.backend().recreated, [vk::Extent2D::default()]);
    }

    #[test]
    fn resize_follows_window_when_surface_defers() {
        let mut o = orchestrator(3, Duration::ZERO);
        let window = vk::Extent2D {
            width: 1920,
            height: 1080,
        };
        o.handle_resize(window).unwrap();
        assert_eq!(o.extent(), window);
        assert_eq!(o.backend().recreated, [window]);
        assert!(frame(&mut o));
        assert_eq!(
            o.backend().uniforms[0].resolution,
            Vec2::new(1920.0, 1080.0)
        );
    }

    #[test]
    fn resize_keeps_atmosphere() {
        let mut o = orchestrator(3, Duration::ZERO);
        let luts = o.backend().luts.clone();
        assert!(frame(&mut o));
        o.handle_resize(vk::Extent2D::default()).unwrap();
        assert!(o.is_parked());
        o.handle_resize(WINDOW).unwrap();
        assert!(frame(&mut o));
        assert_eq!(o.backend().luts, luts);
        assert_eq!(o.backend().precomputes, 1);
    }

    #[test]
    fn current_tracks_frame_count_across_resize() {
        let mut o = orchestrator(3, Duration::ZERO);
        assert!(frame(&mut o));
        assert!(frame(&mut o));
        o.handle_resize(vk::Extent2D {
            width: 800,
            height: 600,
        })
        .unwrap();
        assert_eq!(o.frame_count(), 2);
        assert_eq!(o.current(), 2);
        assert!(frame(&mut o));
        assert_eq!(o.current(), (o.frame_count() % 3) as usize);
    }

    #[test]
    fn out_of_date_acquire_skips_frame() {
        let mut o = orchestrator(3, Duration::ZERO);
        o.backend_mut().out_of_date = true;
        assert!(!frame(&mut o));
        assert_eq!(o.frame_count(), 0);
        assert_eq!(o.current(), 0);
        o.backend_mut().out_of_date = false;
        assert!(frame(&mut o));
    }

    #[test]
    fn cloud_settings_reach_buffer() {
        let mut o = orchestrator(3, Duration::ZERO);
        o.set_cloud_layer_settings(&CloudLayerSettings {
            coverage: 0.5,
            vertical_span: 0.5,
            absorption: 0.025,
            wind_speed: 0.25,
        })
        .unwrap();
        assert!(frame(&mut o));
        let floats: Vec<f32> = o
            .backend()
            .clouds
            .chunks(4)
            .map(|x| f32::from_le_bytes(x.try_into().unwrap()))
            .collect();
        assert_eq!(floats, [0.5, 0.5, 0.025, 0.25]);
    }
}
