//! Command-level plan of the scattering solve
//!
//! The solve is a fixed sequence of compute dispatches over a handful of images. Rather than
//! hand-writing a barrier before each dispatch, `Schedule::plan` walks the sequence while tracking
//! how every image was last accessed, and emits exactly the transitions each dispatch requires.
//! The resulting list is executed against a `Recorder`, which is Vulkan in production and a mock in
//! tests.

use ash::vk;
use bytemuck::{Pod, Zeroable};

use crate::Result;

/// Threads per workgroup along x and y in every kernel
pub const WORKGROUP_SIZE: u32 = 8;

/// Images touched by the solve
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Lut {
    Transmittance,
    Irradiance,
    Scattering,
    /// Ground irradiance of the current order
    DeltaE,
    /// Rayleigh single scattering, then the multiple scattering of each later order
    DeltaSR,
    /// Mie single scattering
    DeltaSM,
    /// Scattering density of the current order
    DeltaJ,
}

impl Lut {
    pub const ALL: [Lut; 7] = [
        Lut::Transmittance,
        Lut::Irradiance,
        Lut::Scattering,
        Lut::DeltaE,
        Lut::DeltaSR,
        Lut::DeltaSM,
        Lut::DeltaJ,
    ];

    /// The LUTs that outlive the solve
    pub const PERMANENT: [Lut; 3] = [Lut::Transmittance, Lut::Irradiance, Lut::Scattering];

    pub fn extent(self) -> vk::Extent3D {
        use Lut::*;
        let (width, height, depth) = match self {
            Transmittance => (256, 64, 1),
            Irradiance | DeltaE => (64, 16, 1),
            // ν·μs = 8·32, μ = 128, r = 32
            Scattering | DeltaSR | DeltaSM | DeltaJ => (256, 128, 32),
        };
        vk::Extent3D {
            width,
            height,
            depth,
        }
    }

    pub fn format(self) -> vk::Format {
        vk::Format::R32G32B32A32_SFLOAT
    }

    pub fn mip_levels(self) -> u32 {
        match self {
            Lut::Transmittance => 32 - self.extent().width.max(self.extent().height).leading_zeros(),
            _ => 1,
        }
    }

    pub fn image_type(self) -> vk::ImageType {
        if self.extent().depth > 1 {
            vk::ImageType::TYPE_3D
        } else {
            vk::ImageType::TYPE_2D
        }
    }

    pub fn is_scratch(self) -> bool {
        !Self::PERMANENT.contains(&self)
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// Compute kernels of the solve, each loaded from `<name>.comp.spv`
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Kernel {
    Transmittance,
    Irradiance1,
    Inscatter1,
    CopyIrradiance,
    CopyInscatter1,
    InscatterS,
    IrradianceN,
    InscatterN,
    CopyInscatterN,
}

impl Kernel {
    pub const ALL: [Kernel; 9] = [
        Kernel::Transmittance,
        Kernel::Irradiance1,
        Kernel::Inscatter1,
        Kernel::CopyIrradiance,
        Kernel::CopyInscatter1,
        Kernel::InscatterS,
        Kernel::IrradianceN,
        Kernel::InscatterN,
        Kernel::CopyInscatterN,
    ];

    pub fn name(self) -> &'static str {
        use Kernel::*;
        match self {
            Transmittance => "transmittance",
            Irradiance1 => "irradiance1",
            Inscatter1 => "inscatter1",
            CopyIrradiance => "copy_irradiance",
            CopyInscatter1 => "copy_inscatter1",
            InscatterS => "inscatter_s",
            IrradianceN => "irradiance_n",
            InscatterN => "inscatter_n",
            CopyInscatterN => "copy_inscatter_n",
        }
    }

    /// Images sampled by the kernel, in binding order
    pub fn reads(self) -> &'static [Lut] {
        use Kernel::*;
        match self {
            Transmittance => &[],
            Irradiance1 | Inscatter1 => &[Lut::Transmittance],
            CopyIrradiance => &[Lut::DeltaE],
            CopyInscatter1 => &[Lut::DeltaSR, Lut::DeltaSM],
            InscatterS => &[Lut::Transmittance, Lut::DeltaE, Lut::DeltaSR, Lut::DeltaSM],
            IrradianceN => &[Lut::DeltaSR, Lut::DeltaSM],
            InscatterN => &[Lut::Transmittance, Lut::DeltaJ],
            CopyInscatterN => &[Lut::DeltaSR],
        }
    }

    /// Storage images written by the kernel, bound after `reads`
    ///
    /// The first entry determines the dispatch grid.
    pub fn writes(self) -> &'static [Lut] {
        use Kernel::*;
        match self {
            Transmittance => &[Lut::Transmittance],
            Irradiance1 | IrradianceN => &[Lut::DeltaE],
            Inscatter1 => &[Lut::DeltaSR, Lut::DeltaSM],
            CopyIrradiance => &[Lut::Irradiance],
            CopyInscatter1 | CopyInscatterN => &[Lut::Scattering],
            InscatterS => &[Lut::DeltaJ],
            InscatterN => &[Lut::DeltaSR],
        }
    }

    /// Workgroup counts covering the kernel's output
    pub fn groups(self) -> [u32; 3] {
        let extent = self.writes()[0].extent();
        [
            (extent.width + WORKGROUP_SIZE - 1) / WORKGROUP_SIZE,
            (extent.height + WORKGROUP_SIZE - 1) / WORKGROUP_SIZE,
            extent.depth,
        ]
    }
}

/// Push constants shared by every kernel's pipeline layout
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Pod, Zeroable)]
pub struct PushConstants {
    /// Nonzero while integrating the second order, whose inputs are still split into Rayleigh and Mie
    pub first_order: u32,
    /// Weight applied by `copy_irradiance`
    pub scale: f32,
}

impl PushConstants {
    fn new(first_order: bool, scale: f32) -> Self {
        Self {
            first_order: first_order as u32,
            scale,
        }
    }
}

/// How an image was most recently accessed
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Access {
    Undefined,
    /// Storage image load/store
    Write,
    /// Sampled
    Read,
    /// Transfer clear
    Clear,
}

impl Access {
    pub fn layout(self) -> vk::ImageLayout {
        match self {
            Access::Undefined => vk::ImageLayout::UNDEFINED,
            Access::Write => vk::ImageLayout::GENERAL,
            Access::Read => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            Access::Clear => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        }
    }

    pub fn access_mask(self) -> vk::AccessFlags {
        match self {
            Access::Undefined => vk::AccessFlags::empty(),
            Access::Write => vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
            Access::Read => vk::AccessFlags::SHADER_READ,
            Access::Clear => vk::AccessFlags::TRANSFER_WRITE,
        }
    }

    pub fn stage(self) -> vk::PipelineStageFlags {
        match self {
            Access::Undefined => vk::PipelineStageFlags::TOP_OF_PIPE,
            Access::Write | Access::Read => vk::PipelineStageFlags::COMPUTE_SHADER,
            Access::Clear => vk::PipelineStageFlags::TRANSFER,
        }
    }
}

/// A layout transition or, when `from == to`, a memory dependency between two writes
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Transition {
    pub lut: Lut,
    pub from: Access,
    pub to: Access,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Barrier(Vec<Transition>),
    Clear(Lut),
    Dispatch {
        kernel: Kernel,
        push: PushConstants,
    },
    /// Make the permanent LUTs readable and hand them to the queue that renders with them
    Finalize(Vec<Transition>),
    /// Submit everything recorded so far and wait for it to complete
    Flush {
        /// Highest scattering order complete once this batch finishes
        order: u32,
    },
    /// Fill the mip chain of a LUT from its base level, on the graphics queue
    GenerateMips(Lut),
}

/// Receives the commands of a `Schedule`
pub trait Recorder {
    fn barrier(&mut self, transitions: &[Transition]) -> Result<()>;
    fn clear(&mut self, lut: Lut) -> Result<()>;
    fn dispatch(&mut self, kernel: Kernel, push: PushConstants) -> Result<()>;
    fn finalize(&mut self, transitions: &[Transition]) -> Result<()>;
    fn flush(&mut self, order: u32) -> Result<()>;
    fn generate_mips(&mut self, lut: Lut) -> Result<()>;
}

/// The full sequence of commands computing `order` orders of scattering
#[derive(Debug, Clone)]
pub struct Schedule {
    order: u32,
    commands: Vec<Command>,
}

impl Schedule {
    pub fn plan(order: u32) -> Self {
        let mut p = Planner::new();

        p.dispatch(Kernel::Transmittance, PushConstants::new(true, 1.0));
        p.dispatch(Kernel::Irradiance1, PushConstants::new(true, 1.0));
        p.dispatch(Kernel::Inscatter1, PushConstants::new(true, 1.0));
        p.clear(Lut::Irradiance);
        p.clear(Lut::Scattering);
        // Direct irradiance is evaluated from transmittance at render time, so the first order
        // contributes nothing to the irradiance LUT.
        p.dispatch(Kernel::CopyIrradiance, PushConstants::new(true, 0.0));
        p.dispatch(Kernel::CopyInscatter1, PushConstants::new(true, 1.0));
        if order <= 1 {
            p.finalize();
        }
        p.flush(1);

        for n in 2..=order {
            let first = n == 2;
            p.dispatch(Kernel::InscatterS, PushConstants::new(first, 1.0));
            p.dispatch(Kernel::IrradianceN, PushConstants::new(first, 1.0));
            p.dispatch(Kernel::InscatterN, PushConstants::new(first, 1.0));
            p.dispatch(Kernel::CopyIrradiance, PushConstants::new(first, 1.0));
            p.dispatch(Kernel::CopyInscatterN, PushConstants::new(first, 1.0));
            if n == order {
                p.finalize();
            }
            p.flush(n);
        }

        p.commands.push(Command::GenerateMips(Lut::Transmittance));

        Self {
            order: order.max(1),
            commands: p.commands,
        }
    }

    pub fn order(&self) -> u32 {
        self.order
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn execute<R: Recorder>(&self, recorder: &mut R) -> Result<()> {
        for command in &self.commands {
            match *command {
                Command::Barrier(ref ts) => recorder.barrier(ts)?,
                Command::Clear(lut) => recorder.clear(lut)?,
                Command::Dispatch { kernel, push } => recorder.dispatch(kernel, push)?,
                Command::Finalize(ref ts) => recorder.finalize(ts)?,
                Command::Flush { order } => recorder.flush(order)?,
                Command::GenerateMips(lut) => recorder.generate_mips(lut)?,
            }
        }
        Ok(())
    }
}

struct Planner {
    state: [Access; Lut::ALL.len()],
    commands: Vec<Command>,
}

impl Planner {
    fn new() -> Self {
        Self {
            state: [Access::Undefined; Lut::ALL.len()],
            commands: Vec::new(),
        }
    }

    fn transition(&mut self, lut: Lut, to: Access, out: &mut Vec<Transition>) {
        let from = self.state[lut.index()];
        let needed = match to {
            Access::Read => from != Access::Read,
            // Consecutive writes by different dispatches still need a memory dependency
            Access::Write => true,
            Access::Clear => true,
            Access::Undefined => unreachable!("images are never returned to UNDEFINED"),
        };
        debug_assert!(
            to != Access::Read || from != Access::Undefined,
            "{:?} sampled before anything wrote it",
            lut
        );
        if needed {
            out.push(Transition { lut, from, to });
            self.state[lut.index()] = to;
        }
    }

    fn dispatch(&mut self, kernel: Kernel, push: PushConstants) {
        let mut ts = Vec::new();
        for &lut in kernel.reads() {
            self.transition(lut, Access::Read, &mut ts);
        }
        for &lut in kernel.writes() {
            self.transition(lut, Access::Write, &mut ts);
        }
        if !ts.is_empty() {
            self.commands.push(Command::Barrier(ts));
        }
        self.commands.push(Command::Dispatch { kernel, push });
    }

    fn clear(&mut self, lut: Lut) {
        let mut ts = Vec::new();
        self.transition(lut, Access::Clear, &mut ts);
        self.commands.push(Command::Barrier(ts));
        self.commands.push(Command::Clear(lut));
    }

    fn finalize(&mut self) {
        let mut ts = Vec::new();
        for &lut in &Lut::PERMANENT {
            let from = self.state[lut.index()];
            ts.push(Transition {
                lut,
                from,
                to: Access::Read,
            });
            self.state[lut.index()] = Access::Read;
        }
        self.commands.push(Command::Finalize(ts));
    }

    fn flush(&mut self, order: u32) {
        self.commands.push(Command::Flush { order });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lut_table() {
        let e = Lut::Transmittance.extent();
        assert_eq!((e.width, e.height, e.depth), (256, 64, 1));
        assert_eq!(Lut::Transmittance.mip_levels(), 9);
        let e = Lut::Irradiance.extent();
        assert_eq!((e.width, e.height, e.depth), (64, 16, 1));
        let e = Lut::Scattering.extent();
        assert_eq!((e.width, e.height, e.depth), (256, 128, 32));
        assert_eq!(Lut::Scattering.image_type(), vk::ImageType::TYPE_3D);
        for lut in Lut::ALL {
            assert_eq!(lut.format(), vk::Format::R32G32B32A32_SFLOAT);
            if lut != Lut::Transmittance {
                assert_eq!(lut.mip_levels(), 1);
            }
        }
        assert_eq!(Lut::DeltaE.extent(), Lut::Irradiance.extent());
        for lut in [Lut::DeltaSR, Lut::DeltaSM, Lut::DeltaJ] {
            assert_eq!(lut.extent(), Lut::Scattering.extent());
            assert!(lut.is_scratch());
        }
        assert!(!Lut::Transmittance.is_scratch());
    }

    #[test]
    fn groups_cover_output() {
        assert_eq!(Kernel::Transmittance.groups(), [32, 8, 1]);
        assert_eq!(Kernel::Irradiance1.groups(), [8, 2, 1]);
        assert_eq!(Kernel::InscatterN.groups(), [32, 16, 32]);
    }

    fn dispatches(s: &Schedule, kernel: Kernel) -> usize {
        s.commands()
            .iter()
            .filter(|c| matches!(c, Command::Dispatch { kernel: k, .. } if *k == kernel))
            .count()
    }

    #[test]
    fn loop_runs_order_minus_one_times() {
        for k in [2, 5, 10] {
            let s = Schedule::plan(k);
            let iterations = (k - 1) as usize;
            assert_eq!(dispatches(&s, Kernel::InscatterS), iterations);
            assert_eq!(dispatches(&s, Kernel::IrradianceN), iterations);
            assert_eq!(dispatches(&s, Kernel::InscatterN), iterations);
            assert_eq!(dispatches(&s, Kernel::CopyInscatterN), iterations);
            assert_eq!(dispatches(&s, Kernel::CopyIrradiance), iterations + 1);
            assert_eq!(dispatches(&s, Kernel::Transmittance), 1);
        }
        let s = Schedule::plan(1);
        assert_eq!(s.order(), 1);
        assert_eq!(dispatches(&s, Kernel::InscatterS), 0);
        assert_eq!(Schedule::plan(0).order(), 1);
        assert_eq!(Schedule::plan(0).commands(), s.commands());
    }

    /// Replays a schedule, checking every transition starts where the previous one left off and
    /// every dispatch sees its inputs read-only and its outputs writable.
    #[derive(Default)]
    struct Replay {
        state: std::collections::HashMap<Lut, Access>,
        flushes: Vec<u32>,
        finalized: bool,
        mips: Vec<Lut>,
        pushes: Vec<(Kernel, u32, f32)>,
    }

    impl Replay {
        fn get(&self, lut: Lut) -> Access {
            self.state.get(&lut).copied().unwrap_or(Access::Undefined)
        }

        fn apply(&mut self, ts: &[Transition]) {
            for t in ts {
                assert_eq!(self.get(t.lut), t.from, "{:?}", t);
                self.state.insert(t.lut, t.to);
            }
        }
    }

    impl Recorder for Replay {
        fn barrier(&mut self, ts: &[Transition]) -> Result<()> {
            assert!(!self.finalized);
            self.apply(ts);
            Ok(())
        }

        fn clear(&mut self, lut: Lut) -> Result<()> {
            assert!(!lut.is_scratch());
            assert_eq!(self.get(lut), Access::Clear);
            Ok(())
        }

        fn dispatch(&mut self, kernel: Kernel, push: PushConstants) -> Result<()> {
            for &lut in kernel.reads() {
                assert_eq!(self.get(lut), Access::Read, "{:?} reads {:?}", kernel, lut);
            }
            for &lut in kernel.writes() {
                assert_eq!(self.get(lut), Access::Write, "{:?} writes {:?}", kernel, lut);
            }
            self.pushes.push((kernel, push.first_order, push.scale));
            Ok(())
        }

        fn finalize(&mut self, ts: &[Transition]) -> Result<()> {
            self.apply(ts);
            self.finalized = true;
            Ok(())
        }

        fn flush(&mut self, order: u32) -> Result<()> {
            self.flushes.push(order);
            Ok(())
        }

        fn generate_mips(&mut self, lut: Lut) -> Result<()> {
            assert!(self.finalized);
            self.mips.push(lut);
            Ok(())
        }
    }

    #[test]
    fn every_read_sees_read_only() {
        let s = Schedule::plan(5);
        let mut replay = Replay::default();
        s.execute(&mut replay).unwrap();
        for lut in Lut::PERMANENT {
            assert_eq!(replay.get(lut), Access::Read);
        }
        assert_eq!(replay.mips, [Lut::Transmittance]);
    }

    #[test]
    fn waits_once_per_order() {
        let s = Schedule::plan(6);
        let mut replay = Replay::default();
        s.execute(&mut replay).unwrap();
        assert_eq!(replay.flushes, [1, 2, 3, 4, 5, 6]);
        // Finalization belongs to the last batch
        let finalize = s
            .commands()
            .iter()
            .position(|c| matches!(c, Command::Finalize(_)))
            .unwrap();
        let last_flush = s
            .commands()
            .iter()
            .rposition(|c| matches!(c, Command::Flush { .. }))
            .unwrap();
        assert_eq!(finalize + 1, last_flush);
    }

    #[test]
    fn accumulation_weights() {
        let s = Schedule::plan(3);
        let mut replay = Replay::default();
        s.execute(&mut replay).unwrap();
        let copies = replay
            .pushes
            .iter()
            .filter(|x| x.0 == Kernel::CopyIrradiance)
            .map(|x| x.2)
            .collect::<Vec<_>>();
        assert_eq!(copies, [0.0, 1.0, 1.0]);
        let density = replay
            .pushes
            .iter()
            .filter(|x| x.0 == Kernel::InscatterS)
            .map(|x| x.1)
            .collect::<Vec<_>>();
        assert_eq!(density, [1, 0]);
    }

    #[test]
    fn permanent_luts_cleared_before_accumulation() {
        let s = Schedule::plan(2);
        let clear = |lut: Lut| {
            s.commands()
                .iter()
                .position(|c| *c == Command::Clear(lut))
                .unwrap()
        };
        let first_write = |kernel: Kernel| {
            s.commands()
                .iter()
                .position(|c| matches!(c, Command::Dispatch { kernel: k, .. } if *k == kernel))
                .unwrap()
        };
        assert!(clear(Lut::Irradiance) < first_write(Kernel::CopyIrradiance));
        assert!(clear(Lut::Scattering) < first_write(Kernel::CopyInscatter1));
    }

    #[test]
    fn write_after_write_is_ordered() {
        let s = Schedule::plan(3);
        // The second irradiance accumulation must depend on the first
        let waw = s.commands().iter().any(|c| match c {
            Command::Barrier(ts) => ts.iter().any(|t| {
                t.lut == Lut::Irradiance && t.from == Access::Write && t.to == Access::Write
            }),
            _ => false,
        });
        assert!(waw);
    }
}
