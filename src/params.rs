use bytemuck::{Pod, Zeroable};

/// Physical characteristics of a planet's atmosphere
///
/// Distances in meters, coefficients in m^-1. These are consumed once by the precomputer, so
/// changing them requires building a new `Atmosphere`.
#[derive(Debug, Copy, Clone)]
pub struct AtmosphereParams {
    /// Radius of the planet's surface, `Rg`
    pub bottom_radius: f32,
    /// Radius of the top of the atmosphere, `Rt`
    pub top_radius: f32,
    /// Scale height of Rayleigh particles
    pub rayleigh_scale_height: f32,
    /// Scale height of Mie particles
    pub mie_scale_height: f32,
    /// Rayleigh scattering coefficients at sea level for each color's wavelength
    ///
    /// On Earth, Rayleigh scattering is responsible for blue skies and red sunsets, both due to the
    /// relatively high proportion of blue light which it scatters.
    pub rayleigh_scattering: [f32; 3],
    /// Mie scattering coefficient at sea level
    ///
    /// Mie scattering produces a white halo around the sun.
    pub mie_scattering: f32,
    /// Mie extinction coefficient, i.e. scattering + absorbtion
    pub mie_extinction: f32,
    /// Asymmetry factor of the Mie phase function, in [-1,1]
    pub mie_phase_g: f32,
    /// Average albedo of the ground
    pub ground_albedo: f32,
    /// Irradiance of sunlight outside of the atmosphere for each channel (W/m^2)
    pub solar_irradiance: [f32; 3],
}

/// Average index of refraction Earth's atmosphere, used to compute the default Rayleigh coefficients
pub const IOR_AIR: f32 = 1.0003;
/// Number density of Earth's atmosphere at sea level (molecules/m^3)
pub const DENSITY_AIR: f32 = 2.545e25;

// Wavelengths based on Bruneton
/// red wavelength
pub const LAMBDA_R: f32 = 680e-9;
/// green wavelength
pub const LAMBDA_G: f32 = 550e-9;
/// blue wavelength
pub const LAMBDA_B: f32 = 440e-9;

/// Irradiance of Sol at the top of Earth's atmosphere
///
/// Values from the 2000 ASTM Standard Extraterrestrial Spectrum Reference, for the wavelengths
/// above.
pub const SOL_IRRADIANCE: [f32; 3] = [1498.0, 1862.0, 1713.0];

/// Compute the Rayleigh scattering factor at a certain wavelength
///
/// `ior` - index of refraction
/// `molecular_density` - number of Rayleigh particles (i.e. molecules) per cubic meter at sea level
/// `wavelength` - wavelength to compute β_R for
pub fn beta_rayleigh(ior: f32, molecular_density: f32, wavelength: f32) -> f32 {
    8.0 * std::f32::consts::PI.powi(3) * (ior.powi(2) - 1.0).powi(2)
        / (3.0 * molecular_density * wavelength.powi(4))
}

impl Default for AtmosphereParams {
    fn default() -> Self {
        let r = beta_rayleigh(IOR_AIR, DENSITY_AIR, LAMBDA_R);
        let g = beta_rayleigh(IOR_AIR, DENSITY_AIR, LAMBDA_G);
        let b = beta_rayleigh(IOR_AIR, DENSITY_AIR, LAMBDA_B);
        // from Bruneton
        let mie_scattering = 2.0e-5;
        Self {
            bottom_radius: 6360e3,
            top_radius: 6420e3,
            rayleigh_scale_height: 8_000.0,
            mie_scale_height: 1_200.0,
            rayleigh_scattering: [r, g, b],
            mie_scattering,
            mie_extinction: mie_scattering / 0.9,
            mie_phase_g: 0.8,
            ground_albedo: 0.1,
            solar_irradiance: SOL_IRRADIANCE,
        }
    }
}

impl AtmosphereParams {
    /// `Rg` and `Rt` in kilometers, as supplied to the precompute kernels' specialization constants
    pub fn radii_km(&self) -> [f32; 2] {
        [self.bottom_radius / 1000.0, self.top_radius / 1000.0]
    }
}

/// std140 layout of `AtmosphereParams`, in kilometer units
#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
pub(crate) struct ParamsRaw {
    rayleigh_scattering: [f32; 3],
    bottom_radius: f32,
    solar_irradiance: [f32; 3],
    top_radius: f32,
    rayleigh_scale_height: f32,
    mie_scale_height: f32,
    mie_scattering: f32,
    mie_extinction: f32,
    mie_phase_g: f32,
    ground_albedo: f32,
    _padding: [f32; 2],
}

impl ParamsRaw {
    pub(crate) fn new(x: &AtmosphereParams) -> Self {
        // Coefficients are per meter; the kernels integrate over kilometers.
        let per_km = |c: f32| c * 1e3;
        Self {
            rayleigh_scattering: x.rayleigh_scattering.map(per_km),
            bottom_radius: x.bottom_radius / 1000.0,
            solar_irradiance: x.solar_irradiance,
            top_radius: x.top_radius / 1000.0,
            rayleigh_scale_height: x.rayleigh_scale_height / 1000.0,
            mie_scale_height: x.mie_scale_height / 1000.0,
            mie_scattering: per_km(x.mie_scattering),
            mie_extinction: per_km(x.mie_extinction),
            mie_phase_g: x.mie_phase_g,
            ground_albedo: x.ground_albedo,
            _padding: [0.0; 2],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn earth_rayleigh_is_blue() {
        let p = AtmosphereParams::default();
        let [r, g, b] = p.rayleigh_scattering;
        assert!(r < g && g < b);
        // Bruneton's tabulated blue coefficient is 33.1e-6 m^-1
        assert!((b - 33.1e-6).abs() < 3e-6, "{}", b);
    }

    #[test]
    fn raw_is_kilometers() {
        let p = AtmosphereParams::default();
        assert_eq!(p.radii_km(), [6360.0, 6420.0]);
        let raw = ParamsRaw::new(&p);
        assert_eq!(raw.bottom_radius, 6360.0);
        assert_eq!(raw.top_radius, 6420.0);
        assert_eq!(raw.rayleigh_scale_height, 8.0);
        assert_eq!(raw.mie_scale_height, 1.2);
        assert_eq!(std::mem::size_of::<ParamsRaw>() % 16, 0);
    }
}
