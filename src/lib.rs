//! Richardson–Lucy deconvolution of 3-D images acquired under Poisson photon
//! noise, with an optional total-variation regularizer whose strength adapts
//! to the estimated signal-to-noise ratio of the input.
//!
//! The point spread function is set once, on its own voxel grid; for every
//! processed volume it is resampled onto the volume's grid, shifted to the
//! DFT origin, normalized and transformed into the optical transfer function,
//! which is cached across calls. Deconvolution then iterates the
//! multiplicative ratio update `o ← o · (H̄ ⋆ (d / (H ⋆ o)))`, optionally
//! damped by the divergence-of-unit-gradient regularizer with a per-iteration
//! least-squares weight λ. A callback observes every iteration and can stop
//! the reconstruction; without one, a default rule stops after a fixed number
//! of iterations or once λ has been decaying for three iterations.
//!
//! All voxel pitches at this interface are in meters; both `f32` and `f64`
//! volumes are supported.
//!
//! ```
//! use deconv3d::Deconvolver;
//!
//! let mut dec = Deconvolver::<f64>::new();
//!
//! // Impulse PSF measured on a 3x3x3 grid with 100 nm pitch.
//! let mut psf = vec![0.0; 27];
//! psf[13] = 1.0;
//! dec.set_psf(psf, [3, 3, 3], [100e-9; 3]).unwrap();
//!
//! dec.disable_regularization();
//! dec.set_max_iterations(5);
//!
//! let volume = vec![1.0; 4 * 4 * 4];
//! let restored = dec.deconvolve(&volume, [4, 4, 4], [100e-9; 3]).unwrap();
//! assert_eq!(restored.len(), volume.len());
//! ```

mod engine;
mod error;
mod fft;
mod image;
mod psf;
mod settings;

pub use engine::{IterationCallback, IterationReport, DEFAULT_MAX_ITERATIONS};
pub use error::{Error, Result};
pub use fft::{PlanFactory, Planners, Scalar, Shape, TransformPlan};
pub use image::Image;
pub use psf::Psf;
pub use settings::Settings;

use std::sync::Arc;

use engine::Engine;

/// Nanometers per meter; voxel pitches are converted once at this boundary
/// and handled in nanometers internally.
fn meters_to_nanometers<T: Scalar>(voxel_m: [T; 3]) -> [T; 3] {
    let k = T::from_real(1e9);
    [voxel_m[0] * k, voxel_m[1] * k, voxel_m[2] * k]
}

/// Convolution and deconvolution of 3-D images with a measured point spread
/// function.
///
/// Set the PSF with [`Deconvolver::set_psf`] before calling
/// [`Deconvolver::convolve`] or [`Deconvolver::deconvolve`]. Iteration
/// control, SNR and FFT planning can be customized through the remaining
/// setters; every setting keeps its value across calls until changed or
/// cleared.
pub struct Deconvolver<T: Scalar> {
    engine: Engine<T>,
}

impl<T: Scalar> Deconvolver<T> {
    /// A deconvolver with default settings: regularization enabled, SNR
    /// estimated from the data, the default iteration limit and internal FFT
    /// planning.
    pub fn new() -> Self {
        Self {
            engine: Engine::new(),
        }
    }

    /// Sets the point spread function used by the following operations.
    ///
    /// `data` has `shape[0]·shape[1]·shape[2]` samples with the last
    /// dimension changing the fastest; `voxel_m` is the PSF voxel pitch in
    /// meters. May be called repeatedly; the last PSF wins and any cached
    /// transfer function is discarded.
    pub fn set_psf(&mut self, data: Vec<T>, shape: Shape, voxel_m: [T; 3]) -> Result<()> {
        self.engine.set_psf(data, shape, meters_to_nanometers(voxel_m))
    }

    /// Registers an iteration callback.
    ///
    /// The callback runs once per iteration, before that iteration's update;
    /// returning `false` stops the reconstruction. While a callback is
    /// registered the default console reporting and stopping rules are
    /// bypassed entirely, including the iteration limit.
    pub fn set_callback<F>(&mut self, callback: F)
    where
        F: FnMut(&IterationReport<T>) -> bool + Send + 'static,
    {
        self.engine.set_callback(Box::new(callback));
    }

    /// Drops the registered callback and restores the default reporting and
    /// stopping behavior. Safe to call when no callback is set.
    pub fn clear_callback(&mut self) {
        self.engine.clear_callback();
    }

    /// Uses the regularized algorithm (the default).
    pub fn enable_regularization(&mut self) {
        self.engine.enable_regularization();
    }

    /// Uses the plain Richardson–Lucy update without regularization.
    pub fn disable_regularization(&mut self) {
        self.engine.disable_regularization();
    }

    /// Whether the regularized algorithm is in use.
    pub fn regularized(&self) -> bool {
        self.engine.regularized()
    }

    /// Fixes the SNR used to scale the regularization weight instead of
    /// estimating it from the data. Must be positive.
    pub fn set_snr(&mut self, snr: T) -> Result<()> {
        self.engine.set_snr(snr)
    }

    /// Reverts to estimating the SNR from the input image, assuming it holds
    /// unscaled photon counts.
    pub fn clear_snr(&mut self) {
        self.engine.clear_snr();
    }

    /// Sets the iteration limit enforced by the default callback.
    pub fn set_max_iterations(&mut self, iterations: usize) {
        self.engine.set_max_iterations(iterations);
    }

    /// Restores the default iteration limit.
    pub fn clear_max_iterations(&mut self) {
        self.engine.clear_max_iterations();
    }

    /// The iteration limit currently enforced by the default callback.
    pub fn max_iterations(&self) -> usize {
        self.engine.max_iterations()
    }

    /// Routes FFT plan construction through a caller-supplied factory.
    ///
    /// Derives a fresh settings generation, so transfer functions cached
    /// under the previous planning scheme are rebuilt on next use. Thread
    /// safety of the factory is the caller's responsibility.
    pub fn set_plan_factory(&mut self, factory: Arc<dyn PlanFactory<T>>) {
        self.engine.set_plan_factory(factory);
    }

    /// Reverts to the internal thread-safe FFT planning, again deriving a
    /// fresh settings generation.
    pub fn clear_plan_factory(&mut self) {
        self.engine.clear_plan_factory();
    }

    /// Convolves a volume with the stored PSF.
    ///
    /// `data` is `shape[0]·shape[1]·shape[2]` values, last dimension fastest;
    /// `voxel_m` is the volume's voxel pitch in meters. Returns the convolved
    /// volume in the same layout.
    pub fn convolve(&mut self, data: &[T], shape: Shape, voxel_m: [T; 3]) -> Result<Vec<T>> {
        self.engine.convolve(data, shape, meters_to_nanometers(voxel_m))
    }

    /// Deconvolves a volume, taking the stored PSF into account.
    ///
    /// The image is expected to carry Poisson noise (photon counts). Returns
    /// the reconstructed volume in the same layout as `data`.
    pub fn deconvolve(&mut self, data: &[T], shape: Shape, voxel_m: [T; 3]) -> Result<Vec<T>> {
        self.engine.deconvolve(data, shape, meters_to_nanometers(voxel_m))
    }
}

impl<T: Scalar> Default for Deconvolver<T> {
    fn default() -> Self {
        Self::new()
    }
}
