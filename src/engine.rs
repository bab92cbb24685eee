//! The iterative Richardson–Lucy driver.
//!
//! One deconvolution run owns four working images: the current estimate, the
//! previous estimate, the estimate from two iterations back and a divergence
//! scratch buffer. Each iteration applies the ratio update through the OTF,
//! then either the plain product with the previous estimate or the
//! regularized product with the adaptively weighted divergence term, reports
//! the iteration readouts to the callback and rotates the history.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::fft::{PlanFactory, Scalar, Shape};
use crate::image::Image;
use crate::psf::Psf;
use crate::settings::Settings;

/// Iteration limit enforced by the default callback when none is set by the
/// caller.
pub const DEFAULT_MAX_ITERATIONS: usize = 100;

/// Number of trailing λ values the default callback compares against before
/// declaring the regularization weight to be decaying.
const LAMBDA_WINDOW: usize = 3;

/// Readouts delivered to the iteration callback.
///
/// The callback runs before the iteration's update, so at iteration 0 only
/// `snr` is meaningful: the statistics and norms are still zero and
/// `lambda_factor` holds its −1 sentinel. When regularization is disabled the
/// sentinel is reported on every iteration.
#[derive(Debug, Clone, Copy)]
pub struct IterationReport<T> {
    /// Iteration counter, from zero onwards.
    pub iteration: usize,
    /// Minimum voxel value of the current estimate.
    pub min: T,
    /// Maximum voxel value of the current estimate.
    pub max: T,
    /// Sum over the current estimate.
    pub sum: T,
    /// Squared distance between the current and the previous estimate.
    pub nrm2_prev: T,
    /// Squared distance between the current estimate and the one from two
    /// iterations back; meaningful from iteration 2 on.
    pub nrm2_prevprev: T,
    /// Regularization weight used in the last update.
    pub lambda: T,
    /// Scaling applied to the raw least-squares λ, fixed at iteration 0 from
    /// the SNR.
    pub lambda_factor: T,
    /// SNR estimate for the input image, user-supplied or measured.
    pub snr: T,
}

/// Iteration callback; returning `false` stops the reconstruction and the
/// current estimate is returned as-is.
pub type IterationCallback<T> = Box<dyn FnMut(&IterationReport<T>) -> bool + Send>;

/// Deconvolution and convolution driver holding the PSF, the plan settings
/// and the iteration controls.
pub(crate) struct Engine<T: Scalar> {
    settings: Arc<Settings<T>>,
    psf: Psf<T>,
    callback: Option<IterationCallback<T>>,
    regularize: bool,
    snr: Option<T>,
    max_iterations: usize,
    lambda_history: VecDeque<T>,
}

/// Stopping rule and console reporting used when no callback is registered:
/// log the readouts, remember the last [`LAMBDA_WINDOW`] λ values and
/// continue until the iteration limit is reached or, under regularization,
/// every remembered λ exceeds the current one.
fn default_callback<T: Scalar>(
    history: &mut VecDeque<T>,
    regularize: bool,
    max_iterations: usize,
    report: &IterationReport<T>,
) -> bool {
    let mut done = false;
    if regularize && history.len() >= LAMBDA_WINDOW {
        done = history.iter().all(|&past| past > report.lambda);
    }

    log::info!(
        "iter {}: min/max/sum {:.6e}/{:.6e}/{:.6e}  nrm2 (i)-(i-1)/(i)-(i-2) {:.6e}/{:.6e}  lambda {:.6e}  factor {:.6e}  snr {:.6e}",
        report.iteration,
        report.min.to_real(),
        report.max.to_real(),
        report.sum.to_real(),
        report.nrm2_prev.to_real(),
        report.nrm2_prevprev.to_real(),
        report.lambda.to_real(),
        report.lambda_factor.to_real(),
        report.snr.to_real(),
    );

    history.push_back(report.lambda);
    if history.len() > LAMBDA_WINDOW {
        history.pop_front();
    }

    !done && report.iteration < max_iterations
}

impl<T: Scalar> Engine<T> {
    pub fn new() -> Self {
        Self {
            settings: Settings::new(),
            psf: Psf::new(),
            callback: None,
            regularize: true,
            snr: None,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            lambda_history: VecDeque::new(),
        }
    }

    pub fn set_psf(&mut self, data: Vec<T>, shape: Shape, voxel: [T; 3]) -> Result<()> {
        self.psf.set(data, shape, voxel)
    }

    pub fn set_callback(&mut self, callback: IterationCallback<T>) {
        self.callback = Some(callback);
    }

    pub fn clear_callback(&mut self) {
        self.callback = None;
    }

    pub fn enable_regularization(&mut self) {
        self.regularize = true;
    }

    pub fn disable_regularization(&mut self) {
        self.regularize = false;
    }

    pub fn regularized(&self) -> bool {
        self.regularize
    }

    pub fn set_snr(&mut self, snr: T) -> Result<()> {
        if !(snr > T::zero()) {
            return Err(Error::User(format!(
                "SNR must be positive, got {}",
                snr.to_real()
            )));
        }
        self.snr = Some(snr);
        Ok(())
    }

    pub fn clear_snr(&mut self) {
        self.snr = None;
    }

    pub fn set_max_iterations(&mut self, iterations: usize) {
        self.max_iterations = iterations;
    }

    pub fn clear_max_iterations(&mut self) {
        self.max_iterations = DEFAULT_MAX_ITERATIONS;
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    pub fn set_plan_factory(&mut self, factory: Arc<dyn PlanFactory<T>>) {
        self.settings = Settings::derive(&self.settings, Some(factory));
    }

    pub fn clear_plan_factory(&mut self) {
        self.settings = Settings::derive(&self.settings, None);
    }

    /// Convolves `data` with the stored PSF on the given grid. Equivalent to
    /// the first estimate of a deconvolution run.
    pub fn convolve(&mut self, data: &[T], shape: Shape, voxel: [T; 3]) -> Result<Vec<T>> {
        if self.psf.is_empty() {
            return Err(Error::User(
                "cannot convolve without a PSF; set one before calling convolve".into(),
            ));
        }
        let otf = self.psf.otf(&self.settings, shape, voxel)?;
        let mut image = Image::from_data(Arc::clone(&self.settings), data, shape, voxel)?;
        image.convolve(&otf)?;
        let mut out = Vec::new();
        image.export(&mut out)?;
        Ok(out)
    }

    /// Runs the iterative reconstruction on `data` and returns the final
    /// estimate.
    pub fn deconvolve(&mut self, data: &[T], shape: Shape, voxel: [T; 3]) -> Result<Vec<T>> {
        if self.psf.is_empty() {
            return Err(Error::User(
                "cannot deconvolve without a PSF; set one before calling deconvolve".into(),
            ));
        }
        let otf = self.psf.otf(&self.settings, shape, voxel)?;

        let input = Image::from_data(Arc::clone(&self.settings), data, shape, voxel)?;
        let mut current = Image::from_data(Arc::clone(&self.settings), data, shape, voxel)?;
        let mut previous = Image::from_data(Arc::clone(&self.settings), data, shape, voxel)?;
        let mut two_back = Image::new(Arc::clone(&self.settings), shape, voxel)?;
        let mut divergence = Image::new(Arc::clone(&self.settings), shape, voxel)?;

        self.lambda_history.clear();

        let snr = match self.snr {
            Some(snr) => snr,
            None => current.snr(1)?,
        };

        // First estimate: the input blurred by the PSF.
        current.convolve(&otf)?;

        let mut lambda_factor = -T::one();
        let mut lambda = T::zero();
        let (mut min, mut max, mut sum) = (T::zero(), T::zero(), T::zero());
        let mut nrm2_prev = T::zero();
        let mut nrm2_prevprev = T::zero();

        let mut iteration = 0usize;
        loop {
            let report = IterationReport {
                iteration,
                min,
                max,
                sum,
                nrm2_prev,
                nrm2_prevprev,
                lambda,
                lambda_factor,
                snr,
            };
            let proceed = match self.callback.as_mut() {
                Some(callback) => callback(&report),
                None => default_callback(
                    &mut self.lambda_history,
                    self.regularize,
                    self.max_iterations,
                    &report,
                ),
            };
            if !proceed {
                break;
            }

            current.convolve(&otf)?;
            current.invdivide_image(&input)?;
            current.convolve_conj(&otf)?;

            if !self.regularize {
                current.prod_image(&previous)?;
            } else {
                divergence.div_unit_grad(&previous)?;
                let lambda_raw = Image::lambda_lsq(&current, &divergence)?;

                if iteration == 0 {
                    if lambda_raw < T::zero() {
                        return Err(Error::Numeric(format!(
                            "first estimate of the regularization factor is negative, cannot \
                             continue (lambda = {})",
                            lambda_raw.to_real()
                        )));
                    }
                    if lambda_raw.is_finite() && lambda_raw > T::zero() {
                        lambda_factor = T::from_real(50.0) / snr / lambda_raw;
                    }
                }

                // A non-finite estimate (flat divergence field) disables the
                // regularization term for this iteration, as does a negative
                // one after the first iteration.
                lambda = if lambda_factor > T::zero()
                    && lambda_raw.is_finite()
                    && lambda_raw > T::zero()
                {
                    lambda_raw * lambda_factor
                } else {
                    T::zero()
                };

                current.prod_regularized(&previous, lambda, &divergence)?;
            }

            let stats = current.get_stats();
            min = stats.0;
            max = stats.1;
            sum = stats.2;

            nrm2_prev = current.nrm2(&previous)?;
            if iteration > 1 {
                nrm2_prevprev = current.nrm2(&two_back)?;
            }

            two_back.swap(&mut previous);
            previous.copy_data(&current)?;
            iteration += 1;
        }

        let mut out = Vec::new();
        current.export(&mut out)?;
        Ok(out)
    }
}
