//! FFT planning and execution for padded 3-D image buffers.
//!
//! Transforms are in-place 3-D real↔complex DFTs over the padded layout used
//! by the image buffer: each row along the fastest axis holds
//! `2·⌊n₃/2+1⌋` scalars so the real payload and the Hermitian half-spectrum
//! share the same storage. A forward plan runs one real-to-complex pass per
//! row followed by complex passes along the two remaining axes; an inverse
//! plan runs the same stages in reverse. Neither direction renormalizes, so a
//! round trip scales by `n₁·n₂·n₃` and the `1/N` factor is folded into the
//! convolution kernels.
//!
//! Plans are created either by the internal default (a process-wide planner
//! cache per scalar type, serialized on a mutex) or by a caller-supplied
//! [`PlanFactory`], which bypasses the cache entirely.

use std::sync::{Arc, Mutex, OnceLock};

use num_complex::Complex;
use num_traits::Float;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use rustfft::{Fft, FftNum, FftPlanner};

use crate::error::{internal_error, Result};

/// Image dimensions `[n₁, n₂, n₃]`, the last axis varying the fastest.
pub type Shape = [usize; 3];

/// Number of scalars in one padded row along the fastest axis.
pub(crate) fn padded_row(n3: usize) -> usize {
    2 * (n3 / 2 + 1)
}

/// Number of complex bins in one half-spectrum row.
pub(crate) fn spectral_row(n3: usize) -> usize {
    n3 / 2 + 1
}

/// Reinterprets a padded scalar slice as its complex half-spectrum view.
///
/// `Complex<T>` is `repr(C)` with the alignment of `T`, so a row of `2k`
/// scalars is exactly `k` complex bins.
pub(crate) fn as_complex<T: Scalar>(data: &[T]) -> &[Complex<T>] {
    debug_assert_eq!(data.len() % 2, 0);
    unsafe { std::slice::from_raw_parts(data.as_ptr().cast(), data.len() / 2) }
}

/// Mutable variant of [`as_complex`].
pub(crate) fn as_complex_mut<T: Scalar>(data: &mut [T]) -> &mut [Complex<T>] {
    debug_assert_eq!(data.len() % 2, 0);
    unsafe { std::slice::from_raw_parts_mut(data.as_mut_ptr().cast(), data.len() / 2) }
}

/// Scalar element type of images and spectra.
///
/// Implemented for `f32` and `f64`. Besides the float operations, every
/// implementation carries the process-wide planner cache for its own
/// monomorphization so that plan construction is serialized per scalar type.
pub trait Scalar: FftNum + Float {
    /// Lossy conversion from `f64`, used for fixed algorithm constants.
    fn from_real(v: f64) -> Self;

    /// Widening conversion to `f64`, used for reporting and formatting.
    fn to_real(self) -> f64;

    /// Runs `f` with exclusive access to the process-wide planner cache.
    ///
    /// The cache is initialized exactly once; plan construction and lookup
    /// are serialized on its mutex. Custom [`PlanFactory`] implementations
    /// never go through here.
    fn with_planners<R>(f: impl FnOnce(&mut Planners<Self>) -> R) -> Result<R>;
}

/// The cached planner pair behind the default plan path.
pub struct Planners<T: FftNum> {
    /// Real↔complex planner for the fastest axis.
    pub real: RealFftPlanner<T>,
    /// Complex planner for the two remaining axes.
    pub complex: FftPlanner<T>,
}

impl<T: FftNum> Planners<T> {
    fn new() -> Self {
        Self {
            real: RealFftPlanner::new(),
            complex: FftPlanner::new(),
        }
    }
}

impl Scalar for f32 {
    fn from_real(v: f64) -> Self {
        v as f32
    }

    fn to_real(self) -> f64 {
        self as f64
    }

    fn with_planners<R>(f: impl FnOnce(&mut Planners<Self>) -> R) -> Result<R> {
        static PLANNERS: OnceLock<Mutex<Planners<f32>>> = OnceLock::new();
        let mut guard = PLANNERS
            .get_or_init(|| Mutex::new(Planners::new()))
            .lock()
            .map_err(|_| internal_error!("FFT planner cache mutex poisoned"))?;
        Ok(f(&mut guard))
    }
}

impl Scalar for f64 {
    fn from_real(v: f64) -> Self {
        v
    }

    fn to_real(self) -> f64 {
        self
    }

    fn with_planners<R>(f: impl FnOnce(&mut Planners<Self>) -> R) -> Result<R> {
        static PLANNERS: OnceLock<Mutex<Planners<f64>>> = OnceLock::new();
        let mut guard = PLANNERS
            .get_or_init(|| Mutex::new(Planners::new()))
            .lock()
            .map_err(|_| internal_error!("FFT planner cache mutex poisoned"))?;
        Ok(f(&mut guard))
    }
}

/// A pre-planned in-place 3-D transform bound to a fixed shape.
///
/// Forward plans expect the real payload in the padded layout and leave the
/// half-spectrum behind; inverse plans expect the half-spectrum and recover
/// the (unnormalized) real payload. Dropping a plan releases it. Plans are
/// `Send + Sync` so that images owning them can be shared or handed between
/// threads; all mutation goes through the exclusive `execute` borrow.
pub trait TransformPlan<T: Scalar>: Send + Sync {
    /// Executes the transform over the padded buffer.
    fn execute(&mut self, data: &mut [T]) -> Result<()>;
}

/// Creates forward and inverse transform plans.
///
/// Implement this to route plan construction through an application-wide
/// planning scheme. Factories are shared through settings snapshots; when a
/// snapshot carries no factory the internal default is used. Thread safety of
/// a custom factory is the implementer's responsibility.
pub trait PlanFactory<T: Scalar>: Send + Sync {
    /// Plans the forward (real-to-complex) transform for `shape`.
    fn forward(&self, shape: Shape) -> Result<Box<dyn TransformPlan<T>>>;

    /// Plans the inverse (complex-to-real) transform for `shape`.
    fn inverse(&self, shape: Shape) -> Result<Box<dyn TransformPlan<T>>>;
}

struct DefaultForward<T: Scalar> {
    shape: Shape,
    r2c: Arc<dyn RealToComplex<T>>,
    fft_mid: Arc<dyn Fft<T>>,
    fft_slow: Arc<dyn Fft<T>>,
    line_real: Vec<T>,
    line: Vec<Complex<T>>,
    r2c_scratch: Vec<Complex<T>>,
    c2c_scratch: Vec<Complex<T>>,
}

struct DefaultInverse<T: Scalar> {
    shape: Shape,
    c2r: Arc<dyn ComplexToReal<T>>,
    ifft_mid: Arc<dyn Fft<T>>,
    ifft_slow: Arc<dyn Fft<T>>,
    line_real: Vec<T>,
    line_spec: Vec<Complex<T>>,
    line: Vec<Complex<T>>,
    c2r_scratch: Vec<Complex<T>>,
    c2c_scratch: Vec<Complex<T>>,
}

fn complex_zeros<T: Scalar>(len: usize) -> Vec<Complex<T>> {
    vec![Complex::new(T::zero(), T::zero()); len]
}

/// Builds the default forward plan for `shape`.
pub(crate) fn default_forward<T: Scalar>(shape: Shape) -> Result<Box<dyn TransformPlan<T>>> {
    let [n1, n2, n3] = shape;
    let (r2c, fft_mid, fft_slow) = T::with_planners(|p| {
        (
            p.real.plan_fft_forward(n3),
            p.complex.plan_fft_forward(n2),
            p.complex.plan_fft_forward(n1),
        )
    })?;
    let c2c_scratch_len = fft_mid
        .get_inplace_scratch_len()
        .max(fft_slow.get_inplace_scratch_len());
    Ok(Box::new(DefaultForward {
        shape,
        line_real: vec![T::zero(); n3],
        line: complex_zeros(n1.max(n2)),
        r2c_scratch: complex_zeros(r2c.get_scratch_len()),
        c2c_scratch: complex_zeros(c2c_scratch_len),
        r2c,
        fft_mid,
        fft_slow,
    }))
}

/// Builds the default inverse plan for `shape`.
pub(crate) fn default_inverse<T: Scalar>(shape: Shape) -> Result<Box<dyn TransformPlan<T>>> {
    let [n1, n2, n3] = shape;
    let (c2r, ifft_mid, ifft_slow) = T::with_planners(|p| {
        (
            p.real.plan_fft_inverse(n3),
            p.complex.plan_fft_inverse(n2),
            p.complex.plan_fft_inverse(n1),
        )
    })?;
    let c2c_scratch_len = ifft_mid
        .get_inplace_scratch_len()
        .max(ifft_slow.get_inplace_scratch_len());
    Ok(Box::new(DefaultInverse {
        shape,
        line_real: vec![T::zero(); n3],
        line_spec: complex_zeros(spectral_row(n3)),
        line: complex_zeros(n1.max(n2)),
        c2r_scratch: complex_zeros(c2r.get_scratch_len()),
        c2c_scratch: complex_zeros(c2c_scratch_len),
        c2r,
        ifft_mid,
        ifft_slow,
    }))
}

fn check_len<T: Scalar>(data: &[T], shape: Shape) -> Result<()> {
    let [n1, n2, n3] = shape;
    if data.len() != n1 * n2 * padded_row(n3) {
        return Err(internal_error!(
            "buffer of {} scalars does not match the planned shape {}x{}x{}",
            data.len(),
            n1,
            n2,
            n3
        ));
    }
    Ok(())
}

/// Complex pass along the middle axis: for every outer plane, each spectral
/// bin column of length `n₂` is gathered, transformed and scattered back.
fn pass_mid<T: Scalar>(
    spec: &mut [Complex<T>],
    fft: &dyn Fft<T>,
    line: &mut [Complex<T>],
    scratch: &mut [Complex<T>],
    shape: Shape,
) {
    let [n1, n2, n3] = shape;
    let nc = spectral_row(n3);
    for plane in spec.chunks_exact_mut(n2 * nc).take(n1) {
        for m in 0..nc {
            for j in 0..n2 {
                line[j] = plane[j * nc + m];
            }
            fft.process_with_scratch(&mut line[..n2], scratch);
            for j in 0..n2 {
                plane[j * nc + m] = line[j];
            }
        }
    }
}

/// Complex pass along the slowest axis, stride `n₂·(n₃/2+1)` between samples.
fn pass_slow<T: Scalar>(
    spec: &mut [Complex<T>],
    fft: &dyn Fft<T>,
    line: &mut [Complex<T>],
    scratch: &mut [Complex<T>],
    shape: Shape,
) {
    let [n1, n2, n3] = shape;
    let nc = spectral_row(n3);
    let stride = n2 * nc;
    for i2 in 0..n2 {
        for m in 0..nc {
            let base = i2 * nc + m;
            for i in 0..n1 {
                line[i] = spec[i * stride + base];
            }
            fft.process_with_scratch(&mut line[..n1], scratch);
            for i in 0..n1 {
                spec[i * stride + base] = line[i];
            }
        }
    }
}

impl<T: Scalar> TransformPlan<T> for DefaultForward<T> {
    fn execute(&mut self, data: &mut [T]) -> Result<()> {
        check_len(data, self.shape)?;
        let [_, _, n3] = self.shape;
        let row = padded_row(n3);

        for r in data.chunks_exact_mut(row) {
            self.line_real.copy_from_slice(&r[..n3]);
            self.r2c
                .process_with_scratch(&mut self.line_real, as_complex_mut(r), &mut self.r2c_scratch)
                .map_err(|e| internal_error!("forward real transform failed: {e}"))?;
        }

        let spec = as_complex_mut(data);
        pass_mid(spec, self.fft_mid.as_ref(), &mut self.line, &mut self.c2c_scratch, self.shape);
        pass_slow(spec, self.fft_slow.as_ref(), &mut self.line, &mut self.c2c_scratch, self.shape);
        Ok(())
    }
}

impl<T: Scalar> TransformPlan<T> for DefaultInverse<T> {
    fn execute(&mut self, data: &mut [T]) -> Result<()> {
        check_len(data, self.shape)?;
        let [_, _, n3] = self.shape;
        let row = padded_row(n3);
        let nc = spectral_row(n3);

        let spec = as_complex_mut(data);
        pass_slow(spec, self.ifft_slow.as_ref(), &mut self.line, &mut self.c2c_scratch, self.shape);
        pass_mid(spec, self.ifft_mid.as_ref(), &mut self.line, &mut self.c2c_scratch, self.shape);

        for r in data.chunks_exact_mut(row) {
            self.line_spec.copy_from_slice(as_complex(r));
            // The DC and Nyquist bins of a Hermitian spectrum are real; drop
            // the rounding residue before the real transform.
            self.line_spec[0].im = T::zero();
            if n3 % 2 == 0 {
                self.line_spec[nc - 1].im = T::zero();
            }
            self.c2r
                .process_with_scratch(&mut self.line_spec, &mut self.line_real, &mut self.c2r_scratch)
                .map_err(|e| internal_error!("inverse real transform failed: {e}"))?;
            r[..n3].copy_from_slice(&self.line_real);
        }
        Ok(())
    }
}
