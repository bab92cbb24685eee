//! Padded 3-D image buffer and the numerical primitives of the
//! reconstruction.
//!
//! The buffer stores either a real image or its Hermitian half-spectrum in
//! the same allocation: each row along the fastest axis is `2·⌊n₃/2+1⌋`
//! scalars long, of which the first `n₃` carry the real payload. Real-space
//! operations skip the padding; transforms overwrite it. Whether a buffer
//! currently holds real or spectral data is not tracked here; the
//! deconvolution algorithm knows, and the primitives state their expectation.
//!
//! Pointwise operations, reductions and the divergence stencil fan out over
//! rows or outer planes with rayon; reduction partials are folded
//! sequentially so results are reproducible bit for bit.

use std::sync::Arc;

use num_traits::Float;
use rayon::prelude::*;

use crate::error::{internal_error, Error, Result};
use crate::fft::{as_complex, as_complex_mut, padded_row, spectral_row, Scalar, Shape, TransformPlan};
use crate::settings::Settings;

/// Absolute per-component tolerance for voxel-pitch equality, in the internal
/// length unit (nanometers).
const VOXEL_TOLERANCE: f64 = 1e-13;

/// A 3-D scalar image in the padded in-place transform layout, owning its
/// forward and inverse transform plans.
pub struct Image<T: Scalar> {
    settings: Arc<Settings<T>>,
    data: Vec<T>,
    shape: Shape,
    voxel: [T; 3],
    forward: Option<Box<dyn TransformPlan<T>>>,
    inverse: Option<Box<dyn TransformPlan<T>>>,
}

fn allocate<T: Scalar>(len: usize) -> Result<Vec<T>> {
    let mut data = Vec::new();
    data.try_reserve_exact(len).map_err(|_| {
        Error::Allocation(format!("failed to allocate an image buffer of {len} scalars"))
    })?;
    data.resize(len, T::zero());
    Ok(data)
}

fn check_shape(shape: Shape) -> Result<()> {
    if shape.iter().any(|&n| n == 0) {
        return Err(Error::User(format!(
            "image dimensions must all be positive, got {}x{}x{}",
            shape[0], shape[1], shape[2]
        )));
    }
    Ok(())
}

/// Argument of smaller magnitude when both share a sign, zero otherwise.
fn minmod<T: Scalar>(a: T, b: T) -> T {
    let zero = T::zero();
    if a < zero && b < zero {
        if a >= b {
            a
        } else {
            b
        }
    } else if a > zero && b > zero {
        if a < b {
            a
        } else {
            b
        }
    } else {
        zero
    }
}

fn hypot3<T: Scalar>(a: T, b: T, c: T) -> T {
    (a * a + b * b + c * c).sqrt()
}

impl<T: Scalar> Image<T> {
    /// Allocates a zero-filled image on the given grid.
    pub fn new(settings: Arc<Settings<T>>, shape: Shape, voxel: [T; 3]) -> Result<Self> {
        check_shape(shape)?;
        let [n1, n2, n3] = shape;
        let data = allocate(n1 * n2 * padded_row(n3))?;
        Ok(Self {
            settings,
            data,
            shape,
            voxel,
            forward: None,
            inverse: None,
        })
    }

    /// Allocates an image and copies `data` (length `n₁·n₂·n₃`, fastest axis
    /// last) into the padded layout row by row.
    pub fn from_data(
        settings: Arc<Settings<T>>,
        data: &[T],
        shape: Shape,
        voxel: [T; 3],
    ) -> Result<Self> {
        let [n1, n2, n3] = shape;
        if data.len() != n1 * n2 * n3 {
            return Err(Error::User(format!(
                "image data of {} values is inconsistent with dimensions {n1}x{n2}x{n3}",
                data.len()
            )));
        }
        let mut image = Self::new(settings, shape, voxel)?;
        let row = padded_row(n3);
        for (src, dst) in data.chunks_exact(n3).zip(image.data.chunks_exact_mut(row)) {
            dst[..n3].copy_from_slice(src);
        }
        Ok(image)
    }

    /// Image dimensions.
    pub fn shape(&self) -> Shape {
        self.shape
    }

    /// Voxel pitch in the internal length unit.
    pub fn voxel(&self) -> [T; 3] {
        self.voxel
    }

    /// Whether this image is on the given grid shape.
    pub fn same_dims(&self, shape: Shape) -> bool {
        self.shape == shape
    }

    /// Whether this image has the given voxel pitch, component-wise within
    /// the fixed tolerance.
    pub fn same_voxel(&self, voxel: [T; 3]) -> bool {
        let tol = T::from_real(VOXEL_TOLERANCE);
        self.voxel
            .iter()
            .zip(voxel.iter())
            .all(|(&a, &b)| Float::abs(a - b) < tol)
    }

    /// Whether pointwise operations between this image and `other` are
    /// defined: same shape and same voxel pitch.
    pub fn compatible(&self, other: &Self) -> bool {
        self.same_dims(other.shape) && self.same_voxel(other.voxel)
    }

    /// Applies the forward FFT in place, planning it on first use. After the
    /// call the buffer holds the half-spectrum.
    pub fn fft(&mut self) -> Result<()> {
        if self.forward.is_none() {
            self.forward = Some(self.settings.forward_plan(self.shape)?);
        }
        match self.forward.as_mut() {
            Some(plan) => plan.execute(&mut self.data),
            None => Err(internal_error!("forward plan missing after creation")),
        }
    }

    /// Applies the inverse FFT in place, planning it on first use. The
    /// result is not renormalized; the `1/N` factor is folded into
    /// [`Image::convolve`].
    pub fn ifft(&mut self) -> Result<()> {
        if self.inverse.is_none() {
            self.inverse = Some(self.settings.inverse_plan(self.shape)?);
        }
        match self.inverse.as_mut() {
            Some(plan) => plan.execute(&mut self.data),
            None => Err(internal_error!("inverse plan missing after creation")),
        }
    }

    /// Convolves this real image with a spectral kernel: FFT, pointwise
    /// multiply by `K̂/N`, inverse FFT. The kernel must be compatible and
    /// already transformed.
    pub fn convolve(&mut self, kernel: &Self) -> Result<()> {
        self.convolve_impl(kernel, false)
    }

    /// Like [`Image::convolve`] but multiplies by the conjugated kernel.
    pub fn convolve_conj(&mut self, kernel: &Self) -> Result<()> {
        self.convolve_impl(kernel, true)
    }

    fn convolve_impl(&mut self, kernel: &Self, conjugate: bool) -> Result<()> {
        if !self.compatible(kernel) {
            return Err(internal_error!("convolution attempted with an incompatible kernel"));
        }
        self.fft()?;

        let [n1, n2, n3] = self.shape;
        let scale = T::from_real((n1 * n2 * n3) as f64);
        let nc = spectral_row(n3);
        let spec = as_complex_mut(&mut self.data);
        let ker = as_complex(&kernel.data);
        spec.par_chunks_mut(nc)
            .zip(ker.par_chunks(nc))
            .for_each(|(s_row, k_row)| {
                for (s, k) in s_row.iter_mut().zip(k_row) {
                    let k = if conjugate { k.conj() } else { *k };
                    *s = *s * (k / scale);
                }
            });

        self.ifft()
    }

    /// The Richardson–Lucy ratio step: `this[i] ← other[i] / this[i]`, with
    /// zero written wherever the denominator voxel is not positive.
    pub fn invdivide_image(&mut self, other: &Self) -> Result<()> {
        if !self.compatible(other) {
            return Err(internal_error!("ratio step attempted between incompatible images"));
        }
        let n3 = self.shape[2];
        let row = padded_row(n3);
        self.data
            .par_chunks_mut(row)
            .zip(other.data.par_chunks(row))
            .for_each(|(d_row, o_row)| {
                for (d, o) in d_row[..n3].iter_mut().zip(&o_row[..n3]) {
                    let v = *d;
                    *d = if v <= T::zero() { T::zero() } else { *o / v };
                }
            });
        Ok(())
    }

    /// Pointwise product: `this[i] ← other[i] · this[i]`.
    pub fn prod_image(&mut self, other: &Self) -> Result<()> {
        if !self.compatible(other) {
            return Err(internal_error!("product attempted between incompatible images"));
        }
        let n3 = self.shape[2];
        let row = padded_row(n3);
        self.data
            .par_chunks_mut(row)
            .zip(other.data.par_chunks(row))
            .for_each(|(d_row, o_row)| {
                for (d, o) in d_row[..n3].iter_mut().zip(&o_row[..n3]) {
                    *d = *o * *d;
                }
            });
        Ok(())
    }

    /// Regularized product: `this[i] ← this[i] · other[i] / (1 − λ·div[i])`.
    ///
    /// There is no protection against a vanishing denominator; the engine
    /// keeps λ bounded so that `λ·div` stays away from unity.
    pub fn prod_regularized(&mut self, other: &Self, lambda: T, div: &Self) -> Result<()> {
        if !self.compatible(other) || !self.compatible(div) {
            return Err(internal_error!(
                "regularized product attempted between incompatible images"
            ));
        }
        let n3 = self.shape[2];
        let row = padded_row(n3);
        let one = T::one();
        self.data
            .par_chunks_mut(row)
            .zip(other.data.par_chunks(row).zip(div.data.par_chunks(row)))
            .for_each(|(d_row, (o_row, v_row))| {
                for ((d, o), v) in d_row[..n3].iter_mut().zip(&o_row[..n3]).zip(&v_row[..n3]) {
                    *d = *d * *o / (one - lambda * *v);
                }
            });
        Ok(())
    }

    /// Divergence of the normalized gradient of `image`, stored into `this`.
    ///
    /// One-sided differences with the voxel pitches as step widths; slopes
    /// are limited with [`minmod`] and indices saturate at the volume
    /// boundary. The stencil evaluates the normalized forward differences at
    /// the cell itself and at its three negative-axis neighbors, then sums
    /// their backward differences.
    pub fn div_unit_grad(&mut self, image: &Self) -> Result<()> {
        if !self.compatible(image) {
            return Err(internal_error!(
                "divergence stencil attempted between incompatible images"
            ));
        }
        let [n1, n2, n3] = self.shape;
        let row = padded_row(n3);
        let h1 = image.voxel[0];
        let h2 = image.voxel[1];
        let h3 = image.voxel[2];
        let zero = T::zero();
        let src = &image.data;
        let at = move |i: usize, j: usize, k: usize| src[(i * n2 + j) * row + k];

        self.data
            .par_chunks_mut(n2 * row)
            .enumerate()
            .for_each(|(i, plane)| {
                let im1 = i.saturating_sub(1);
                let ip1 = if i + 1 == n1 { i } else { i + 1 };

                for j in 0..n2 {
                    let jm1 = j.saturating_sub(1);
                    let jp1 = if j + 1 == n2 { j } else { j + 1 };

                    for k in 0..n3 {
                        let km1 = k.saturating_sub(1);
                        let kp1 = if k + 1 == n3 { k } else { k + 1 };

                        let fimjm = at(im1, jm1, k);
                        let fim = at(im1, j, k);
                        let fimkm = at(im1, j, km1);
                        let fimkp = at(im1, j, kp1);
                        let fimjp = at(im1, jp1, k);

                        let fjmkm = at(i, jm1, km1);
                        let fjm = at(i, jm1, k);
                        let fjmkp = at(i, jm1, kp1);

                        let fkm = at(i, j, km1);
                        let fijk = at(i, j, k);
                        let fkp = at(i, j, kp1);

                        let fjpkm = at(i, jp1, km1);
                        let fjp = at(i, jp1, k);

                        let fipjm = at(ip1, jm1, k);
                        let fipkm = at(ip1, j, km1);
                        let fip = at(ip1, j, k);

                        let mut dxpf = (fip - fijk) / h1;
                        let mut dxmf = (fijk - fim) / h1;
                        let mut dypf = (fjp - fijk) / h2;
                        let mut dymf = (fijk - fjm) / h2;
                        let mut dzpf = (fkp - fijk) / h3;
                        let mut dzmf = (fijk - fkm) / h3;
                        let aijk = hypot3(dxpf, minmod(dypf, dymf), minmod(dzpf, dzmf));
                        let bijk = hypot3(dypf, minmod(dxpf, dxmf), minmod(dzpf, dzmf));
                        let cijk = hypot3(dzpf, minmod(dypf, dymf), minmod(dxpf, dxmf));

                        let aijk = if aijk > zero { dxpf / aijk } else { zero };
                        let bijk = if bijk > zero { dypf / bijk } else { zero };
                        let cijk = if cijk > zero { dzpf / cijk } else { zero };

                        dxpf = (fijk - fim) / h1;
                        dypf = (fimjp - fim) / h2;
                        dymf = (fim - fimjm) / h2;
                        dzpf = (fimkp - fim) / h3;
                        dzmf = (fim - fimkm) / h3;
                        let aim = hypot3(dxpf, minmod(dypf, dymf), minmod(dzpf, dzmf));
                        let aim = if aim > zero { dxpf / aim } else { zero };

                        dxpf = (fipjm - fjm) / h1;
                        dxmf = (fjm - fimjm) / h1;
                        dypf = (fijk - fjm) / h2;
                        dzpf = (fjmkp - fjm) / h3;
                        dzmf = (fjm - fjmkm) / h3;
                        let bjm = hypot3(dypf, minmod(dxpf, dxmf), minmod(dzpf, dzmf));
                        let bjm = if bjm > zero { dypf / bjm } else { zero };

                        dxpf = (fipkm - fkm) / h1;
                        dxmf = (fjm - fimkm) / h1;
                        dypf = (fjpkm - fkm) / h2;
                        dymf = (fkm - fjmkm) / h2;
                        dzpf = (fijk - fkm) / h3;
                        let ckm = hypot3(dzpf, minmod(dypf, dymf), minmod(dxpf, dxmf));
                        let ckm = if ckm > zero { dzpf / ckm } else { zero };

                        let dxma = (aijk - aim) / h1;
                        let dymb = (bijk - bjm) / h2;
                        let dzmc = (cijk - ckm) / h3;

                        plane[j * row + k] = dxma + dymb + dzmc;
                    }
                }
            });
        Ok(())
    }

    /// Peak signal-to-noise estimate under Poisson statistics.
    ///
    /// Sums the `(2r+1)³` box around every interior position, takes the
    /// maximum box sum `S` and returns `√(S/(2r+1)³)`. Positions closer than
    /// `r` to the boundary are skipped; a shape too small to have an interior
    /// is rejected.
    pub fn snr(&self, kernel_size: usize) -> Result<T> {
        let [n1, n2, n3] = self.shape;
        let r = kernel_size;
        if n1 <= 2 * r || n2 <= 2 * r || n3 <= 2 * r {
            return Err(Error::User(format!(
                "image of {n1}x{n2}x{n3} voxels has no interior for an SNR box of half-width {r}"
            )));
        }
        let n2p = n2;
        let row = padded_row(n3);
        let data = &self.data;
        let at = move |i: usize, j: usize, k: usize| data[(i * n2p + j) * row + k];

        let peak = (r..n1 - r)
            .into_par_iter()
            .map(|i1| {
                let mut best = T::zero();
                for i2 in r..n2 - r {
                    for i3 in r..n3 - r {
                        let mut s = T::zero();
                        for j1 in i1 - r..=i1 + r {
                            for j2 in i2 - r..=i2 + r {
                                for j3 in i3 - r..=i3 + r {
                                    s = s + at(j1, j2, j3);
                                }
                            }
                        }
                        if s > best {
                            best = s;
                        }
                    }
                }
                best
            })
            .reduce(T::zero, |a, b| if a > b { a } else { b });

        let box_voxels = (2 * r + 1) * (2 * r + 1) * (2 * r + 1);
        Ok((peak / T::from_real(box_voxels as f64)).sqrt())
    }

    /// Minimum, maximum and sum of the real payload.
    pub fn get_stats(&self) -> (T, T, T) {
        let n3 = self.shape[2];
        let row = padded_row(n3);
        let partials: Vec<(T, T, T)> = self
            .data
            .par_chunks(row)
            .map(|r| {
                let mut mn = r[0];
                let mut mx = r[0];
                let mut sum = T::zero();
                for &v in &r[..n3] {
                    if v < mn {
                        mn = v;
                    }
                    if v > mx {
                        mx = v;
                    }
                    sum = sum + v;
                }
                (mn, mx, sum)
            })
            .collect();

        let mut mn = T::infinity();
        let mut mx = T::neg_infinity();
        let mut sum = T::zero();
        for (pmn, pmx, psum) in partials {
            if pmn < mn {
                mn = pmn;
            }
            if pmx > mx {
                mx = pmx;
            }
            sum = sum + psum;
        }
        (mn, mx, sum)
    }

    /// Sum of squared voxel differences against a compatible image. Used as
    /// a convergence readout; note that no square root is taken.
    pub fn nrm2(&self, other: &Self) -> Result<T> {
        if !self.compatible(other) {
            return Err(internal_error!("distance requested between incompatible images"));
        }
        let n3 = self.shape[2];
        let row = padded_row(n3);
        let partials: Vec<T> = self
            .data
            .par_chunks(row)
            .zip(other.data.par_chunks(row))
            .map(|(a_row, b_row)| {
                let mut acc = T::zero();
                for (a, b) in a_row[..n3].iter().zip(&b_row[..n3]) {
                    let d = *a - *b;
                    acc = acc + d * d;
                }
                acc
            })
            .collect();
        Ok(partials.into_iter().fold(T::zero(), |a, b| a + b))
    }

    /// Least-squares estimate of the regularization weight:
    /// `Σ (1 − cconv[i])·div[i] / Σ div[i]²`.
    ///
    /// A flat divergence field makes the denominator vanish and the quotient
    /// non-finite; the engine decides how to interpret that.
    pub fn lambda_lsq(cconv: &Self, div: &Self) -> Result<T> {
        if !cconv.compatible(div) {
            return Err(internal_error!(
                "regularization estimate requested for incompatible images"
            ));
        }
        let n3 = cconv.shape[2];
        let row = padded_row(n3);
        let one = T::one();
        let partials: Vec<(T, T)> = cconv
            .data
            .par_chunks(row)
            .zip(div.data.par_chunks(row))
            .map(|(c_row, d_row)| {
                let mut num = T::zero();
                let mut den = T::zero();
                for (c, d) in c_row[..n3].iter().zip(&d_row[..n3]) {
                    num = num + (one - *c) * *d;
                    den = den + *d * *d;
                }
                (num, den)
            })
            .collect();

        let mut num = T::zero();
        let mut den = T::zero();
        for (pn, pd) in partials {
            num = num + pn;
            den = den + pd;
        }
        Ok(num / den)
    }

    /// Swaps all owned state with `other`, plans included.
    pub fn swap(&mut self, other: &mut Self) {
        std::mem::swap(self, other);
    }

    /// Copies the full padded storage from a compatible image.
    pub fn copy_data(&mut self, other: &Self) -> Result<()> {
        if !self.compatible(other) {
            return Err(internal_error!("copy attempted between incompatible images"));
        }
        self.data.copy_from_slice(&other.data);
        Ok(())
    }

    /// Writes the real payload into `out` as a tightly packed `n₁·n₂·n₃`
    /// vector, replacing its previous contents.
    pub fn export(&self, out: &mut Vec<T>) -> Result<()> {
        let [n1, n2, n3] = self.shape;
        let row = padded_row(n3);
        out.clear();
        out.try_reserve_exact(n1 * n2 * n3).map_err(|_| {
            Error::Allocation(format!(
                "failed to allocate {} scalars for the exported image",
                n1 * n2 * n3
            ))
        })?;
        for r in self.data.chunks_exact(row) {
            out.extend_from_slice(&r[..n3]);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Arc<Settings<f64>> {
        Settings::new()
    }

    fn ramp(shape: Shape) -> Vec<f64> {
        let [n1, n2, n3] = shape;
        (0..n1 * n2 * n3).map(|i| (i % 17) as f64 * 0.5 + 1.0).collect()
    }

    #[test]
    fn from_data_export_round_trip() {
        let shape: Shape = [3, 4, 5];
        let data = ramp(shape);
        let image = Image::from_data(settings(), &data, shape, [1.0; 3]).unwrap();
        let mut out = Vec::new();
        image.export(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn construction_rejects_bad_input() {
        assert!(matches!(
            Image::from_data(settings(), &[1.0; 9], [2, 2, 2], [1.0; 3]),
            Err(Error::User(_))
        ));
        assert!(matches!(
            Image::<f64>::new(settings(), [2, 0, 2], [1.0; 3]),
            Err(Error::User(_))
        ));
    }

    #[test]
    fn copy_and_swap() {
        let shape: Shape = [2, 3, 4];
        let data_a = ramp(shape);
        let data_b: Vec<f64> = data_a.iter().map(|v| v * 2.0).collect();
        let mut a = Image::from_data(settings(), &data_a, shape, [1.0; 3]).unwrap();
        let mut b = Image::from_data(settings(), &data_b, shape, [1.0; 3]).unwrap();

        let mut out = Vec::new();
        a.copy_data(&b).unwrap();
        a.export(&mut out).unwrap();
        assert_eq!(out, data_b);

        let mut c = Image::from_data(settings(), &data_a, shape, [1.0; 3]).unwrap();
        c.swap(&mut b);
        c.export(&mut out).unwrap();
        assert_eq!(out, data_b);
        b.export(&mut out).unwrap();
        assert_eq!(out, data_a);

        // Two more swaps return to the starting assignment.
        c.swap(&mut b);
        c.swap(&mut b);
        c.export(&mut out).unwrap();
        assert_eq!(out, data_b);
    }

    #[test]
    fn incompatible_operands_are_internal_errors() {
        let mut a = Image::<f64>::new(settings(), [2, 2, 4], [1.0; 3]).unwrap();
        let b = Image::<f64>::new(settings(), [2, 2, 5], [1.0; 3]).unwrap();
        let c = Image::<f64>::new(settings(), [2, 2, 4], [2.0, 1.0, 1.0]).unwrap();
        assert!(matches!(a.prod_image(&b), Err(Error::Internal(_))));
        assert!(matches!(a.invdivide_image(&c), Err(Error::Internal(_))));
        assert!(matches!(a.copy_data(&b), Err(Error::Internal(_))));
    }

    #[test]
    fn fft_ifft_scales_by_n() {
        let shape: Shape = [4, 3, 6];
        let n = (4 * 3 * 6) as f64;
        let data = ramp(shape);
        let mut image = Image::from_data(settings(), &data, shape, [1.0; 3]).unwrap();
        image.fft().unwrap();
        image.ifft().unwrap();
        let mut out = Vec::new();
        image.export(&mut out).unwrap();
        for (o, d) in out.iter().zip(&data) {
            assert!((o - d * n).abs() < 1e-9 * n);
        }
    }

    #[test]
    fn convolve_with_delta_kernel_is_identity() {
        let shape: Shape = [4, 4, 4];
        let data = ramp(shape);
        let mut image = Image::from_data(settings(), &data, shape, [1.0; 3]).unwrap();

        let mut delta = vec![0.0; 64];
        delta[0] = 1.0;
        let mut kernel = Image::from_data(settings(), &delta, shape, [1.0; 3]).unwrap();
        kernel.fft().unwrap();

        image.convolve(&kernel).unwrap();
        let mut out = Vec::new();
        image.export(&mut out).unwrap();
        for (o, d) in out.iter().zip(&data) {
            assert!((o - d).abs() < 1e-10, "got {o}, expected {d}");
        }

        // The conjugate of an even real kernel is the same kernel.
        image.convolve_conj(&kernel).unwrap();
        image.export(&mut out).unwrap();
        for (o, d) in out.iter().zip(&data) {
            assert!((o - d).abs() < 1e-10);
        }
    }

    #[test]
    fn invdivide_guards_non_positive_denominators() {
        let shape: Shape = [1, 1, 4];
        let numer = Image::from_data(settings(), &[8.0, 6.0, 4.0, 2.0], shape, [1.0; 3]).unwrap();
        let mut denom =
            Image::from_data(settings(), &[2.0, 0.0, -1.0, 4.0], shape, [1.0; 3]).unwrap();
        denom.invdivide_image(&numer).unwrap();
        let mut out = Vec::new();
        denom.export(&mut out).unwrap();
        assert_eq!(out, vec![4.0, 0.0, 0.0, 0.5]);
    }

    #[test]
    fn prod_regularized_applies_weighted_denominator() {
        let shape: Shape = [1, 1, 2];
        let mut a = Image::from_data(settings(), &[2.0, 3.0], shape, [1.0; 3]).unwrap();
        let b = Image::from_data(settings(), &[4.0, 5.0], shape, [1.0; 3]).unwrap();
        let d = Image::from_data(settings(), &[0.5, -0.5], shape, [1.0; 3]).unwrap();
        a.prod_regularized(&b, 0.4, &d).unwrap();
        let mut out = Vec::new();
        a.export(&mut out).unwrap();
        assert!((out[0] - 2.0 * 4.0 / (1.0 - 0.4 * 0.5)).abs() < 1e-12);
        assert!((out[1] - 3.0 * 5.0 / (1.0 + 0.4 * 0.5)).abs() < 1e-12);
    }

    #[test]
    fn div_unit_grad_of_constant_is_zero() {
        let shape: Shape = [4, 4, 4];
        let constant = Image::from_data(settings(), &vec![3.5; 64], shape, [1.0; 3]).unwrap();
        let mut div = Image::new(settings(), shape, [1.0; 3]).unwrap();
        div.div_unit_grad(&constant).unwrap();
        let mut out = Vec::new();
        div.export(&mut out).unwrap();
        assert!(out.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn div_unit_grad_of_ramp_vanishes_in_the_interior() {
        let shape: Shape = [6, 5, 5];
        let [n1, n2, n3] = shape;
        let mut data = vec![0.0; n1 * n2 * n3];
        for i in 0..n1 {
            for j in 0..n2 {
                for k in 0..n3 {
                    data[(i * n2 + j) * n3 + k] = i as f64 * 0.7;
                }
            }
        }
        let ramp = Image::from_data(settings(), &data, shape, [0.7, 1.0, 1.0]).unwrap();
        let mut div = Image::new(settings(), shape, [0.7, 1.0, 1.0]).unwrap();
        div.div_unit_grad(&ramp).unwrap();
        let mut out = Vec::new();
        div.export(&mut out).unwrap();
        for i in 1..n1 - 1 {
            for j in 1..n2 - 1 {
                for k in 1..n3 - 1 {
                    let v = out[(i * n2 + j) * n3 + k];
                    assert!(v.abs() < 1e-12, "interior ({i},{j},{k}) = {v}");
                }
            }
        }
    }

    #[test]
    fn snr_of_constant_image_is_sqrt_c() {
        let shape: Shape = [5, 5, 5];
        let image = Image::from_data(settings(), &vec![4.0; 125], shape, [1.0; 3]).unwrap();
        let snr = image.snr(1).unwrap();
        assert!((snr - 2.0).abs() < 1e-12);
    }

    #[test]
    fn snr_rejects_empty_interior() {
        let image = Image::from_data(settings(), &vec![1.0; 8], [2, 2, 2], [1.0; 3]).unwrap();
        assert!(matches!(image.snr(1), Err(Error::User(_))));
    }

    #[test]
    fn stats_and_nrm2() {
        let shape: Shape = [2, 2, 3];
        let a = Image::from_data(
            settings(),
            &[1.0, -2.0, 3.0, 4.0, 0.5, 6.0, 7.0, 8.0, 9.0, 10.0, 11.0, 12.0],
            shape,
            [1.0; 3],
        )
        .unwrap();
        let (mn, mx, sum) = a.get_stats();
        assert_eq!(mn, -2.0);
        assert_eq!(mx, 12.0);
        assert!((sum - 69.5).abs() < 1e-12);

        let b = Image::from_data(settings(), &[0.0; 12], shape, [1.0; 3]).unwrap();
        assert_eq!(a.nrm2(&a).unwrap(), 0.0);
        let ab = a.nrm2(&b).unwrap();
        let ba = b.nrm2(&a).unwrap();
        assert_eq!(ab, ba);
        assert!(ab > 0.0);
    }

    #[test]
    fn lambda_lsq_matches_hand_computation() {
        let shape: Shape = [1, 1, 2];
        let cconv = Image::from_data(settings(), &[0.5, 2.0], shape, [1.0; 3]).unwrap();
        let div = Image::from_data(settings(), &[1.0, 2.0], shape, [1.0; 3]).unwrap();
        let lambda = Image::lambda_lsq(&cconv, &div).unwrap();
        assert!((lambda - (-1.5 / 5.0)).abs() < 1e-12);

        // Scaling div by α scales the estimate by 1/α.
        let div4 = Image::from_data(settings(), &[4.0, 8.0], shape, [1.0; 3]).unwrap();
        let lambda4 = Image::lambda_lsq(&cconv, &div4).unwrap();
        assert!((lambda4 - lambda / 4.0).abs() < 1e-12);
    }

    #[test]
    fn lambda_lsq_of_flat_divergence_is_not_finite() {
        let shape: Shape = [1, 1, 2];
        let cconv = Image::from_data(settings(), &[1.0, 1.0], shape, [1.0; 3]).unwrap();
        let div = Image::from_data(settings(), &[0.0, 0.0], shape, [1.0; 3]).unwrap();
        assert!(!Image::lambda_lsq(&cconv, &div).unwrap().is_finite());
    }
}
