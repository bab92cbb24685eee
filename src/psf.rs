//! Point spread function storage and the optical transfer function cache.
//!
//! The raw PSF is kept exactly as measured, on its own voxel grid. When a
//! convolution or deconvolution needs a kernel for a target grid, the PSF is
//! resampled onto that grid by trilinear interpolation, circularly shifted so
//! its center lands on the DFT origin (convolution must not translate the
//! image), normalized to unit sum and transformed. The resulting OTF image is
//! cached and reused as long as the requested shape, voxel pitch and settings
//! generation stay the same.

use std::sync::Arc;

use ndarray::Array3;
use rayon::prelude::*;

use crate::error::{internal_error, Error, Result};
use crate::fft::{Scalar, Shape};
use crate::image::Image;
use crate::settings::Settings;

/// Measured point spread function with a lazily built, cached OTF.
pub struct Psf<T: Scalar> {
    data: Array3<T>,
    voxel: [T; 3],
    otf: Option<OtfEntry<T>>,
}

struct OtfEntry<T: Scalar> {
    generation: u64,
    image: Arc<Image<T>>,
}

/// Continuous source index for a target cell: the physical offset of the cell
/// center from the target-volume center, expressed in source voxels and
/// shifted to the source-array origin. Returns the integer cell and the
/// fractional offset within it.
fn source_index<T: Scalar>(
    i: usize,
    n: usize,
    target_pitch: T,
    source_pitch: T,
    m: usize,
) -> (isize, T) {
    let half = T::from_real(0.5);
    let d = target_pitch * (T::from_real(i as f64) + half - T::from_real(n as f64) * half);
    let ind = d / source_pitch + T::from_real(m as f64) * half - half;
    let j = ind.trunc();
    (j.to_real() as isize, ind - j)
}

/// Inverse of the circular origin shift `s = (i + n/2 + 1) mod n`.
fn unshift(s: usize, n: usize) -> usize {
    (s + n - n / 2 - 1) % n
}

impl<T: Scalar> Psf<T> {
    /// An empty PSF; set samples with [`Psf::set`] before requesting an OTF.
    pub fn new() -> Self {
        Self {
            data: Array3::zeros((0, 0, 0)),
            voxel: [T::zero(); 3],
            otf: None,
        }
    }

    /// Whether no PSF samples are currently stored.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Stores PSF samples (length `n₁·n₂·n₃`, fastest axis last) with their
    /// voxel pitch. An empty vector clears the PSF. Any cached OTF is
    /// dropped.
    pub fn set(&mut self, data: Vec<T>, shape: Shape, voxel: [T; 3]) -> Result<()> {
        self.otf = None;
        let [n1, n2, n3] = shape;
        if data.is_empty() {
            self.data = Array3::zeros((0, 0, 0));
            return Ok(());
        }
        if data.len() != n1 * n2 * n3 {
            return Err(Error::User(format!(
                "PSF data of {} values is inconsistent with dimensions {n1}x{n2}x{n3}",
                data.len()
            )));
        }
        self.data = Array3::from_shape_vec((n1, n2, n3), data)
            .map_err(|e| Error::User(format!("PSF data does not fit its dimensions: {e}")))?;
        self.voxel = voxel;
        Ok(())
    }

    /// The OTF for the given target grid under the given settings snapshot.
    ///
    /// Returns the cached image when the (generation, shape, voxel) tag
    /// matches the request; otherwise resamples, normalizes, transforms and
    /// replaces the cache entry.
    pub fn otf(
        &mut self,
        settings: &Arc<Settings<T>>,
        shape: Shape,
        voxel: [T; 3],
    ) -> Result<Arc<Image<T>>> {
        if self.is_empty() {
            return Err(internal_error!("requesting an OTF from an empty PSF"));
        }
        if let Some(entry) = &self.otf {
            if entry.generation == settings.generation()
                && entry.image.same_dims(shape)
                && entry.image.same_voxel(voxel)
            {
                return Ok(Arc::clone(&entry.image));
            }
        }

        let resampled = self.resample(shape, voxel);
        let mut image = Image::from_data(Arc::clone(settings), &resampled, shape, voxel)?;
        image.fft()?;
        let image = Arc::new(image);
        self.otf = Some(OtfEntry {
            generation: settings.generation(),
            image: Arc::clone(&image),
        });
        Ok(image)
    }

    /// Trilinear resampling of the PSF onto a target grid, with the circular
    /// origin shift applied and the result normalized to unit sum. Target
    /// cells that fall outside the measured PSF are zero.
    fn resample(&self, shape: Shape, voxel: [T; 3]) -> Vec<T> {
        let [n1, n2, n3] = shape;
        let mut out = vec![T::zero(); n1 * n2 * n3];

        out.par_chunks_mut(n2 * n3)
            .enumerate()
            .for_each(|(s1, plane)| {
                let i1 = unshift(s1, n1);
                let (j1, x1) = source_index(i1, n1, voxel[0], self.voxel[0], self.data.dim().0);
                for s2 in 0..n2 {
                    let i2 = unshift(s2, n2);
                    let (j2, x2) = source_index(i2, n2, voxel[1], self.voxel[1], self.data.dim().1);
                    for s3 in 0..n3 {
                        let i3 = unshift(s3, n3);
                        let (j3, x3) =
                            source_index(i3, n3, voxel[2], self.voxel[2], self.data.dim().2);
                        plane[s2 * n3 + s3] = self.interpolate(j1, j2, j3, x1, x2, x3);
                    }
                }
            });

        let sum = out.iter().fold(T::zero(), |a, &b| a + b);
        out.par_iter_mut().for_each(|v| *v = *v / sum);
        out
    }

    /// Trilinear combination of the eight samples surrounding the continuous
    /// source cell `(j+x)`; zero when the cell is outside the PSF.
    fn interpolate(&self, j1: isize, j2: isize, j3: isize, x1: T, x2: T, x3: T) -> T {
        let (m1, m2, m3) = self.data.dim();
        if j1 < 0 || j2 < 0 || j3 < 0 {
            return T::zero();
        }
        let (a, b, c) = (j1 as usize, j2 as usize, j3 as usize);
        if a + 1 >= m1 || b + 1 >= m2 || c + 1 >= m3 {
            return T::zero();
        }
        let one = T::one();

        let c000 = self.data[[a, b, c]];
        let c001 = self.data[[a, b, c + 1]];
        let c010 = self.data[[a, b + 1, c]];
        let c011 = self.data[[a, b + 1, c + 1]];
        let c100 = self.data[[a + 1, b, c]];
        let c101 = self.data[[a + 1, b, c + 1]];
        let c110 = self.data[[a + 1, b + 1, c]];
        let c111 = self.data[[a + 1, b + 1, c + 1]];

        let c00 = c000 * (one - x1) + c100 * x1;
        let c01 = c001 * (one - x1) + c101 * x1;
        let c10 = c010 * (one - x1) + c110 * x1;
        let c11 = c011 * (one - x1) + c111 * x1;

        let c0 = c00 * (one - x2) + c10 * x2;
        let c1 = c01 * (one - x2) + c11 * x2;

        c0 * (one - x3) + c1 * x3
    }
}

impl<T: Scalar> Default for Psf<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta_psf() -> Psf<f64> {
        let mut psf = Psf::new();
        let mut data = vec![0.0; 27];
        data[13] = 1.0; // center of a 3x3x3 cube
        psf.set(data, [3, 3, 3], [1.0; 3]).unwrap();
        psf
    }

    #[test]
    fn set_validates_length() {
        let mut psf = Psf::<f64>::new();
        assert!(matches!(
            psf.set(vec![1.0; 5], [2, 2, 2], [1.0; 3]),
            Err(Error::User(_))
        ));
        assert!(psf.set(Vec::new(), [0, 0, 0], [1.0; 3]).is_ok());
        assert!(psf.is_empty());
    }

    #[test]
    fn delta_resample_is_normalized_and_centered_at_origin() {
        let psf = delta_psf();
        let out = psf.resample([8, 8, 8], [1.0; 3]);
        let sum: f64 = out.iter().sum();
        assert!((sum - 1.0).abs() < 1e-12);
        // Equal pitches put the PSF center half a voxel off the cell centers,
        // spreading the unit mass over the 2x2x2 cells around the origin.
        assert!((out[0] - 0.125).abs() < 1e-12);
        assert!(out.iter().all(|v| *v >= 0.0));
    }

    #[test]
    fn otf_cache_hits_on_identical_key_and_misses_otherwise() {
        let mut psf = delta_psf();
        let settings = Settings::new();

        let a = psf.otf(&settings, [8, 8, 8], [1.0; 3]).unwrap();
        let b = psf.otf(&settings, [8, 8, 8], [1.0; 3]).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let c = psf.otf(&settings, [8, 8, 8], [2.0, 1.0, 1.0]).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));

        let d = psf.otf(&settings, [8, 8, 4], [2.0, 1.0, 1.0]).unwrap();
        assert!(!Arc::ptr_eq(&c, &d));

        // A derived settings snapshot invalidates the cache by generation.
        let derived = Settings::derive(&settings, None);
        let e = psf.otf(&derived, [8, 8, 4], [2.0, 1.0, 1.0]).unwrap();
        assert!(!Arc::ptr_eq(&d, &e));
    }

    #[test]
    fn otf_from_empty_psf_is_an_internal_error() {
        let mut psf = Psf::<f64>::new();
        let settings = Settings::new();
        assert!(matches!(
            psf.otf(&settings, [4, 4, 4], [1.0; 3]),
            Err(Error::Internal(_))
        ));
    }

    #[test]
    fn mutating_the_psf_drops_the_cached_otf() {
        let mut psf = delta_psf();
        let settings = Settings::new();
        let a = psf.otf(&settings, [8, 8, 8], [1.0; 3]).unwrap();

        let mut data = vec![0.0; 27];
        data[13] = 2.0;
        psf.set(data, [3, 3, 3], [1.0; 3]).unwrap();
        let b = psf.otf(&settings, [8, 8, 8], [1.0; 3]).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }

    /// The measured-PSF scenario of the reference harness: a separable
    /// Gaussian sampled at 41x41x81 with 0.05/0.05/0.15 pitch, resampled to a
    /// 128x128x120 grid with 0.01/0.01/0.05 pitch.
    #[test]
    fn gaussian_resample_sums_to_one_and_is_nonnegative() {
        let (n12, n3) = (41usize, 81usize);
        let mut data = Vec::with_capacity(n12 * n12 * n3);
        for i1 in -20i32..21 {
            for i2 in -20i32..21 {
                for i3 in -40i32..41 {
                    let v = (-(i1 as f64 * 0.05 / 0.2).powi(2)).exp()
                        * (-(i2 as f64 * 0.05 / 0.2).powi(2)).exp()
                        * (-(i3 as f64 * 0.15 / 0.8).powi(2)).exp();
                    data.push(v);
                }
            }
        }
        let mut psf = Psf::new();
        psf.set(data, [n12, n12, n3], [0.05, 0.05, 0.15]).unwrap();

        let out = psf.resample([128, 128, 120], [0.01, 0.01, 0.05]);
        let sum: f64 = out.iter().sum();
        assert!((sum - 1.0).abs() < 1e-8, "sum = {sum}");
        assert!(out.iter().all(|v| *v >= -1e-12));
    }
}
