//! Immutable snapshot of the FFT-plan configuration in force.
//!
//! Images hold a shared reference to the snapshot they were built with and
//! ask it for plans on first use. Replacing the plan factory derives a new
//! snapshot with a bumped generation id; caches keyed by the id (the OTF
//! cache) detect staleness by plain integer comparison instead of comparing
//! factory objects.

use std::sync::Arc;

use crate::error::Result;
use crate::fft::{default_forward, default_inverse, PlanFactory, Scalar, Shape, TransformPlan};

/// Plan configuration snapshot with a monotonically increasing generation id.
pub struct Settings<T: Scalar> {
    factory: Option<Arc<dyn PlanFactory<T>>>,
    generation: u64,
}

impl<T: Scalar> Settings<T> {
    /// The initial snapshot: generation 0, internal default planning.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            factory: None,
            generation: 0,
        })
    }

    /// Derives a snapshot from `prev` with a new factory, bumping the
    /// generation. `None` reverts to the internal default planning path.
    pub fn derive(prev: &Self, factory: Option<Arc<dyn PlanFactory<T>>>) -> Arc<Self> {
        Arc::new(Self {
            factory,
            generation: prev.generation + 1,
        })
    }

    /// Generation id; two snapshots are considered equal iff the ids match.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Id-equality with another snapshot.
    pub fn same(&self, other: &Self) -> bool {
        self.generation == other.generation
    }

    pub(crate) fn forward_plan(&self, shape: Shape) -> Result<Box<dyn TransformPlan<T>>> {
        match &self.factory {
            Some(factory) => factory.forward(shape),
            None => default_forward(shape),
        }
    }

    pub(crate) fn inverse_plan(&self, shape: Shape) -> Result<Box<dyn TransformPlan<T>>> {
        match &self.factory {
            Some(factory) => factory.inverse(shape),
            None => default_inverse(shape),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFactory {
        forwards: AtomicUsize,
        inverses: AtomicUsize,
    }

    impl PlanFactory<f64> for CountingFactory {
        fn forward(&self, shape: Shape) -> Result<Box<dyn TransformPlan<f64>>> {
            self.forwards.fetch_add(1, Ordering::Relaxed);
            default_forward(shape)
        }

        fn inverse(&self, shape: Shape) -> Result<Box<dyn TransformPlan<f64>>> {
            self.inverses.fetch_add(1, Ordering::Relaxed);
            default_inverse(shape)
        }
    }

    #[test]
    fn derive_bumps_generation() {
        let base = Settings::<f64>::new();
        assert_eq!(base.generation(), 0);

        let custom = Settings::derive(
            &base,
            Some(Arc::new(CountingFactory {
                forwards: AtomicUsize::new(0),
                inverses: AtomicUsize::new(0),
            })),
        );
        assert_eq!(custom.generation(), 1);
        assert!(!custom.same(&base));

        // Reverting to defaults still derives a fresh generation.
        let reverted = Settings::derive(&custom, None);
        assert_eq!(reverted.generation(), 2);
    }

    #[test]
    fn custom_factory_receives_plan_requests() {
        let factory = Arc::new(CountingFactory {
            forwards: AtomicUsize::new(0),
            inverses: AtomicUsize::new(0),
        });
        let settings = Settings::derive(&Settings::<f64>::new(), Some(factory.clone()));

        settings.forward_plan([2, 2, 4]).unwrap();
        settings.forward_plan([2, 2, 4]).unwrap();
        settings.inverse_plan([2, 2, 4]).unwrap();

        assert_eq!(factory.forwards.load(Ordering::Relaxed), 2);
        assert_eq!(factory.inverses.load(Ordering::Relaxed), 1);
    }
}
