use shrc::Shared;
use std::sync::Arc;

/// The handle operations the stress workload drives.
pub trait SharedHandle<T>: Clone + Default + Send + Sync {
    fn new(obj: T) -> Self;
    fn get(&self) -> Option<&T>;
    fn assign(&mut self, other: &Self);
    fn reset(&mut self);
}

impl<T: Send + Sync> SharedHandle<T> for Shared<T> {
    #[inline(always)]
    fn new(obj: T) -> Self {
        Shared::new(obj)
    }

    #[inline(always)]
    fn get(&self) -> Option<&T> {
        Shared::get(self)
    }

    #[inline(always)]
    fn assign(&mut self, other: &Self) {
        Shared::assign(self, other)
    }

    #[inline(always)]
    fn reset(&mut self) {
        Shared::reset(self)
    }
}

/// The standard library pointer, as a baseline.
impl<T: Send + Sync> SharedHandle<T> for Option<Arc<T>> {
    #[inline(always)]
    fn new(obj: T) -> Self {
        Some(Arc::new(obj))
    }

    #[inline(always)]
    fn get(&self) -> Option<&T> {
        self.as_deref()
    }

    #[inline(always)]
    fn assign(&mut self, other: &Self) {
        self.clone_from(other)
    }

    #[inline(always)]
    fn reset(&mut self) {
        *self = None;
    }
}
