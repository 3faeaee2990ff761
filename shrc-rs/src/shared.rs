use std::{
    fmt,
    marker::PhantomData,
    mem::{self, ManuallyDrop},
    ptr::{self, NonNull},
    sync::atomic::Ordering,
};

use static_assertions::const_assert;

use crate::counter::Counter;

/// The payload and the counter of one family of handles.
///
/// Both live in their own heap allocation and are freed together, by the
/// release that takes the counter to zero.
struct Pair<T> {
    payload: NonNull<T>,
    count: NonNull<Counter>,
}

impl<T> Clone for Pair<T> {
    #[inline(always)]
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Pair<T> {}

impl<T> PartialEq for Pair<T> {
    #[inline(always)]
    fn eq(&self, other: &Self) -> bool {
        self.payload == other.payload && self.count == other.count
    }
}

impl<T> Pair<T> {
    /// Takes over `payload` and gives it a counter holding one reference.
    fn new(payload: Box<T>) -> Self {
        // The counter is allocated while `payload` is still boxed, so an
        // allocation failure that unwinds frees the payload with it.
        let count = Box::new(Counter::new());
        count.init();
        Self {
            payload: NonNull::from(Box::leak(payload)),
            count: NonNull::from(Box::leak(count)),
        }
    }

    #[inline(always)]
    fn counter(&self) -> &Counter {
        unsafe { self.count.as_ref() }
    }

    /// Gives up one reference and frees the pair if it was the last one.
    ///
    /// # Safety
    ///
    /// The caller must own one reference to the pair and must not touch the
    /// pair afterwards.
    unsafe fn release(self) {
        if self.counter().decrement() {
            // The counter storage goes even if the payload's destructor panics.
            scopeguard::defer! {
                drop(Box::from_raw(self.count.as_ptr()));
            }
            drop(Box::from_raw(self.payload.as_ptr()));
        }
    }
}

/// A shared-ownership handle to a heap-allocated `T`.
///
/// Every handle of a family points at the same payload and the same atomic
/// counter. Copying a handle ([`Clone`], [`Shared::assign`]) increments the
/// counter, dropping or reassigning one decrements it, and the decrement that
/// reaches zero frees both allocations.
///
/// A handle is either empty or owning. Only the counter is synchronized; the
/// payload is handed out as `&T`, so sharing a handle across threads requires
/// `T: Send + Sync`.
pub struct Shared<T> {
    pair: Option<Pair<T>>,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send + Sync> Send for Shared<T> {}
unsafe impl<T: Send + Sync> Sync for Shared<T> {}

// An empty handle is encoded in the niche of the payload pointer.
const_assert!(mem::size_of::<Shared<u8>>() == 2 * mem::size_of::<usize>());

impl<T> Shared<T> {
    /// Creates an empty handle. Nothing is allocated.
    #[inline(always)]
    pub const fn null() -> Self {
        Self {
            pair: None,
            _marker: PhantomData,
        }
    }

    /// Moves `obj` to the heap and creates the first handle to it.
    #[inline]
    pub fn new(obj: T) -> Self {
        Self::from_box(Box::new(obj))
    }

    /// Builds the payload with `init` and creates the first handle to it.
    ///
    /// ```
    /// use shrc::Shared;
    ///
    /// let h = Shared::new_with(|| String::from("payload"));
    /// assert_eq!(h.get().map(String::as_str), Some("payload"));
    /// ```
    #[inline]
    pub fn new_with<F>(init: F) -> Self
    where
        F: FnOnce() -> T,
    {
        Self::from_box(Box::new(init()))
    }

    /// Takes ownership of an already allocated payload.
    ///
    /// The payload keeps its address, so [`Shared::as_ptr`] returns the same
    /// pointer the box held.
    #[inline]
    pub fn from_box(payload: Box<T>) -> Self {
        Self {
            pair: Some(Pair::new(payload)),
            _marker: PhantomData,
        }
    }

    /// Takes ownership of a raw payload pointer. A null pointer gives an
    /// empty handle.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or come from [`Box::into_raw`], and nothing else may
    /// use or free it afterwards.
    #[inline]
    pub unsafe fn from_raw(ptr: *mut T) -> Self {
        if ptr.is_null() {
            Self::null()
        } else {
            Self::from_box(Box::from_raw(ptr))
        }
    }

    /// Makes this handle share `other`'s payload.
    ///
    /// The reference this handle held is released first, with the same logic
    /// as [`Drop`], and only then is the new one taken. Assigning a handle of
    /// the same family is a no-op.
    pub fn assign(&mut self, other: &Self) {
        if self.pair == other.pair {
            return;
        }
        if let Some(old) = self.pair.take() {
            unsafe { old.release() };
        }
        self.pair = other.pair;
        if let Some(pair) = self.pair {
            pair.counter().increment();
        }
    }

    /// Releases the payload and leaves this handle empty.
    #[inline]
    pub fn reset(&mut self) {
        if let Some(old) = self.pair.take() {
            unsafe { old.release() };
        }
    }

    /// Moves the reference out of this handle without touching the counter,
    /// leaving this handle empty.
    #[inline]
    pub fn take(&mut self) -> Self {
        Self {
            pair: self.pair.take(),
            _marker: PhantomData,
        }
    }

    /// Returns the payload pointer, or null for an empty handle. The counter
    /// is not touched.
    #[inline(always)]
    pub fn as_ptr(&self) -> *const T {
        self.pair
            .map_or(ptr::null(), |pair| pair.payload.as_ptr() as *const T)
    }

    #[inline(always)]
    pub fn get(&self) -> Option<&T> {
        self.pair
            .as_ref()
            .map(|pair| unsafe { pair.payload.as_ref() })
    }

    /// Returns a mutable reference to the payload if no other handle shares it.
    #[inline]
    pub fn get_mut(&mut self) -> Option<&mut T> {
        let pair = self.pair.as_mut()?;
        // Pairs with the release half of other owners' decrements.
        if pair.counter().load(Ordering::Acquire) != 1 {
            return None;
        }
        Some(unsafe { pair.payload.as_mut() })
    }

    /// Returns the payload by value if this is its last handle. Otherwise the
    /// reference is released and `None` is returned.
    pub fn into_inner(self) -> Option<T> {
        let this = ManuallyDrop::new(self);
        let pair = this.pair?;
        if !pair.counter().decrement() {
            return None;
        }
        unsafe {
            drop(Box::from_raw(pair.count.as_ptr()));
            Some(*Box::from_raw(pair.payload.as_ptr()))
        }
    }

    #[inline(always)]
    pub fn is_null(&self) -> bool {
        self.pair.is_none()
    }

    /// The number of handles sharing the payload, or 0 for an empty handle.
    ///
    /// The value may be stale as soon as it is returned if other threads hold
    /// handles of the same family.
    #[inline]
    pub fn ref_count(&self) -> usize {
        self.pair
            .map_or(0, |pair| pair.counter().load(Ordering::Relaxed))
    }

    /// Whether both handles belong to the same family. Two empty handles are
    /// equal.
    #[inline(always)]
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        this.pair == other.pair
    }
}

impl<T> Clone for Shared<T> {
    #[inline]
    fn clone(&self) -> Self {
        if let Some(pair) = self.pair {
            pair.counter().increment();
        }
        Self {
            pair: self.pair,
            _marker: PhantomData,
        }
    }

    #[inline]
    fn clone_from(&mut self, source: &Self) {
        self.assign(source);
    }
}

impl<T> Drop for Shared<T> {
    #[inline]
    fn drop(&mut self) {
        if let Some(pair) = self.pair.take() {
            unsafe { pair.release() };
        }
    }
}

impl<T> Default for Shared<T> {
    #[inline(always)]
    fn default() -> Self {
        Self::null()
    }
}

impl<T> From<Box<T>> for Shared<T> {
    #[inline]
    fn from(payload: Box<T>) -> Self {
        Self::from_box(payload)
    }
}

impl<T: fmt::Debug> fmt::Debug for Shared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(payload) => f.debug_tuple("Shared").field(payload).finish(),
            None => f.write_str("Shared(empty)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Shared;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Tracked {
        value: i32,
        drops: Arc<AtomicUsize>,
    }

    impl Tracked {
        fn new(value: i32, drops: &Arc<AtomicUsize>) -> Self {
            Self {
                value,
                drops: drops.clone(),
            }
        }
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn empty_handle() {
        let h = Shared::<i32>::default();
        assert!(h.is_null());
        assert!(h.as_ptr().is_null());
        assert!(h.get().is_none());
        assert_eq!(h.ref_count(), 0);

        let copy = h.clone();
        assert!(copy.is_null());
        assert_eq!(copy.ref_count(), 0);
        assert!(Shared::ptr_eq(&h, &copy));
    }

    #[test]
    fn in_place_then_clone_then_drop() {
        let drops = Arc::new(AtomicUsize::new(0));
        let h1 = Shared::new_with(|| Tracked::new(42, &drops));
        assert_eq!(h1.get().unwrap().value, 42);
        assert_eq!(h1.ref_count(), 1);

        let h2 = h1.clone();
        assert_eq!(h1.ref_count(), 2);
        assert_eq!(h1.as_ptr(), h2.as_ptr());

        drop(h1);
        assert_eq!(h2.ref_count(), 1);
        assert_eq!(h2.get().unwrap().value, 42);
        assert_eq!(drops.load(Ordering::Relaxed), 0);

        drop(h2);
        assert_eq!(drops.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn assign_from_raw_into_empty() {
        let drops = Arc::new(AtomicUsize::new(0));
        let raw = Box::into_raw(Box::new(Tracked::new(7, &drops)));
        let h1 = unsafe { Shared::from_raw(raw) };
        assert_eq!(h1.as_ptr(), raw as *const _);

        let mut h2 = Shared::null();
        h2.assign(&h1);
        assert_eq!(h1.ref_count(), 2);

        drop(h1);
        assert_eq!(drops.load(Ordering::Relaxed), 0);
        drop(h2);
        assert_eq!(drops.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn from_null_raw_is_empty() {
        let h = unsafe { Shared::<i32>::from_raw(std::ptr::null_mut()) };
        assert!(h.is_null());
    }

    #[test]
    fn assign_releases_old_family() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut a = Shared::new(Tracked::new(1, &drops));
        let b = Shared::new(Tracked::new(2, &drops));

        a.assign(&b);
        assert_eq!(drops.load(Ordering::Relaxed), 1);
        assert_eq!(a.get().unwrap().value, 2);
        assert_eq!(b.ref_count(), 2);
        assert!(Shared::ptr_eq(&a, &b));

        drop(a);
        drop(b);
        assert_eq!(drops.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn assign_keeps_old_family_alive_when_shared() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut a = Shared::new(Tracked::new(1, &drops));
        let a2 = a.clone();
        let b = Shared::new(Tracked::new(2, &drops));

        a.assign(&b);
        assert_eq!(drops.load(Ordering::Relaxed), 0);
        assert_eq!(a2.ref_count(), 1);
        assert_eq!(b.ref_count(), 2);
    }

    #[test]
    fn assign_within_family_is_noop() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut a = Shared::new(Tracked::new(3, &drops));
        let b = a.clone();
        assert_eq!(a.ref_count(), 2);

        a.assign(&b);
        assert_eq!(a.ref_count(), 2);
        a.clone_from(&b);
        assert_eq!(a.ref_count(), 2);

        let snapshot = a.clone();
        a.assign(&snapshot);
        assert_eq!(a.ref_count(), 3);
        assert_eq!(a.get().unwrap().value, 3);
        assert_eq!(drops.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn assign_empty_source() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut a = Shared::new(Tracked::new(4, &drops));
        a.assign(&Shared::null());
        assert!(a.is_null());
        assert_eq!(drops.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn reset_and_take() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut a = Shared::new(Tracked::new(5, &drops));
        let mut b = a.clone();

        let moved = b.take();
        assert!(b.is_null());
        assert_eq!(moved.ref_count(), 2);

        a.reset();
        assert!(a.is_null());
        assert_eq!(moved.ref_count(), 1);
        assert_eq!(drops.load(Ordering::Relaxed), 0);

        drop(moved);
        assert_eq!(drops.load(Ordering::Relaxed), 1);

        // Resetting an empty handle does nothing.
        a.reset();
        assert_eq!(drops.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn get_mut_only_when_unique() {
        let mut a = Shared::new(10);
        *a.get_mut().unwrap() += 1;
        let b = a.clone();
        assert!(a.get_mut().is_none());
        drop(b);
        assert_eq!(a.get_mut().copied(), Some(11));
        assert!(Shared::<i32>::null().get_mut().is_none());
    }

    #[test]
    fn into_inner_last_owner() {
        let drops = Arc::new(AtomicUsize::new(0));
        let a = Shared::new(Tracked::new(6, &drops));
        let b = a.clone();

        assert!(a.into_inner().is_none());
        assert_eq!(b.ref_count(), 1);

        let payload = b.into_inner().unwrap();
        assert_eq!(payload.value, 6);
        assert_eq!(drops.load(Ordering::Relaxed), 0);
        drop(payload);
        assert_eq!(drops.load(Ordering::Relaxed), 1);

        assert!(Shared::<i32>::null().into_inner().is_none());
    }

    #[test]
    fn from_box_keeps_address() {
        let boxed = Box::new(String::from("boxed"));
        let addr = &*boxed as *const String;
        let h: Shared<String> = boxed.into();
        assert_eq!(h.as_ptr(), addr);
    }

    #[test]
    fn debug_format() {
        assert_eq!(format!("{:?}", Shared::new(9)), "Shared(9)");
        assert_eq!(format!("{:?}", Shared::<i32>::null()), "Shared(empty)");
    }

    #[test]
    fn zero_sized_payload() {
        let a = Shared::new(());
        let b = a.clone();
        assert_eq!(b.ref_count(), 2);
        assert!(b.get().is_some());
    }

    struct Bomb {
        armed: bool,
        drops: Arc<AtomicUsize>,
    }

    impl Bomb {
        fn new(armed: bool, drops: &Arc<AtomicUsize>) -> Self {
            Self {
                armed,
                drops: drops.clone(),
            }
        }
    }

    impl Drop for Bomb {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::Relaxed);
            if self.armed {
                panic!("payload destructor panicked");
            }
        }
    }

    #[test]
    fn panicking_payload_drop_leaves_handles_consistent() {
        use std::panic::{catch_unwind, AssertUnwindSafe};

        // assign
        let drops = Arc::new(AtomicUsize::new(0));
        let other_drops = Arc::new(AtomicUsize::new(0));
        let mut a = Shared::new(Bomb::new(true, &drops));
        let b = Shared::new(Bomb::new(false, &other_drops));
        assert!(catch_unwind(AssertUnwindSafe(|| a.assign(&b))).is_err());
        assert!(a.is_null());
        assert_eq!(b.ref_count(), 1);
        assert_eq!(drops.load(Ordering::Relaxed), 1);
        assert_eq!(other_drops.load(Ordering::Relaxed), 0);

        // The handle is still usable after the unwind.
        a.assign(&b);
        assert_eq!(b.ref_count(), 2);
        drop(a);
        drop(b);
        assert_eq!(other_drops.load(Ordering::Relaxed), 1);

        // reset
        let drops = Arc::new(AtomicUsize::new(0));
        let mut c = Shared::new(Bomb::new(true, &drops));
        assert!(catch_unwind(AssertUnwindSafe(|| c.reset())).is_err());
        assert!(c.is_null());
        assert_eq!(drops.load(Ordering::Relaxed), 1);

        // drop, only the last owner runs the destructor
        let drops = Arc::new(AtomicUsize::new(0));
        let d = Shared::new(Bomb::new(true, &drops));
        let e = d.clone();
        drop(d);
        assert_eq!(e.ref_count(), 1);
        assert_eq!(drops.load(Ordering::Relaxed), 0);
        assert!(catch_unwind(AssertUnwindSafe(move || drop(e))).is_err());
        assert_eq!(drops.load(Ordering::Relaxed), 1);
    }
}
