//! Process-wide slots shared by every request-handling thread.
//!
//! Both slots in this crate (the redaction fragments and the installed
//! reporter) are read on the panic path, where a poisoned lock cannot be
//! tolerated. `spin` locks never poison.

#[repr(transparent)]
pub(crate) struct GlobalLock<T: 'static + Send + Sync>(spin::RwLock<Option<T>>);

#[repr(transparent)]
pub(crate) struct GlobalLockReadGuard<'a, T: 'static + Send + Sync>(
    spin::RwLockReadGuard<'a, Option<T>>,
);

#[repr(transparent)]
pub(crate) struct GlobalLockWriteGuard<'a, T: 'static + Send + Sync>(
    spin::RwLockWriteGuard<'a, Option<T>>,
);

impl<T: 'static + Send + Sync> GlobalLock<T> {
    #[must_use]
    pub(crate) const fn new() -> Self {
        Self(spin::RwLock::new(None))
    }

    #[inline]
    pub(crate) fn read(&self) -> GlobalLockReadGuard<'_, T> {
        GlobalLockReadGuard(self.0.read())
    }

    #[inline]
    pub(crate) fn write(&self) -> GlobalLockWriteGuard<'_, T> {
        GlobalLockWriteGuard(self.0.write())
    }
}

impl<T: 'static + Send + Sync> GlobalLockReadGuard<'_, T> {
    #[inline]
    pub(crate) fn get(&self) -> Option<&T> {
        self.0.as_ref()
    }
}

impl<T: 'static + Send + Sync> GlobalLockWriteGuard<'_, T> {
    #[inline]
    pub(crate) fn get(&mut self) -> &mut Option<T> {
        &mut self.0
    }
}
