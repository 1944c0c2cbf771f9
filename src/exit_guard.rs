//! A minimal scope guard; the resize lock must be released even if a visitor or deletion
//! callback panics while it is held.

/// [`ExitGuard`] captures a value and invokes the closure on it at the end of the scope.
pub(crate) struct ExitGuard<T, F: FnOnce(&mut T)> {
    captured: T,
    drop_callback: Option<F>,
}

impl<T, F: FnOnce(&mut T)> ExitGuard<T, F> {
    #[inline]
    pub(crate) fn new(captured: T, drop_callback: F) -> Self {
        Self {
            captured,
            drop_callback: Some(drop_callback),
        }
    }
}

impl<T, F: FnOnce(&mut T)> Drop for ExitGuard<T, F> {
    #[inline]
    fn drop(&mut self) {
        if let Some(callback) = self.drop_callback.take() {
            callback(&mut self.captured);
        }
    }
}
