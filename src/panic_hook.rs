//! Stack capture at the panic site.
//!
//! By the time `catch_unwind` returns, the frames between the panic and the
//! interceptor are gone. This hook records the stack and panic location while
//! they still exist and leaves them in a thread-local slot for the
//! interceptor to pick up.
//!
//! The hook only does work on threads where an interceptor is currently
//! running a handler, and always defers to the previously installed hook
//! afterwards, so the default "thread panicked at" output is kept.

use std::{
    cell::{Cell, RefCell},
    panic::{self, PanicHookInfo},
    sync::Once,
};

use crate::stacktrace::{StackPolicy, Stacktrace};

/// What the hook recorded about a panic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PanicSite {
    /// Stack at the panic, shaped by the policy of the active interceptor.
    pub stacktrace: Option<Stacktrace>,
    /// `file:line:column` of the panic.
    pub location: Option<String>,
}

thread_local! {
    static ARMED: Cell<Option<StackPolicy>> = const { Cell::new(None) };
    static SITE: RefCell<Option<PanicSite>> = const { RefCell::new(None) };
}

static INSTALL: Once = Once::new();

/// Installs the panic-site hook on top of the current panic hook.
///
/// Only the first call has an effect. Hooks set with [`panic::set_hook`]
/// afterwards replace this one.
pub fn install() {
    INSTALL.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            record(info);
            previous(info);
        }));
    });
}

fn record(info: &PanicHookInfo<'_>) {
    let Some(policy) = ARMED.with(Cell::get) else {
        return;
    };
    let site = PanicSite {
        stacktrace: Stacktrace::capture(&policy),
        location: info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column())),
    };
    SITE.with(|slot| {
        if let Ok(mut slot) = slot.try_borrow_mut() {
            *slot = Some(site);
        }
    });
}

/// Enables recording on this thread until the guard is dropped.
pub(crate) fn arm(policy: StackPolicy) -> ArmGuard {
    let previous = ARMED.with(|armed| armed.replace(Some(policy)));
    clear();
    ArmGuard { previous }
}

pub(crate) struct ArmGuard {
    previous: Option<StackPolicy>,
}

impl Drop for ArmGuard {
    fn drop(&mut self) {
        ARMED.with(|armed| armed.set(self.previous));
    }
}

/// Takes the site recorded for the last panic on this thread.
pub(crate) fn take() -> Option<PanicSite> {
    SITE.with(|slot| slot.try_borrow_mut().ok()?.take())
}

/// Puts a site back for an enclosing interceptor. Used before re-raising,
/// since `resume_unwind` does not run the hook again.
pub(crate) fn restore(site: PanicSite) {
    SITE.with(|slot| {
        if let Ok(mut slot) = slot.try_borrow_mut() {
            *slot = Some(site);
        }
    });
}

fn clear() {
    drop(take());
}
