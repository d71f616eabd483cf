//! Process-wide debug message hook.
//!
//! Drivers report internal diagnostics through [`emit`]. Each message goes to
//! `tracing` at debug level and, if one is installed, to the registered
//! handler. Installing, replacing and clearing the handler may happen from any
//! thread at any time; the last write wins, and a message being emitted
//! concurrently may reach either the old or the new handler.
//!
//! While a driver holds one of its locks on the current thread, messages are
//! queued and delivered once the last such lock is released, so a handler may
//! call back into the driver.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::Arc;

/// Callback receiving one-line driver diagnostics.
pub type DebugHandler = Arc<dyn Fn(&str) + Send + Sync>;

static HANDLER: Lazy<RwLock<Option<DebugHandler>>> = Lazy::new(|| RwLock::new(None));

#[derive(Default)]
struct Held {
    depth: usize,
    queue: Vec<String>,
}

thread_local! {
    static HELD: RefCell<Held> = RefCell::new(Held::default());
}

/// Keeps handler delivery on this thread postponed while alive.
pub(crate) struct Hold {
    _thread_bound: PhantomData<*const ()>,
}

pub(crate) fn hold() -> Hold {
    HELD.with(|held| held.borrow_mut().depth += 1);
    Hold {
        _thread_bound: PhantomData,
    }
}

impl Drop for Hold {
    fn drop(&mut self) {
        let released = HELD.with(|held| {
            let mut held = held.borrow_mut();
            held.depth -= 1;
            if held.depth == 0 {
                std::mem::take(&mut held.queue)
            } else {
                Vec::new()
            }
        });
        for message in released {
            deliver(&message);
        }
    }
}

/// Install `handler`, replacing any previous one.
pub fn set_debug_handler<F>(handler: F)
where
    F: Fn(&str) + Send + Sync + 'static,
{
    *HANDLER.write() = Some(Arc::new(handler));
}

/// Remove the installed handler, if any.
pub fn clear_debug_handler() {
    *HANDLER.write() = None;
}

pub fn has_debug_handler() -> bool {
    HANDLER.read().is_some()
}

/// Report a driver diagnostic.
pub fn emit(message: &str) {
    tracing::debug!(target: "spwrap::driver", "{}", message);

    let queued = HELD.with(|held| {
        let mut held = held.borrow_mut();
        if held.depth > 0 {
            held.queue.push(message.to_string());
        }
        held.depth > 0
    });
    if !queued {
        deliver(message);
    }
}

fn deliver(message: &str) {
    // The handler runs outside the lock so it may itself replace the handler.
    let handler = HANDLER.read().clone();
    if let Some(handler) = handler {
        handler(message);
    }
}
