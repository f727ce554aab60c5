//! Fan-in of several send completions into one outcome

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Completion callback for a send: `true` if the transport reported success
pub type SentCallback = Box<dyn FnOnce(bool) + Send + 'static>;

struct FanIn {
    remaining: AtomicUsize,
    all_ok: AtomicBool,
    callback: Mutex<Option<SentCallback>>,
}

impl FanIn {
    fn complete(&self, ok: bool) {
        if !ok {
            self.all_ok.store(false, Ordering::SeqCst);
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            let callback = self.callback.lock().take();
            if let Some(callback) = callback {
                callback(self.all_ok.load(Ordering::SeqCst));
            }
        }
    }
}

/// Split `callback` into `expected` per-send callbacks.
///
/// `callback` fires once, after the last of them, with the AND of their
/// results. With `expected == 0` it fires right here with `true` and the
/// returned list is empty.
pub fn join(expected: usize, callback: SentCallback) -> Vec<SentCallback> {
    if expected == 0 {
        callback(true);
        return Vec::new();
    }

    let fan_in = Arc::new(FanIn {
        remaining: AtomicUsize::new(expected),
        all_ok: AtomicBool::new(true),
        callback: Mutex::new(Some(callback)),
    });

    (0..expected)
        .map(|_| {
            let fan_in = Arc::clone(&fan_in);
            Box::new(move |ok: bool| fan_in.complete(ok)) as SentCallback
        })
        .collect()
}
