//! Pattern-matched subscription registry.
//!
//! Dispatch takes a snapshot of the matching subscriptions before
//! invoking any callback, then releases the registry lock. A callback
//! is therefore free to `subscribe`/`unsubscribe` on the same
//! dispatcher — including unsubscribing itself — without deadlocking
//! or corrupting the in-flight pass. New subscriptions never appear in
//! the snapshot already being walked; removed ones are simply skipped
//! if dispatch reaches them after the removal.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::message::IncomingMessage;
use crate::topic::topic_match;
use crate::{Error, Result};

pub type Cookie = u64;

type Callback = dyn Fn(&IncomingMessage, &mut (dyn Any + Send)) + Send + Sync;

struct Subscription {
    pattern: String,
    callback: Arc<Callback>,
    /// Taken out for the duration of the callback invocation so a
    /// reentrant unsubscribe of this same cookie can't deadlock on it.
    user_data: Mutex<Option<Box<dyn Any + Send>>>,
}

#[derive(Default)]
pub(crate) struct Dispatcher {
    subs: Mutex<HashMap<Cookie, Arc<Subscription>>>,
    next: AtomicU64,
}

impl Dispatcher {
    pub(crate) fn subscribe<F, D>(&self, pattern: &str, user_data: D, callback: F) -> Cookie
    where
        F: Fn(&IncomingMessage, &mut D) + Send + Sync + 'static,
        D: Send + 'static,
    {
        let cookie = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        let callback: Arc<Callback> = Arc::new(move |msg, data| {
            let data = data
                .downcast_mut::<D>()
                .expect("fleetmq-mqtt: user_data type mismatch in dispatch");
            callback(msg, data);
        });
        let sub = Arc::new(Subscription {
            pattern: pattern.to_owned(),
            callback,
            user_data: Mutex::new(Some(Box::new(user_data))),
        });
        self.subs.lock().insert(cookie, sub);
        cookie
    }

    /// Removes the registration and returns its pattern (so the caller
    /// can drop the broker-level subscription once the last local
    /// registration for it is gone) and its user data.
    ///
    /// Returns `NoData` both for an unknown cookie and for a cookie
    /// unsubscribing itself from inside its own callback — in the
    /// latter case the data is already in the callback's hands via its
    /// `&mut D` parameter, so nothing is lost.
    pub(crate) fn unsubscribe(&self, cookie: Cookie) -> Result<(String, Box<dyn Any + Send>)> {
        let sub = self.subs.lock().remove(&cookie).ok_or(Error::NoData)?;
        let data = sub.user_data.lock().take().ok_or(Error::NoData)?;
        Ok((sub.pattern.clone(), data))
    }

    pub(crate) fn dispatch(&self, msg: &IncomingMessage) {
        let snapshot: Vec<Arc<Subscription>> = self
            .subs
            .lock()
            .values()
            .filter(|sub| topic_match(&sub.pattern, &msg.topic))
            .cloned()
            .collect();

        for sub in snapshot {
            let Some(mut data) = sub.user_data.lock().take() else {
                // Unsubscribed (or already mid-dispatch) since the snapshot was taken.
                continue;
            };

            let callback = &sub.callback;
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback(msg, &mut *data);
            }));
            if let Err(panic) = result {
                let detail = panic
                    .downcast_ref::<&str>()
                    .copied()
                    .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
                    .unwrap_or("<non-string panic payload>");
                tracing::error!(pattern = %sub.pattern, %detail, "mqtt subscription callback panicked");
            }

            *sub.user_data.lock() = Some(data);
        }
    }

    #[cfg(test)]
    pub(crate) fn registered_count(&self) -> usize {
        self.subs.lock().len()
    }
}
