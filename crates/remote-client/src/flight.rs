//! Share one in-flight attempt between concurrent callers.

use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt, Shared};

use crate::error::{RemoteError, Result};

type Flight<T> = Shared<BoxFuture<'static, std::result::Result<T, Arc<RemoteError>>>>;

pub(crate) struct SingleFlight<T: Clone> {
    inflight: Mutex<Option<Flight<T>>>,
}

impl<T: Clone + Send + Sync + 'static> SingleFlight<T> {
    pub(crate) fn new() -> Self {
        Self {
            inflight: Mutex::new(None),
        }
    }

    /// Join the current attempt, or start one with `make`. Every caller
    /// sees the same outcome. The slot is cleared once the attempt ends,
    /// so a later call starts fresh.
    pub(crate) async fn run<F, Fut>(&self, make: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let flight = {
            let mut slot = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            match slot.as_ref() {
                Some(flight) => flight.clone(),
                None => {
                    let flight = make().map(|r| r.map_err(Arc::new)).boxed().shared();
                    *slot = Some(flight.clone());
                    flight
                }
            }
        };

        let result = flight.clone().await;
        {
            let mut slot = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            if slot.as_ref().is_some_and(|f| f.ptr_eq(&flight)) {
                *slot = None;
            }
        }
        drop(flight);
        result.map_err(|e| Arc::try_unwrap(e).unwrap_or_else(|e| e.duplicate()))
    }
}
