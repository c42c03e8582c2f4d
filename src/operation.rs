use std::{marker::PhantomData, sync::Arc, time::Duration};

use serde::de::DeserializeOwned;
use tokio::sync::oneshot;

use crate::{
    delegate::PendingTable,
    error::{Error, ErrorKind, Result},
    serializer,
};

/// Handle for one in-flight invoke.
///
/// There is no spontaneous timeout: an operation whose reply never arrives
/// stays pending until the process exits. [`wait_timeout`](Self::wait_timeout)
/// is the explicit extension point for callers that want a deadline.
pub struct InvokeOperation<T> {
    invoke_id: u32,
    method_id: u32,
    rx: oneshot::Receiver<Result<rmpv::Value>>,
    pending: Arc<PendingTable>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> InvokeOperation<T> {
    pub(crate) fn new(
        invoke_id: u32,
        method_id: u32,
        rx: oneshot::Receiver<Result<rmpv::Value>>,
        pending: Arc<PendingTable>,
    ) -> Self {
        Self {
            invoke_id,
            method_id,
            rx,
            pending,
            _marker: PhantomData,
        }
    }

    #[must_use]
    pub fn invoke_id(&self) -> u32 {
        self.invoke_id
    }

    #[must_use]
    pub fn method_id(&self) -> u32 {
        self.method_id
    }
}

impl<T: DeserializeOwned + Send + 'static> InvokeOperation<T> {
    /// Waits for the correlated reply and decodes the typed result.
    ///
    /// # Errors
    ///
    /// `InvokeFailed` when the callee reported failure or the correlation
    /// engine was torn down, `DeserializeFailed` when the reply value does
    /// not decode as `T`.
    pub async fn wait(self) -> Result<T> {
        let value = self
            .rx
            .await
            .map_err(|_| Error::new(ErrorKind::InvokeFailed, "correlation engine dropped".into()))??;
        serializer::from_value(value)
    }

    /// Waits with a deadline. On expiry the pending entry is removed, so a
    /// straggling reply for this invoke id is discarded instead of resolving
    /// a stranger.
    pub async fn wait_timeout(self, timeout: Duration) -> Result<T> {
        let invoke_id = self.invoke_id;
        let pending = self.pending.clone();
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(result) => result,
            Err(_) => {
                pending.abandon(invoke_id);
                Err(Error::kind(ErrorKind::Timeout))
            }
        }
    }

    /// Attaches a completion callback. May be attached before or after
    /// resolution; if the operation is already resolved it fires right away.
    pub fn on_complete<F>(self, callback: F)
    where
        F: FnOnce(Result<T>) + Send + 'static,
    {
        tokio::spawn(async move {
            callback(self.wait().await);
        });
    }
}

impl<T> std::fmt::Debug for InvokeOperation<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvokeOperation")
            .field("invoke_id", &self.invoke_id)
            .field("method_id", &self.method_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_then_attach() {
        let pending = Arc::new(PendingTable::default());
        let (invoke_id, rx) = pending.alloc(1);
        assert!(pending.resolve(invoke_id, Ok(rmpv::Value::from(99u32))));

        // already resolved: the callback fires immediately on attach
        let op: InvokeOperation<u32> = InvokeOperation::new(invoke_id, 1, rx, pending);
        let (tx, done) = oneshot::channel();
        op.on_complete(move |result| {
            let _ = tx.send(result.unwrap());
        });
        assert_eq!(done.await.unwrap(), 99);
    }

    #[tokio::test]
    async fn test_wait_timeout_abandons() {
        let pending = Arc::new(PendingTable::default());
        let (invoke_id, rx) = pending.alloc(1);
        let op: InvokeOperation<u32> = InvokeOperation::new(invoke_id, 1, rx, pending.clone());

        let err = op.wait_timeout(Duration::from_millis(10)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);

        // the entry is gone: a late reply is a no-op
        assert!(!pending.resolve(invoke_id, Ok(rmpv::Value::Nil)));
    }
}
