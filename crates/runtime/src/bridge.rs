//! Running remote calls from synchronous planning hooks.
//!
//! Table functions must report their schema from a sync `call`, which can be
//! reached from inside a Tokio worker where `block_on` would panic. The call
//! runs to completion on a scoped thread with its own current-thread runtime
//! while the caller waits.

use cirrus_error::{CirrusError, ErrorCode, Result};
use std::future::Future;

pub fn block_on_remote<F, T>(future: F) -> Result<T>
where
    F: Future<Output = Result<T>> + Send,
    T: Send,
{
    std::thread::scope(|scope| {
        let worker = scope.spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| {
                    CirrusError::new(
                        ErrorCode::Internal,
                        format!("Failed to build runtime for remote call: {}", e),
                    )
                })?;
            runtime.block_on(future)
        });
        worker.join().unwrap_or_else(|_| {
            Err(CirrusError::new(
                ErrorCode::Internal,
                "Remote call worker panicked",
            ))
        })
    })
}
