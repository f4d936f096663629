//! Process-wide Tokio runtime backing the blocking API.

use crate::error::{Result, TuyaError};
use std::future::Future;
use std::sync::OnceLock;
use tokio::runtime::{Builder, Handle, Runtime, RuntimeFlavor};

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// The shared multi-thread runtime, built on first use.
pub fn runtime() -> Result<&'static Runtime> {
    if let Some(rt) = RUNTIME.get() {
        return Ok(rt);
    }
    let rt = Builder::new_multi_thread()
        .enable_all()
        .thread_name("tuyalink-rt")
        .build()?;
    Ok(RUNTIME.get_or_init(|| rt))
}

/// Drive `fut` to completion on the shared runtime.
///
/// Inside a multi-thread runtime the caller's worker is handed off with
/// `block_in_place`; a current-thread runtime cannot be blocked and gets an error.
pub fn block_on<F: Future>(fut: F) -> Result<F::Output> {
    match Handle::try_current() {
        Ok(handle) => match handle.runtime_flavor() {
            RuntimeFlavor::MultiThread => {
                Ok(tokio::task::block_in_place(|| handle.block_on(fut)))
            }
            _ => Err(TuyaError::Runtime(
                "blocking call from inside a current-thread runtime".to_string(),
            )),
        },
        Err(_) => Ok(runtime()?.block_on(fut)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_on_shared_runtime() {
        let a = runtime().unwrap() as *const Runtime;
        let b = runtime().unwrap() as *const Runtime;
        assert_eq!(a, b);
        assert_eq!(block_on(async { 21 * 2 }).unwrap(), 42);
    }

    #[tokio::test]
    async fn test_block_on_in_current_thread_runtime_is_an_error() {
        let err = block_on(async { 1 }).unwrap_err();
        assert!(matches!(err, TuyaError::Runtime(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_block_on_in_multi_thread_runtime() {
        let value = block_on(async {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            7
        })
        .unwrap();
        assert_eq!(value, 7);
    }
}
