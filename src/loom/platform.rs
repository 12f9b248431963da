#[cfg(not(target_arch = "wasm32"))]
#[inline]
pub fn spawn<O, F>(future: F) -> tokio::task::JoinHandle<O>
where
    O: Send + 'static,
    F: std::future::Future<Output = O> + Send + 'static,
{
    tokio::spawn(future)
}

#[cfg(target_arch = "wasm32")]
#[inline]
pub fn spawn<F>(future: F)
where
    F: std::future::Future<Output = ()> + 'static,
{
    wasm_bindgen_futures::spawn_local(future);
}

/// Runs a blocking closure off the async threads and awaits its result.
/// Returns `None` if the closure panicked.
#[cfg(not(target_arch = "wasm32"))]
#[inline]
pub async fn handle<O, F>(f: F) -> Option<O>
where
    O: Send + 'static,
    F: FnOnce() -> O + Send + 'static,
{
    tokio::task::spawn_blocking(f).await.ok()
}

/// Runs a blocking closure in place; there are no blocking threads on this platform.
#[cfg(target_arch = "wasm32")]
#[inline]
pub async fn handle<O, F>(f: F) -> Option<O>
where
    F: FnOnce() -> O,
{
    Some(f())
}

#[cfg(not(target_arch = "wasm32"))]
pub type BoxFuture<'a, T> = futures::future::BoxFuture<'a, T>;
#[cfg(target_arch = "wasm32")]
pub type BoxFuture<'a, T> = futures::future::LocalBoxFuture<'a, T>;
