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

/// Runs blocking work off the async executor and awaits its result.
/// A panic inside `f` is resumed in the caller.
#[cfg(not(target_arch = "wasm32"))]
pub async fn handle<T, F>(f: F) -> T
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(output) => output,
        Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
        Err(err) => panic!("blocking task cancelled: {err}"),
    }
}

#[cfg(target_arch = "wasm32")]
pub async fn handle<T, F>(f: F) -> T
where
    F: FnOnce() -> T,
{
    f()
}
