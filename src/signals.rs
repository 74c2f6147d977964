//! Purpose: Turn SIGINT/SIGTERM into a pipeline abort.
//! Exports: `forward_to`, `SignalGuard`.
//! Role: The CLI arms a guard around `run`; dropping it stops listening.
//! Invariants: At most one abort is issued per guard.

use redump::api::{AbortHandle, Error};

#[cfg(unix)]
pub(crate) struct SignalGuard {
    handle: signal_hook::iterator::Handle,
    listener: Option<std::thread::JoinHandle<()>>,
}

#[cfg(unix)]
pub(crate) fn forward_to(abort: AbortHandle) -> Result<SignalGuard, Error> {
    use redump::api::ErrorKind;
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM]).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to install signal handlers")
            .with_source(err)
    })?;
    let handle = signals.handle();
    let listener = std::thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            tracing::warn!(signal, "received signal; aborting run");
            abort.abort();
        }
    });
    Ok(SignalGuard {
        handle,
        listener: Some(listener),
    })
}

#[cfg(unix)]
impl Drop for SignalGuard {
    fn drop(&mut self) {
        self.handle.close();
        if let Some(listener) = self.listener.take() {
            let _ = listener.join();
        }
    }
}

#[cfg(not(unix))]
pub(crate) struct SignalGuard;

#[cfg(not(unix))]
pub(crate) fn forward_to(_abort: AbortHandle) -> Result<SignalGuard, Error> {
    Ok(SignalGuard)
}
