use std::future::Future;
use std::sync::Arc;

use tokio::runtime::Runtime;
use tokio::sync::watch;

/// Runtime plus shutdown flag shared by the HTTP server, the blocking
/// engine calls, and the reaper threads.
///
/// The runtime is owned here rather than via `#[tokio::main]` because the
/// engine blocks on condvars from handler tasks and the reapers run as
/// plain threads; all of them need one handle to the same runtime. The
/// shutdown flag is a watch channel: the signal handler flips it once,
/// async consumers await the flip, reaper threads poll it between sleeps.
#[derive(Clone)]
pub struct AppContext {
    pub rt: Arc<Runtime>,
    shutdown: watch::Sender<bool>,
}

impl AppContext {
    pub fn new() -> Self {
        let rt = Arc::new(
            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .unwrap(),
        );
        let (shutdown, _) = watch::channel(false);

        Self { rt, shutdown }
    }

    /// Flip the shutdown flag. Called from the signal handler in main and
    /// from tests tearing an app down; idempotent.
    pub fn kill(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn killed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves once [`Self::kill`] has been called. This is the graceful-
    /// shutdown hook handed to the HTTP server.
    pub fn wait_kill(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut shutdown = self.shutdown.subscribe();
        async move {
            let _ = shutdown.wait_for(|killed| *killed).await;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn kill_flag_observed() {
        let ctx = AppContext::new();
        assert!(!ctx.killed());
        ctx.kill();
        ctx.kill();
        assert!(ctx.killed());
    }

    #[test]
    fn wait_kill_resolves_after_kill() {
        let ctx = AppContext::new();
        let wait = ctx.wait_kill();
        ctx.kill();
        ctx.rt.block_on(wait);
    }

    #[test]
    fn late_subscriber_still_sees_kill() {
        let ctx = AppContext::new();
        ctx.kill();
        // subscribing after the flip must not hang
        ctx.rt.block_on(ctx.wait_kill());
    }
}
