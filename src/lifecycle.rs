//! Flush timer and process shutdown hooks owned by a
//! [`BatchedSink`](crate::batcher::BatchedSink).
//!
//! A [`Lifecycle`] is started once when the sink is built and stopped once
//! by the sink's close path. It runs two tasks:
//!
//! - the flush timer, which hands the pending buffer to a delivery task on
//!   every tick where the buffer is non-empty;
//! - the hook listener, which waits for SIGINT, SIGTERM or a process panic.
//!   A signal runs the sink's drain-and-close. A panic only drains: tokio
//!   recovers panics in spawned tasks, so the process and the pool it shares
//!   with the sink may well outlive it.
//!
//! Both tasks hold only a weak reference to the sink, so a dropped sink
//! lets them wind down. A tokio task never keeps a runtime alive, so the
//! timer does not hold up process exit either.

use crate::batcher::Inner;
use std::fmt;
use std::sync::{Mutex, Once, OnceLock, PoisonError, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// What started a sink's drain-and-close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownTrigger {
    /// `close()` called by the host.
    Explicit,
    /// The [`SinkGuard`](crate::init::SinkGuard) was dropped at normal exit.
    Exit,
    /// SIGINT / Ctrl-C.
    Interrupt,
    /// SIGTERM.
    Terminate,
    /// A panic anywhere in the process, including inside spawned tasks.
    Panic,
    /// The execution environment is about to freeze the process.
    Suspend,
}

impl ShutdownTrigger {
    /// Conventional `128 + signo` exit status for signal triggers.
    pub fn exit_code(self) -> Option<i32> {
        match self {
            ShutdownTrigger::Interrupt => Some(130),
            ShutdownTrigger::Terminate => Some(143),
            _ => None,
        }
    }

    /// Whether the trigger ends the sink for good and releases the backend.
    ///
    /// A panic is not terminal: the sink drains and stops accepting records,
    /// but the backend (and a pool shared with the host) stays open until an
    /// explicit close.
    pub fn releases_backend(self) -> bool {
        !matches!(self, ShutdownTrigger::Panic)
    }
}

impl fmt::Display for ShutdownTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShutdownTrigger::Explicit => "explicit",
            ShutdownTrigger::Exit => "exit",
            ShutdownTrigger::Interrupt => "interrupt",
            ShutdownTrigger::Terminate => "terminate",
            ShutdownTrigger::Panic => "panic",
            ShutdownTrigger::Suspend => "suspend",
        };
        f.write_str(name)
    }
}

pub(crate) struct Lifecycle {
    timer: JoinHandle<()>,
    hooks: Option<JoinHandle<()>>,
    registration: Option<HookRegistration>,
}

impl Lifecycle {
    pub(crate) fn start(
        runtime: &Handle,
        inner: Weak<Inner>,
        flush_interval: Duration,
        install_hooks: bool,
        exit_on_signal: bool,
    ) -> Self {
        let timer = runtime.spawn(run_flush_timer(inner.clone(), flush_interval));

        let (hooks, registration) = if install_hooks {
            let (tx, rx) = mpsc::unbounded_channel();
            register_panic_listener(tx);
            let registration = HookRegistration::new();
            let hooks = runtime.spawn(listen_for_shutdown(inner, rx, exit_on_signal));
            (Some(hooks), Some(registration))
        } else {
            (None, None)
        };

        Lifecycle {
            timer,
            hooks,
            registration,
        }
    }

    /// Abort both tasks. The returned registration keeps a pending
    /// signal-triggered exit waiting until the caller drops it.
    pub(crate) fn stop(mut self) -> Option<HookRegistration> {
        self.registration.take()
    }
}

impl Drop for Lifecycle {
    fn drop(&mut self) {
        self.timer.abort();
        if let Some(hooks) = &self.hooks {
            hooks.abort();
        }
    }
}

async fn run_flush_timer(inner: Weak<Inner>, every: Duration) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(sink) = inner.upgrade() else {
            break;
        };
        sink.flush_pending_in_background();
    }
}

async fn listen_for_shutdown(
    inner: Weak<Inner>,
    mut panics: mpsc::UnboundedReceiver<ShutdownTrigger>,
    exit_on_signal: bool,
) {
    loop {
        let trigger = tokio::select! {
            Some(trigger) = panics.recv() => trigger,
            _ = interrupt() => ShutdownTrigger::Interrupt,
            _ = terminate() => ShutdownTrigger::Terminate,
        };

        let Some(sink) = inner.upgrade() else {
            return;
        };
        tracing::debug!(%trigger, "shutdown hook fired");

        // A terminal close stops this lifecycle, which aborts the current
        // task, so the drain runs in a task of its own.
        let closer = sink.spawn_close(trigger);
        if !trigger.releases_backend() {
            // Keep listening: a later signal still has to close and exit.
            continue;
        }

        if exit_on_signal {
            if let Some(code) = trigger.exit_code() {
                sink.runtime().spawn(async move {
                    let _ = closer.await;
                    all_hooked_sinks_closed().await;
                    std::process::exit(code);
                });
            }
        }
        return;
    }
}

async fn interrupt() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to register ctrl-c handler");
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sig) => {
            sig.recv().await;
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to register SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}

static PANIC_LISTENERS: Mutex<Vec<mpsc::UnboundedSender<ShutdownTrigger>>> =
    Mutex::new(Vec::new());
static PANIC_HOOK: Once = Once::new();

/// Chain a panic hook (once per process) that notifies every live sink.
fn register_panic_listener(tx: mpsc::UnboundedSender<ShutdownTrigger>) {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            notify_panic_listeners();
            previous(info);
        }));
    });

    let mut listeners = PANIC_LISTENERS
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    listeners.retain(|tx| !tx.is_closed());
    listeners.push(tx);
}

fn notify_panic_listeners() {
    let mut listeners = PANIC_LISTENERS
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    listeners.retain(|tx| tx.send(ShutdownTrigger::Panic).is_ok());
}

/// Number of sinks with hooks installed that have not finished closing.
///
/// Every hooked sink sees a signal, so the exit after a signal-triggered
/// drain waits for all of them rather than the first one to finish.
fn hooked_sinks() -> &'static watch::Sender<usize> {
    static HOOKED_SINKS: OnceLock<watch::Sender<usize>> = OnceLock::new();
    HOOKED_SINKS.get_or_init(|| watch::channel(0).0)
}

pub(crate) struct HookRegistration(());

impl HookRegistration {
    fn new() -> Self {
        hooked_sinks().send_modify(|count| *count += 1);
        HookRegistration(())
    }
}

impl Drop for HookRegistration {
    fn drop(&mut self) {
        hooked_sinks().send_modify(|count| *count = count.saturating_sub(1));
    }
}

async fn all_hooked_sinks_closed() {
    let mut hooked = hooked_sinks().subscribe();
    let _ = hooked.wait_for(|count| *count == 0).await;
}
