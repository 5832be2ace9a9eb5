//! Signal proxy.
//!
//! The parent subscribes to every catchable signal except `SIGCHLD`,
//! `SIGURG`, and `SIGIO` and forwards them to the child leader, so the
//! launcher is transparent to job control and service managers. The child
//! runs the same proxy toward the target command.

use crate::quit;
use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::watch,
    task::JoinHandle,
};

/// The forwarded set. `SIGKILL`/`SIGSTOP` cannot be caught; `SIGCHLD` is
/// the parent's own wait machinery; `SIGURG` and `SIGIO` are runtime noise.
fn forwarded() -> Vec<(SignalKind, Signal)> {
    vec![
        (SignalKind::hangup(), Signal::SIGHUP),
        (SignalKind::interrupt(), Signal::SIGINT),
        (SignalKind::quit(), Signal::SIGQUIT),
        (SignalKind::terminate(), Signal::SIGTERM),
        (SignalKind::user_defined1(), Signal::SIGUSR1),
        (SignalKind::user_defined2(), Signal::SIGUSR2),
        (SignalKind::alarm(), Signal::SIGALRM),
        (SignalKind::pipe(), Signal::SIGPIPE),
        (SignalKind::window_change(), Signal::SIGWINCH),
        (SignalKind::from_raw(libc::SIGCONT), Signal::SIGCONT),
        (SignalKind::from_raw(libc::SIGTSTP), Signal::SIGTSTP),
        (SignalKind::from_raw(libc::SIGTTIN), Signal::SIGTTIN),
        (SignalKind::from_raw(libc::SIGTTOU), Signal::SIGTTOU),
    ]
}

/// Spawn one forwarding task per signal. The tasks end when `quit_rx` fires.
pub fn forward_signals(target: Pid, quit_rx: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
    let mut tasks = Vec::new();
    for (kind, sig) in forwarded() {
        let mut stream = match signal(kind) {
            Ok(stream) => stream,
            Err(err) => {
                log::debug!("cannot subscribe to {:?}: {}", sig, err);
                continue;
            }
        };
        let quit_rx = quit_rx.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = quit::fired(quit_rx.clone()) => break,
                    received = stream.recv() => {
                        if received.is_none() {
                            break;
                        }
                        log::debug!("forwarding {:?} to {}", sig, target);
                        if let Err(errno) = kill(target, sig) {
                            log::debug!("cannot forward {:?} to {}: {}", sig, target, errno);
                        }
                    }
                }
            }
        }));
    }
    tasks
}
