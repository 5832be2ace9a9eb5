//! The quit latch shared by every long-running loop.
//!
//! One `watch` channel per driver: the owner flips it to `true` (or drops
//! the sender) and every loop holding a receiver unwinds within one cycle.

use tokio::sync::watch;

pub fn channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Resolves once the latch fires. A dropped sender counts as fired, so a
/// panicking owner still releases its loops.
pub async fn fired(mut quit: watch::Receiver<bool>) {
    if *quit.borrow() {
        return;
    }
    while quit.changed().await.is_ok() {
        if *quit.borrow() {
            return;
        }
    }
}

/// Non-blocking probe of the latch.
pub fn is_fired(quit: &watch::Receiver<bool>) -> bool {
    *quit.borrow()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_on_send() {
        tokio::runtime::Runtime::new().unwrap().block_on(async {
            let (tx, rx) = channel();
            let waiter = tokio::spawn(fired(rx));
            tx.send(true).unwrap();
            waiter.await.unwrap();
        });
    }

    #[test]
    fn fires_on_drop() {
        tokio::runtime::Runtime::new().unwrap().block_on(async {
            let (tx, rx) = channel();
            drop(tx);
            fired(rx).await;
        });
    }
}
