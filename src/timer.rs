use crossbeam_channel::{bounded, Receiver, Sender};
use std::time::Duration;

// Fixed-interval timer used to pace the leader's heartbeat broadcasts. Each
// renew() schedules a single tick; the owning loop consumes the tick from
// the channel and renews. Dropping the guard cancels a pending tick, so a
// demoted leader leaves nothing behind.
pub struct Timer {
    timeout: Duration,
    timer: timer::Timer,
    guard: Option<timer::Guard>,
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl Timer {
    pub fn new(timeout: Duration) -> Timer {
        let (tx, rx) = bounded(1);
        Timer {
            timeout,
            timer: timer::Timer::new(),
            guard: None,
            tx,
            rx,
        }
    }

    pub fn renew(&mut self) {
        self.guard = None;
        let tx = self.tx.clone();
        self.guard = Some(self.timer.schedule_with_delay(
            time::Duration::from_std(self.timeout).expect("heartbeat interval out of range"),
            move || {
                let _ = tx.try_send(());
            },
        ));
    }

    pub fn get_rx(&self) -> Receiver<()> {
        self.rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_fires_after_renew() {
        let mut timer = Timer::new(Duration::from_millis(10));
        let rx = timer.get_rx();
        assert!(rx.try_recv().is_err());

        timer.renew();
        assert!(rx.recv_timeout(Duration::from_millis(500)).is_ok());
    }

    #[test]
    fn renew_replaces_pending_tick() {
        let mut timer = Timer::new(Duration::from_millis(50));
        let rx = timer.get_rx();
        timer.renew();
        timer.renew();
        // Only the second schedule survives; exactly one tick arrives.
        assert!(rx.recv_timeout(Duration::from_millis(500)).is_ok());
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }
}
