use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{select, Receiver};
use nicwarp_core::{ErrorKind, Result};
use nicwarp_protocol::{RingEvent, RingKind};
use tracing::{debug, trace};

use crate::device::DeviceShared;

/// Drain loop of one hardware ring.
///
/// Woken by ring events or, failing those, by the watchdog interval. The RDMA
/// worker wakes sooner while resends are queued. Exits when the stop channel
/// disconnects.
struct Worker {
    kind: RingKind,
    shared: Arc<DeviceShared>,
    events: Receiver<RingEvent>,
    stop: Receiver<()>,
}

pub(crate) fn spawn(
    kind: RingKind,
    shared: Arc<DeviceShared>,
    events: Receiver<RingEvent>,
    stop: Receiver<()>,
) -> Result<JoinHandle<()>> {
    let name = match kind {
        RingKind::Raw => format!("nicwarp-raw-{}", shared.ctx.node_id),
        RingKind::Rdma => format!("nicwarp-rdma-{}", shared.ctx.node_id),
    };
    let worker = Worker { kind, shared, events, stop };
    thread::Builder::new()
        .name(name)
        .spawn(move || worker.run())
        .map_err(|err| ErrorKind::WorkerSpawn(err.to_string()))
}

impl Worker {
    fn run(self) {
        let node = self.shared.ctx.node_id;
        debug!("{:?} worker for node {} started", self.kind, node);

        loop {
            let interval = self.timeout();
            select! {
                recv(self.stop) -> _ => break,
                recv(self.events) -> event => match event {
                    Ok(event) => {
                        self.shared.ctx.stats.record_interrupt();
                        self.handle(event);
                    }
                    Err(_) => break,
                },
                default(interval) => {
                    self.shared.ctx.stats.record_watchdog_tick();
                    self.drain();
                    self.wake_senders();
                }
            }
        }
        debug!("{:?} worker for node {} stopped", self.kind, node);
    }

    fn timeout(&self) -> Duration {
        let watchdog = self.shared.config.watchdog_interval;
        match self.kind {
            RingKind::Rdma if self.shared.rdma.retries_pending() => {
                self.shared.config.rdma_retry_delay.max(Duration::from_millis(1)).min(watchdog)
            }
            _ => watchdog,
        }
    }

    fn handle(&self, event: RingEvent) {
        match event {
            RingEvent::RxReady(_) | RingEvent::SpaceAvailable(_) => {
                let handled = self.drain();
                trace!("{:?} worker handled {} frames after {:?}", self.kind, handled, event);
            }
            RingEvent::TxAvailable(_) => self.wake_senders(),
        }
    }

    fn drain(&self) -> usize {
        match self.kind {
            RingKind::Raw => self.shared.raw.drain(),
            RingKind::Rdma => {
                let handled = self.shared.long.drain();
                self.shared.rdma.resend_due();
                handled
            }
        }
    }

    fn wake_senders(&self) {
        match self.kind {
            RingKind::Raw => self.shared.raw.notify_tx_available(),
            RingKind::Rdma => {
                self.shared.rdma.resend_due();
                self.shared.rdma.notify_capacity();
                self.shared.long.notify_tx_available();
            }
        }
    }
}
