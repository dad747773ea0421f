use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, select, tick, Sender};
use tracing::{debug, warn};

use super::Controller;

/// Background thread driving [`Controller::tick`] at a fixed cadence.
///
/// Holds only a weak reference so a dropped controller ends the loop.
pub(crate) struct Updater {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Updater {
    pub(crate) fn spawn(controller: Weak<Controller>, cooldown: Duration) -> std::io::Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = thread::Builder::new().name("binsync-updater".to_string()).spawn(move || {
            let ticker = tick(cooldown);
            loop {
                select! {
                    recv(stop_rx) -> _ => break,
                    recv(ticker) -> _ => {
                        let Some(controller) = controller.upgrade() else {
                            break;
                        };
                        controller.tick();
                    }
                }
            }
            debug!("updater stopped");
        })?;
        Ok(Self { stop: Some(stop_tx), handle: Some(handle) })
    }

    pub(crate) fn stop(&mut self) {
        // Dropping the sender wakes the loop.
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("updater thread panicked");
            }
        }
    }
}

impl Drop for Updater {
    fn drop(&mut self) {
        self.stop();
    }
}
