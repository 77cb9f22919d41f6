//! ONVIF action consumer.
//!
//! Serializes PTZ and preset commands to the camera one at a time. The
//! action channel is fan-in with no stop vocabulary; the worker exits when
//! the supervisor closes the channel at drain.

use std::sync::Arc;
use std::thread;

use crossbeam_channel::Receiver;
use tracing::{debug, warn};

use crate::hub::OnvifAction;
use crate::telemetry;

/// Camera control codec, implemented by the ONVIF collaborator.
pub trait CameraControl: Send + Sync {
    fn apply(&self, action: &OnvifAction) -> anyhow::Result<()>;
}

pub(crate) fn spawn_onvif(
    camera: Arc<dyn CameraControl>,
    actions: Receiver<OnvifAction>,
) -> thread::JoinHandle<()> {
    telemetry::spawn_thread("onvif", move || {
        while let Ok(action) = actions.recv() {
            debug!(action = %action.action, "applying onvif action");
            if let Err(err) = camera.apply(&action) {
                warn!(action = %action.action, error = %err, "onvif action failed");
            }
        }
        debug!("onvif handler finished");
    })
    .expect("failed to spawn onvif thread")
}
