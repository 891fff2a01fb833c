use tokio::sync::mpsc;

use super::device::{DeviceDescriptor, HardwareEvent};

pub trait HardwareMonitor: Send + Sync {
    /// Start listening for hardware events.
    /// Spawns internal tasks that send events to the provided channel.
    fn start(&self, event_sender: mpsc::Sender<HardwareEvent>);

    /// Stop the hardware monitor gracefully.
    fn stop(&self);

    /// Every block device present right now, parents before children.
    /// Replayed as `add` events at startup.
    fn coldplug(&self) -> anyhow::Result<Vec<DeviceDescriptor>>;
}
