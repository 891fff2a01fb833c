pub mod auth;
pub mod capabilities;
pub mod capability;
pub mod configuration;
pub mod device;
pub mod dispatcher;
pub mod graph;
pub mod hardware;
pub mod identity;
pub mod jobs;
pub mod manager;
pub mod models;
pub mod modules;
pub mod mounts;
pub mod objects;
pub mod orchestrator;
pub mod platform;
pub mod registry;
pub mod unlock;

pub use auth::{Action, Authority, Caller, GroupPolicy};
pub use device::{DeviceDescriptor, HardwareEvent, Uevent, UeventAction};
pub use dispatcher::{Dispatcher, FollowUp};
pub use graph::ObjectGraph;
pub use hardware::HardwareMonitor;
pub use jobs::JobTracker;
pub use manager::ObjectManager;
pub use models::{Job, JobState, JobStatusEntry, JobWithHistory};
pub use objects::{BlockObject, DriveObject, ObjectPath};
pub use orchestrator::Orchestrator;
pub use platform::{LinuxPlatform, OpenMode, Platform};
