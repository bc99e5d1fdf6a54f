// src/lib.rs

pub mod command; // Transfer request -> Command
pub mod config;
pub mod constants;
pub mod controller; // Idle/Running/Stopped state machine
pub mod engine; // etcd / zetcd / cetcd / ZooKeeper / Consul launch plans
pub mod error;
pub mod monitor;
pub mod proc_monitor; // /proc sampling
pub mod process;
pub mod server;
pub mod upload; // artifact upload pipeline with retry
pub mod uploader;

pub mod pb {
    pub mod dbagent {
        include!("pb/dbagent.rs");
    }
}

pub use controller::{Controller, Outcome, State};
pub use error::ControllerError;
