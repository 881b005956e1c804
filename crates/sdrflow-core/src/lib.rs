//! sdrflow core - streaming data plane for software-defined radios
//!
//! Moves blocks of complex samples between radio backends and application
//! threads: per-channel slot ring buffers, runtime-dispatched format
//! conversion between the device wire format and host formats, and RX/TX
//! stream handles with timestamped synchronization.

pub mod caps;
pub mod config;
pub mod convert;
pub mod device;
pub mod error;
pub mod ring;
pub mod signal;
pub mod stream;
pub mod types;

pub use device::{Device, DeviceParam, PropertyValue, RecvInfo, SyncType};
pub use error::{Error, Result};
pub use stream::{StreamCommand, StreamHandle, StreamInfo, StreamState, RX_ENDPOINT, TX_ENDPOINT};
pub use types::*;

use std::sync::{Mutex, MutexGuard};

/// Lock a mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
