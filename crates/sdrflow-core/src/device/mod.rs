//! Device handle
//!
//! A [`Device`] wraps one backend instance, the registry of its open
//! streams and the core configuration streams are created with. Streams
//! keep only a weak reference back to the device, so a device must be
//! closed (or dropped) after its streams are destroyed.

mod args;
mod backend;
mod property;
pub mod sim;

pub use args::{discover, render_device_list, BackendKind, DeviceArgs, DeviceDescriptor};
pub use backend::{
    DeviceBackend, RecvInfo, StreamId, StreamOps, StreamRequest, StreamStats, SyncType,
};
pub use property::{DeviceParam, PropertyValue};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::CoreConfig;
use crate::error::{Error, Result};
use crate::lock;
use crate::stream::StreamHandle;
use crate::types::{ChannelMask, Direction, SampleFormat, StreamFlags};
use sim::{SimBackend, SimProbe};

/// State shared between a device and the streams it created
pub(crate) struct DeviceShared {
    backend: Mutex<Box<dyn DeviceBackend>>,
    registry: Mutex<BTreeMap<StreamId, Direction>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    name: String,
    native_format: SampleFormat,
    backend_channels: usize,
    pub(crate) config: CoreConfig,
}

impl DeviceShared {
    pub(crate) fn backend(&self) -> Result<MutexGuard<'_, Box<dyn DeviceBackend>>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::DeviceClosed);
        }
        Ok(lock(&self.backend))
    }

    /// Reserve an id for a new stream
    pub(crate) fn register(&self, direction: Direction) -> Result<StreamId> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::DeviceClosed);
        }
        let id = StreamId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.registry).insert(id, direction);
        Ok(id)
    }

    /// Forget a stream and let the backend release its endpoint
    pub(crate) fn unregister(&self, id: StreamId) {
        let removed = lock(&self.registry).remove(&id).is_some();
        if removed {
            lock(&self.backend).close_stream(id);
        }
    }

    pub(crate) fn native_format(&self) -> SampleFormat {
        self.native_format
    }

    /// Channel cap for a single stream
    pub(crate) fn max_channels(&self) -> usize {
        self.config.max_channels.min(self.backend_channels)
    }
}

/// Handle to an opened radio
pub struct Device {
    shared: Arc<DeviceShared>,
}

impl Device {
    /// Open a device by device string with the default core configuration
    pub fn open(spec: Option<&str>) -> Result<Self> {
        Self::open_with_config(spec, CoreConfig::default())
    }

    /// Open a device by device string
    pub fn open_with_config(spec: Option<&str>, config: CoreConfig) -> Result<Self> {
        let args = DeviceArgs::parse(spec)?;
        log::info!("Opening device '{}'", args);
        let backend = args.backend.open(&args, &config.sim)?;
        Ok(Self::with_backend(backend, config))
    }

    /// Open a simulated device from `config.sim`, keeping its probe
    pub fn open_sim(config: CoreConfig) -> Result<(Self, SimProbe)> {
        let mut sim = config.sim.clone();
        sim.apply_args(&DeviceArgs::parse(None)?)?;
        let (backend, probe) = SimBackend::new(sim);
        Ok((Self::with_backend(Box::new(backend), config), probe))
    }

    /// Wrap an already constructed backend
    pub fn with_backend(backend: Box<dyn DeviceBackend>, config: CoreConfig) -> Self {
        let descriptor = backend.describe();
        log::info!(
            "Device {} ready: {} channels, native format {}",
            descriptor.address,
            descriptor.channels,
            descriptor.native_format
        );
        Self {
            shared: Arc::new(DeviceShared {
                name: backend.name().to_string(),
                native_format: backend.native_format(),
                backend_channels: backend.max_channels(),
                backend: Mutex::new(backend),
                registry: Mutex::new(BTreeMap::new()),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                config,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn native_format(&self) -> SampleFormat {
        self.shared.native_format
    }

    /// Most channels a single stream may carry on this device
    pub fn max_channels(&self) -> usize {
        self.shared.max_channels()
    }

    pub fn config(&self) -> &CoreConfig {
        &self.shared.config
    }

    pub fn describe(&self) -> Result<DeviceDescriptor> {
        Ok(self.shared.backend()?.describe())
    }

    pub(crate) fn shared(&self) -> &Arc<DeviceShared> {
        &self.shared
    }

    // ------------------------------------------------------------------
    // Property tree
    // ------------------------------------------------------------------

    pub fn get(&self, path: &str) -> Result<PropertyValue> {
        self.shared.backend()?.get(path)
    }

    pub fn get_u64(&self, path: &str) -> Result<u64> {
        let value = self.get(path)?;
        value
            .as_u64()
            .ok_or_else(|| Error::InvalidArgument(format!("{} holds {} '{}', not an integer", path, value.kind(), value)))
    }

    pub fn get_f64(&self, path: &str) -> Result<f64> {
        let value = self.get(path)?;
        value
            .as_f64()
            .ok_or_else(|| Error::InvalidArgument(format!("{} holds {} '{}', not a number", path, value.kind(), value)))
    }

    pub fn get_str(&self, path: &str) -> Result<String> {
        match self.get(path)? {
            PropertyValue::Str(s) => Ok(s),
            other => Err(Error::InvalidArgument(format!(
                "{} holds {} '{}', not a string",
                path,
                other.kind(),
                other
            ))),
        }
    }

    pub fn set(&self, path: &str, value: impl Into<PropertyValue>) -> Result<()> {
        let value = value.into();
        log::debug!("set {} = {}", path, value);
        self.shared.backend()?.set(path, value)
    }

    pub fn set_u64(&self, path: &str, value: u64) -> Result<()> {
        self.set(path, value)
    }

    pub fn set_f64(&self, path: &str, value: f64) -> Result<()> {
        self.set(path, value)
    }

    pub fn set_str(&self, path: &str, value: &str) -> Result<()> {
        self.set(path, value)
    }

    /// Apply a batch of properties below `prefix`
    ///
    /// Ignored entries are skipped. A failing entry aborts the batch when it
    /// has `stop_on_fail`, otherwise it is logged and the batch continues.
    /// Returns the number of entries that were set.
    pub fn set_many(&self, prefix: &str, params: &[DeviceParam]) -> Result<usize> {
        let mut applied = 0;
        for param in params.iter().filter(|p| !p.ignore) {
            let path = join_path(prefix, &param.path);
            match self.set(&path, param.value.clone()) {
                Ok(()) => {
                    log::info!("  {} = {}", path, param.value);
                    applied += 1;
                }
                Err(e) if param.stop_on_fail => {
                    log::error!("Failed to set {} = {}: {}", path, param.value, e);
                    return Err(e);
                }
                Err(e) => log::warn!("Ignoring failure to set {} = {}: {}", path, param.value, e),
            }
        }
        Ok(applied)
    }

    // ------------------------------------------------------------------
    // Streams
    // ------------------------------------------------------------------

    /// Create a stream; see [`StreamHandle::create`]
    pub fn create_stream(
        &self,
        endpoint: &str,
        format: &str,
        channels: ChannelMask,
        packet_samples: usize,
        flags: StreamFlags,
    ) -> Result<StreamHandle> {
        StreamHandle::create(self, endpoint, format, channels, packet_samples, flags)
    }

    /// Number of registered streams
    pub fn open_streams(&self) -> usize {
        lock(&self.shared.registry).len()
    }

    /// Apply a synchronization policy to `streams`, or to every open stream
    /// when the slice is empty
    pub fn sync(&self, sync: SyncType, streams: &[&StreamHandle]) -> Result<()> {
        let targets: Vec<(StreamId, Direction)> = if streams.is_empty() {
            lock(&self.shared.registry)
                .iter()
                .map(|(id, dir)| (*id, *dir))
                .collect()
        } else {
            let mut targets = Vec::with_capacity(streams.len());
            for stream in streams {
                if !stream.belongs_to(&self.shared) {
                    return Err(Error::InvalidArgument(format!(
                        "stream {} was not created by this device",
                        stream.id()
                    )));
                }
                stream.ensure_alive("sync")?;
                targets.push((stream.id(), stream.direction()));
            }
            targets
        };

        log::info!("Sync '{}' on {} stream(s)", sync, targets.len());
        self.shared.backend()?.timer_op(&targets, sync)
    }

    /// [`Device::sync`] with a sync type name (`all`, `1pps`, `rx`, `tx`, `any`, `none`, `off`)
    pub fn sync_named(&self, sync: &str, streams: &[&StreamHandle]) -> Result<()> {
        self.sync(sync.parse()?, streams)
    }

    /// Close the device; fails while streams are still registered
    pub fn close(&self) -> Result<()> {
        let open = self.open_streams();
        if open > 0 {
            return Err(Error::StreamsOpen(open));
        }
        if !self.shared.closed.swap(true, Ordering::AcqRel) {
            log::info!("Device {} closed", self.shared.name);
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        let open = self.open_streams();
        if open > 0 {
            log::warn!("Device {} dropped with {} open stream(s)", self.shared.name, open);
        }
    }
}

fn join_path(prefix: &str, path: &str) -> String {
    match (prefix.trim_end_matches('/'), path.trim_start_matches('/')) {
        ("", rest) => format!("/{}", rest),
        (head, "") => head.to_string(),
        (head, rest) => format!("{}/{}", head, rest),
    }
}
