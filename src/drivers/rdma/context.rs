use sideway::ibverbs::device::{DeviceInfo, DeviceList};
use sideway::ibverbs::device_context::DeviceContext;
use sideway::ibverbs::memory_region::MemoryRegion;
use sideway::ibverbs::protection_domain::ProtectionDomain;
use sideway::ibverbs::AccessFlags;
use std::sync::Arc;
use tracing::debug;

use crate::error::{Error, Result};
use crate::hmem::{DeviceCaps, DomainContext, ProbeMr};

/// An opened verbs device with a protection domain, ready for memory-kind
/// probing.
pub struct RdmaContext {
    pub(crate) ctx: Arc<DeviceContext>,
    pub(crate) pd: Arc<ProtectionDomain>,
    device_count: usize,
    caps: DeviceCaps,
}

impl RdmaContext {
    /// Open `dev_name` and allocate a protection domain on it.
    ///
    /// `caps` come from the caller's device query; sizes there bound the
    /// thresholds computed for this domain.
    pub fn open(dev_name: &str, caps: DeviceCaps) -> Result<Arc<Self>> {
        let device_list = DeviceList::new().map_err(|e| Error::Device(e.to_string()))?;

        let device_count = device_list.iter().count();
        if device_count == 0 {
            return Err(Error::NoDevice);
        }

        let device = device_list
            .iter()
            .find(|d| d.name() == dev_name)
            .ok_or_else(|| Error::Device(format!("device {} not found", dev_name)))?;

        let ctx = device.open().map_err(|e| Error::Device(e.to_string()))?;

        let pd = ctx.alloc_pd().map_err(|e| Error::Device(e.to_string()))?;

        // device.open() and alloc_pd() already return Arc-wrapped types
        Ok(Arc::new(Self {
            ctx,
            pd,
            device_count,
            caps,
        }))
    }

    /// Open the first device on the system.
    pub fn open_first(caps: DeviceCaps) -> Result<Arc<Self>> {
        let device_list = DeviceList::new().map_err(|e| Error::Device(e.to_string()))?;
        let name = device_list
            .iter()
            .next()
            .map(|d| d.name())
            .ok_or(Error::NoDevice)?;
        Self::open(&name, caps)
    }

    pub fn device_context(&self) -> &Arc<DeviceContext> {
        &self.ctx
    }

    pub fn protection_domain(&self) -> &Arc<ProtectionDomain> {
        &self.pd
    }

    pub fn from_device_context(ctx: Arc<DeviceContext>, caps: DeviceCaps) -> Result<Arc<Self>> {
        let pd = ctx.alloc_pd().map_err(|e| Error::Device(e.to_string()))?;

        Ok(Arc::new(Self {
            ctx,
            pd,
            device_count: 1,
            caps,
        }))
    }
}

struct ProbeRegistration {
    _mr: Arc<MemoryRegion>,
}

impl ProbeMr for ProbeRegistration {
    fn deregister(self: Box<Self>) -> Result<()> {
        // ibv_dereg_mr runs on drop; sideway does not surface its errno
        Ok(())
    }
}

impl DomainContext for RdmaContext {
    fn device_count(&self) -> usize {
        self.device_count
    }

    fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    fn register_probe(
        &self,
        addr: usize,
        len: usize,
        remote_read: bool,
    ) -> Option<Box<dyn ProbeMr>> {
        let access = if remote_read {
            AccessFlags::LocalWrite | AccessFlags::RemoteRead
        } else {
            AccessFlags::LocalWrite
        };

        let mr: Arc<MemoryRegion> = unsafe { self.pd.reg_mr(addr, len, access) }
            .map_err(|e| {
                debug!("probe registration refused: {e}");
                e
            })
            .ok()?;

        Some(Box::new(ProbeRegistration { _mr: mr }))
    }
}
