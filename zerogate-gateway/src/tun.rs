use std::sync::Arc;

use tun_rs::{AsyncDevice, DeviceBuilder};

use crate::{GatewayError, Result};

/// Tunnel-side MTU: 1500 minus the QUIC + datagram envelope overhead.
pub const TUN_MTU: u16 = 1420;

/// A multiqueue TUN device: one queue handle per reader task, all
/// presenting the same interface to the kernel.
pub struct TunQueues {
    name: String,
    queues: Vec<Arc<AsyncDevice>>,
}

impl TunQueues {
    /// Opens `count` queue handles. Addressing and link state are left
    /// to [`crate::netsetup`] once the client CIDR is known.
    pub fn open(name: &str, count: usize) -> Result<Self> {
        let count = count.max(1);
        let mut queues = Vec::with_capacity(count);
        for i in 0..count {
            let builder = DeviceBuilder::new().name(name).mtu(TUN_MTU);
            #[cfg(target_os = "linux")]
            let builder = builder.multi_queue(count > 1);
            let device = builder
                .build_async()
                .map_err(|e| GatewayError::Tun(format!("queue {i} of {name}: {e}")))?;
            queues.push(Arc::new(device));
        }
        Ok(Self {
            name: name.to_string(),
            queues,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue(&self, idx: usize) -> Arc<AsyncDevice> {
        self.queues[idx % self.queues.len()].clone()
    }

    pub fn queues(&self) -> &[Arc<AsyncDevice>] {
        &self.queues
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }
}
