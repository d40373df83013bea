use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use tracing::warn;

use crate::error::{ProvisionError, Result};

/// Static address plan for a fleet
///
/// Every member gets the start address with its last octet advanced by the
/// member's index. The plan is validated once, up front: the gateway must be
/// on the start address's subnet and no member may run past `.255`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressPlan {
    start: Ipv4Addr,
    gateway: Ipv4Addr,
    subnet: Ipv4Net,
    replica: usize,
}

impl AddressPlan {
    pub fn new(start: Ipv4Addr, netmask: Ipv4Addr, gateway: Ipv4Addr, replica: usize) -> Result<Self> {
        let prefix = ipnet::ipv4_mask_to_prefix(netmask).map_err(|_| {
            ProvisionError::config(format!("netmask {} is not a contiguous mask", netmask))
        })?;
        let subnet = Ipv4Net::new(start, prefix)
            .map_err(|e| ProvisionError::config(format!("invalid prefix /{}: {}", prefix, e)))?
            .trunc();

        validate_same_subnet(start, gateway, netmask)?;

        let last = start.octets()[3] as usize;
        if replica > 0 && last + (replica - 1) > u8::MAX as usize {
            return Err(ProvisionError::config(format!(
                "{} hosts starting at {} would run past .255 in the last octet",
                replica, start
            )));
        }

        let plan = Self {
            start,
            gateway,
            subnet,
            replica,
        };

        for index in 0..replica {
            let ip = plan.address(index);
            if !subnet.contains(&ip) || ip == subnet.broadcast() {
                warn!("Address {} for host #{} is outside usable subnet {}", ip, index, subnet);
            }
        }

        Ok(plan)
    }

    /// Address for the 0-based replica `index`
    ///
    /// Indexes beyond the planned replica count are not range checked.
    pub fn address(&self, index: usize) -> Ipv4Addr {
        let mut octets = self.start.octets();
        octets[3] = octets[3].wrapping_add(index as u8);
        Ipv4Addr::from(octets)
    }

    pub fn addresses(&self) -> Vec<Ipv4Addr> {
        (0..self.replica).map(|i| self.address(i)).collect()
    }

    pub fn subnet(&self) -> Ipv4Net {
        self.subnet
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.gateway
    }
}

/// Classic subnet membership check: `gateway & mask == start & mask`
pub fn validate_same_subnet(start: Ipv4Addr, gateway: Ipv4Addr, netmask: Ipv4Addr) -> Result<()> {
    let mask = u32::from(netmask);
    if u32::from(gateway) & mask == u32::from(start) & mask {
        Ok(())
    } else {
        Err(ProvisionError::Validation(format!(
            "gateway {} and start address {} are not on the same subnet (mask {})",
            gateway, start, netmask
        )))
    }
}
