// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;

/// Slave identifier
pub type SlaveId = u8;

/// A single byte for addressing Modbus slave devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Slave(pub SlaveId);

impl Slave {
    /// The special address for sending a broadcast message to all
    /// connected Modbus slave devices at once. Broadcast messages
    /// are one-way and sent from the master to all slaves, i.e.
    /// a request without a response.
    #[must_use]
    pub const fn broadcast() -> Self {
        Slave(0)
    }

    /// The minimum address of a single Modbus slave device.
    #[must_use]
    pub const fn min_device() -> Self {
        Slave(1)
    }

    /// The maximum address of a single Modbus slave device.
    #[must_use]
    pub const fn max_device() -> Self {
        Slave(247)
    }

    /// The reserved address for sending a message to a directly
    /// connected Modbus TCP device, i.e. if not forwarded through
    /// a TCP/RTU gateway according to the unit identifier.
    ///
    /// [MODBUS Messaging on TCP/IP Implementation Guide](http://www.modbus.org/docs/Modbus_Messaging_Implementation_Guide_V1_0b.pdf), page 23
    /// "On TCP/IP, the MODBUS server is addressed using its IP address; therefore,
    /// the MODBUS Unit Identifier is useless. The value 0xFF has to be used."
    #[must_use]
    pub const fn tcp_device() -> Self {
        Slave(255)
    }

    /// Check if the [`SlaveId`] is used for broadcasting
    #[must_use]
    pub fn is_broadcast(self) -> bool {
        self == Self::broadcast()
    }

    /// Check if the [`SlaveId`] addresses a single device
    #[must_use]
    pub fn is_single_device(self) -> bool {
        self >= Self::min_device() && self <= Self::max_device()
    }

    /// Check if the [`SlaveId`] is reserved
    #[must_use]
    pub fn is_reserved(self) -> bool {
        self > Self::max_device()
    }
}

impl From<SlaveId> for Slave {
    fn from(from: SlaveId) -> Self {
        Slave(from)
    }
}

impl From<Slave> for SlaveId {
    fn from(from: Slave) -> Self {
        from.0
    }
}

impl fmt::Display for Slave {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:0>2X})", self.0, self.0)
    }
}

/// Stateful management of the currently active device.
///
/// RTU devices are addressed by their assigned *slave id*.
///
/// TCP devices are either addressed directly (= implicitly) by using the
/// reserved *unit id* `Slave::tcp_device() = 0xFF` (default) or indirectly
/// through an TCP/RTU gateway by setting the *unit id* to the desired
/// *slave id*.
pub trait SlaveContext {
    /// Select a slave device for all subsequent outgoing requests.
    fn set_slave(&mut self, slave: Slave);
}

/// The unit addresses a device answers to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum UnitFilter {
    /// Accept every unit address.
    #[default]
    Any,

    /// Accept only the listed unit addresses.
    Units(Vec<Slave>),
}

impl UnitFilter {
    #[must_use]
    pub fn accepts(&self, slave: Slave) -> bool {
        match self {
            Self::Any => true,
            Self::Units(units) => units.contains(&slave),
        }
    }
}

impl From<Slave> for UnitFilter {
    fn from(from: Slave) -> Self {
        Self::Units(vec![from])
    }
}

impl From<Vec<Slave>> for UnitFilter {
    fn from(from: Vec<Slave>) -> Self {
        Self::Units(from)
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn format() {
        assert!(format!("{}", Slave(123)).contains("123"));
        assert!(format!("{}", Slave(0x7B)).contains("0x7B"));
        assert!(!format!("{}", Slave(0x7B)).contains("0x7b"));
    }

    #[test]
    fn reserved_and_broadcast_addresses() {
        assert!(Slave(0).is_broadcast());
        assert!(!Slave(0).is_single_device());
        assert!(Slave(247).is_single_device());
        assert!(Slave(248).is_reserved());
        assert!(Slave::tcp_device().is_reserved());
    }

    #[test]
    fn unit_filter() {
        assert!(UnitFilter::Any.accepts(Slave(17)));
        assert!(UnitFilter::from(Slave(1)).accepts(Slave(1)));
        assert!(!UnitFilter::from(Slave(1)).accepts(Slave(2)));
        let filter = UnitFilter::from(vec![Slave(1), Slave(10)]);
        assert!(filter.accepts(Slave(10)));
        assert!(!filter.accepts(Slave(0)));
    }
}
