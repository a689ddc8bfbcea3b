//! Plugin capability bits.
//!
//! Every plugin advertises the operations it implements. The framework refuses
//! to run a plugin that lacks [`FuncAvailability::MINIMUM`] and never forwards
//! a call whose bit is not set.

use bitflags::bitflags;

bitflags! {
    /// Set of plugin operations a handler driver implements.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FuncAvailability: u32 {
        const INIT = 0x0000_0001;
        const RECONFIGURE = 0x0000_0002;
        const RESET = 0x0000_0004;
        const DRIVERID = 0x0000_0008;
        const EQUIPID = 0x0000_0010;
        const START = 0x0000_0020;
        const BIN = 0x0000_0040;
        const REPROBE = 0x0000_0080;
        const COMMAND = 0x0000_0100;
        const QUERY = 0x0000_0200;
        const DIAG = 0x0000_0400;
        const BINREPR = 0x0000_0800;
        const PAUSE = 0x0000_1000;
        const UNPAUSE = 0x0000_2000;
        const STATUS = 0x0000_4000;
        const UPDATE = 0x0000_8000;
        const COMMTEST = 0x0001_0000;
        const STRIPID = 0x0002_0000;
        const STRIP_INDEXID = 0x0004_0000;
        const LOT_START = 0x0008_0000;
        const LOT_DONE = 0x0010_0000;
        const STRIP_START = 0x0020_0000;
        const STRIP_DONE = 0x0040_0000;
        const GET_STATUS = 0x0080_0000;
        const SET_STATUS = 0x0100_0000;
        const EXECGPIBCMD = 0x0200_0000;
        const EXECGPIBQUERY = 0x0400_0000;
        const GETSRQSTATUSBYTE = 0x0800_0000;
        const DESTROY = 0x1000_0000;

        /// Operations every plugin must provide.
        const MINIMUM = Self::INIT.bits() | Self::START.bits() | Self::BIN.bits();
    }
}

impl FuncAvailability {
    /// Human-readable name of a single operation bit, used in log messages.
    pub fn call_name(self) -> &'static str {
        match self {
            Self::INIT => "init-plugin",
            Self::RECONFIGURE => "reconfigure-plugin",
            Self::RESET => "reset-plugin",
            Self::DRIVERID => "get-driver-id",
            Self::EQUIPID => "get-equipment-id",
            Self::START => "get-device",
            Self::BIN => "bin-device",
            Self::REPROBE => "reprobe",
            Self::COMMAND => "send-command",
            Self::QUERY => "send-query",
            Self::DIAG => "diagnostic",
            Self::BINREPR => "bin-and-reprobe-device",
            Self::PAUSE => "pause",
            Self::UNPAUSE => "unpause",
            Self::STATUS => "get-status",
            Self::UPDATE => "update-plugin",
            Self::COMMTEST => "comm-test",
            Self::STRIPID => "stripmaterial-plugin",
            Self::STRIP_INDEXID => "stripindex-plugin",
            Self::LOT_START => "lotstart-plugin",
            Self::LOT_DONE => "lotdone-plugin",
            Self::STRIP_START => "stripstart-plugin",
            Self::STRIP_DONE => "stripdone-plugin",
            Self::GET_STATUS => "getstatus-plugin",
            Self::SET_STATUS => "setstatus-plugin",
            Self::EXECGPIBCMD => "exec-gpib-cmd",
            Self::EXECGPIBQUERY => "exec-gpib-query",
            Self::GETSRQSTATUSBYTE => "exec-gpib-getsrqstatusbyte",
            Self::DESTROY => "destroy-plugin",
            _ => "(unknown)",
        }
    }

    /// Whether the minimum operation set is present.
    pub fn is_usable(self) -> bool {
        self.contains(Self::MINIMUM)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimum_is_init_start_bin() {
        assert_eq!(FuncAvailability::MINIMUM.bits(), 0x61);
        assert!((FuncAvailability::MINIMUM | FuncAvailability::LOT_START).is_usable());
        assert!(!(FuncAvailability::INIT | FuncAvailability::BIN).is_usable());
    }

    #[test]
    fn call_names() {
        assert_eq!(FuncAvailability::START.call_name(), "get-device");
        assert_eq!(FuncAvailability::MINIMUM.call_name(), "(unknown)");
    }
}
