//! Relay primitives shared by every protocol handler

pub use self::{
    address::{Address, AddressError, ADDR_OTA_FLAG},
    channel::{channel, Direction, RelayRead, RelayWrite, RELAY_BUFFER_SIZE},
    flow::{ConnectionGuard, FlowStat, SharedFlowStat},
};

pub mod address;
pub mod channel;
pub mod flow;
