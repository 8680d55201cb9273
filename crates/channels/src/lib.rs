//! Channel driver capability.
//!
//! A driver owns the actual protocol or browser-automation work against the
//! chat network. The gateway only sees the [`ChannelDriver`] trait: it starts
//! an instance, consumes the [`DriverEvent`] stream it produces, and calls
//! back into it for outbound sends, liveness probes, and contact lookups.

pub mod address;
pub mod driver;
pub mod error;
pub mod loopback;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use {
    address::{AddressError, DEFAULT_ADDRESS_SUFFIX, normalize_address},
    driver::{
        ChannelDriver, ContactInfo, DriverEvent, DriverFactory, EventSink, InboundMessage,
        LinkState, MediaAttachment,
    },
    error::DriverError,
    loopback::{LoopbackDriver, LoopbackFactory},
};
