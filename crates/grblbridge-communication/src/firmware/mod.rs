//! Firmware support
//!
//! - GRBL protocol handling and the machine controller
//! - Feed rate override tracking
//! - avrdude based firmware flashing

pub mod flasher;
pub mod grbl;
pub mod override_manager;

pub use flasher::{FirmwareFlasher, FlashOutcome, FlashProgressParser, FlashTools};
pub use override_manager::{
    FeedRateTracker, MAXIMUM_OVERRIDE, MINIMUM_OVERRIDE, OVERRIDE_INCREMENT,
};
