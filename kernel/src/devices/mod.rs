/*
 * Device Seams
 *
 * The core consumes two kinds of devices: a sector-addressed block
 * device (swap lives on one) and the console byte stream. Both are
 * narrow traits with RAM-backed implementations, so the drivers proper
 * stay outside the core.
 */

pub mod block;
pub mod console;

pub use block::{BlockDevice, RamDisk, SECTOR_SIZE};
