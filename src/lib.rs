//! Hydra-Nexus 4: a block-device storage core that places every block by
//! computing a trajectory from an anchor's placement seed, rather than by
//! walking an on-disk free list or extent tree (§1 OVERVIEW).
//!
//! The core is deliberately HAL-agnostic and synchronous (§5): callers
//! supply a [`hal::Hal`] implementation and a [`config::Config`], and get
//! back a [`volume::Volume`] through which every other subsystem is
//! reached.

pub mod addr;
pub mod allocator;
pub mod bitmap;
pub mod chronicle;
pub mod config;
pub mod cortex;
pub mod crc;
pub mod device;
pub mod epoch;
pub mod error;
pub mod hal;
pub mod io;
pub mod qmask;
pub mod superblock;
pub mod volume;

pub use error::{Error, HnResult, Info, Outcome};
pub use volume::Volume;
