//! Message spool
//!
//! - [`spool`]: write-temp/rename-commit storage and the hand-off to relay
//! - [`fs`]: the filesystem seam used by the spool

pub mod fs;
pub mod spool;

pub use fs::{LocalFs, SpoolFs};
pub use spool::{Spool, SpoolTransaction, TxState};
