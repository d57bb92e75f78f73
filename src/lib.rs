#![deny(missing_docs)]

//! Two-party payment channel over an account-based ledger
//!
//! Both participants put their channel account under joint control, then exchange signed close
//! agreements moving the balance between them. The latest agreement can always be closed on
//! the ledger by either participant alone, and an older one can be contested during its
//! observation period.

pub mod agent;
pub mod agreement;
pub mod channel;
pub mod config;
pub mod keys;
pub mod ledger;
pub mod msg;
pub mod signature;
pub mod txbuild;
