//! Backs up managed databases without touching production traffic: snapshot
//! the live instance, restore a disposable clone, harden it, dump it, upload
//! the dump and tear everything down, publishing a status document after
//! every step.

pub mod accounts;
pub mod api;
pub mod backup;
pub mod cloud;
pub mod config;
pub mod db;
#[cfg(feature = "fakes")]
pub mod fakes;
pub mod logging;
pub mod queue;
pub mod shutdown;
pub mod worker;
