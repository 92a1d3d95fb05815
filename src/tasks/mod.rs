//! Background Tasks Module
//!
//! Contains the background tasks each attached cache instance runs.
//!
//! # Tasks
//! - Worker: Runs the shared load/save task once it is due
//! - Periodic Flush: Requests a reload at a fixed interval

mod flush;
mod worker;

pub(crate) use flush::spawn_flush_task;
pub(crate) use worker::spawn_worker;
