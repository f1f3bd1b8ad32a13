#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![doc = include_str!("../README.md")]

pub mod cache;
pub mod config;
mod error;
pub mod mailbox;
pub mod message;
pub mod policy;
pub mod protocol;
pub mod status;
pub mod sync;
pub mod transport;
pub mod view;

#[doc(inline)]
pub use crate::{
    error::{AnyBoxedError, Error, Result},
    sync::{MessageChanges, MessageSync, SyncEvent, SyncEventHandler},
};
