//! Durable record of what has been synced.
//!
//! [`StateStore`] tracks a fingerprint per remote resource (remote
//! timestamp, hash of the rendered output, output path) and per downloaded
//! attachment, so a later run can skip everything that has not changed.

pub mod error;
mod key;
mod model;
mod store;

pub use crate::error::{Error, ErrorKind, Result};
pub use crate::key::attachment_key;
pub use crate::model::{AttachmentFingerprint, AttachmentStats, FingerprintKind, ResourceFingerprint};
pub use crate::store::{STATE_VERSION, StateStore};
