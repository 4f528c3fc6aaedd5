//! S3 adapter for blobrepo.
//!
//! [`S3ObjectClient`] implements [`blobrepo_core::ObjectClient`] on top of
//! `aws-sdk-s3`, for AWS and S3-compatible providers. Connection settings
//! live in an immutable [`ClientSettings`] snapshot held by a
//! [`ClientSettingsRegistry`], which swaps in a new snapshot on reload.

pub mod client;
pub mod settings;

pub use client::S3ObjectClient;
pub use settings::{ClientSettings, ClientSettingsRegistry};
