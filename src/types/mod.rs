//! Value types shared across the cluster and transport layers.

pub mod id;
pub mod urls;

pub use id::Id;
pub use urls::{Urls, UrlsError};
