//! npm-relay uplink client
//!
//! This crate provides the client a private npm registry uses to reach an
//! upstream registry ("uplink") when it cannot answer from its own storage:
//! proxy selection, health tracking, metadata publish/fetch and streaming
//! tarball transfers.

pub mod config;
pub mod error;
pub mod health;
pub mod metadata;
pub mod proxy;
pub mod request;
pub mod tarball;
pub mod uplink;

pub use config::{GlobalConfig, NoProxy, ProxySetting, TimeoutSetting, UplinkConfig};
pub use error::{Missing, UplinkError};
pub use health::{HealthSnapshot, HealthTracker, HealthTransition};
pub use metadata::{FetchOptions, PackageMetadata};
pub use request::{
    AbortFlag, Reply, ReplyBody, RequestContext, RequestExecutor, ResponseEncoding, Target,
    UplinkRequest,
};
pub use tarball::{Settled, TarballDownload, TarballUpload};
pub use uplink::Uplink;
