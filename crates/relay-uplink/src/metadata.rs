//! Package metadata operations

use reqwest::StatusCode;
use reqwest::header::{ETAG, HeaderValue, IF_NONE_MATCH};
use serde_json::Value;
use tracing::debug;

use crate::error::{Missing, UplinkError};
use crate::request::{Reply, ReplyBody, RequestContext, Target, UplinkRequest};
use crate::uplink::Uplink;

/// Options for [`Uplink::fetch_package_metadata`]
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// ETag of the copy the caller already has
    pub etag: Option<String>,
    /// Inbound request this fetch is made for
    pub context: Option<RequestContext>,
}

/// Package document returned by an uplink
#[derive(Debug, Clone, PartialEq)]
pub struct PackageMetadata {
    pub metadata: Value,
    pub etag: Option<String>,
}

impl Uplink {
    /// Publish a whole package document
    pub async fn publish_package(&self, name: &str, metadata: Value) -> Result<(), UplinkError> {
        let request = UplinkRequest::put(Target::path([name])).json(metadata);
        let reply = self.executor.execute(request).await?;
        ensure_success(&reply)
    }

    /// Publish a single version and point `tag` at it
    pub async fn publish_version_tag(
        &self,
        name: &str,
        version: &str,
        metadata: Value,
        tag: &str,
    ) -> Result<(), UplinkError> {
        let request =
            UplinkRequest::put(Target::path([name, version, "-tag", tag])).json(metadata);
        let reply = self.executor.execute(request).await?;
        ensure_success(&reply)
    }

    /// Fetch the package document, conditionally when an ETag is known
    pub async fn fetch_package_metadata(
        &self,
        name: &str,
        options: FetchOptions,
    ) -> Result<PackageMetadata, UplinkError> {
        let mut request = UplinkRequest::get(Target::path([name]))
            .expect_json()
            .context(options.context);
        if let Some(etag) = &options.etag {
            request = request.header(IF_NONE_MATCH, HeaderValue::from_str(etag)?);
        }

        let reply = self.executor.execute(request).await?;
        if reply.status == StatusCode::NOT_FOUND {
            return Err(UplinkError::NotFound(Missing::Package));
        }
        ensure_success(&reply)?;

        let etag = reply.header(ETAG.as_str()).map(str::to_string);
        let metadata = match reply.body {
            ReplyBody::Json(document) => document,
            other => {
                debug!("Uplink returned a non-JSON package document: {:?}", other);
                return Err(UplinkError::Upstream(
                    "package document is not JSON".to_string(),
                ));
            }
        };

        Ok(PackageMetadata { metadata, etag })
    }
}

fn ensure_success(reply: &Reply) -> Result<(), UplinkError> {
    if reply.is_success() {
        Ok(())
    } else {
        Err(UplinkError::BadStatus {
            status: reply.status.as_u16(),
        })
    }
}
