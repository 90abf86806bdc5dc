//! S3 backed object fetcher

use async_trait::async_trait;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::Client;
use tracing::debug;

use super::{check_ceiling, FetchedObject, ObjectFetcher};
use crate::error::TransferError;

/// Streams objects with `GetObject`
pub struct S3ObjectFetcher {
    client: Client,
    max_object_bytes: Option<u64>,
}

impl S3ObjectFetcher {
    pub fn new(client: Client, max_object_bytes: Option<u64>) -> Self {
        Self {
            client,
            max_object_bytes,
        }
    }
}

#[async_trait]
impl ObjectFetcher for S3ObjectFetcher {
    async fn fetch(
        &self,
        store_name: &str,
        object_key: &str,
    ) -> Result<FetchedObject, TransferError> {
        let location = format!("s3://{}/{}", store_name, object_key);
        debug!("GetObject {}", location);

        let output = self
            .client
            .get_object()
            .bucket(store_name)
            .key(object_key)
            .send()
            .await
            .map_err(|e| classify_sdk_error(&location, e))?;

        let size = output
            .content_length()
            .and_then(|len| u64::try_from(len).ok())
            .ok_or_else(|| {
                TransferError::ObjectStoreUnavailable(format!(
                    "{}: response carried no content length",
                    location
                ))
            })?;

        check_ceiling(size, self.max_object_bytes)?;

        Ok(FetchedObject {
            size,
            body: Box::pin(output.body.into_async_read()),
        })
    }
}

fn classify_sdk_error(location: &str, err: SdkError<GetObjectError, HttpResponse>) -> TransferError {
    match err {
        SdkError::ServiceError(service_err) => {
            let status = service_err.raw().status().as_u16();
            let inner = service_err.into_err();
            let code = inner.code().unwrap_or("Unknown").to_string();

            match inner {
                GetObjectError::NoSuchKey(_) => TransferError::ObjectNotFound(location.to_string()),
                // Without ListBucket permission a missing key surfaces as 403.
                _ if status == 404 || code == "NoSuchBucket" || code == "AccessDenied" => {
                    TransferError::ObjectNotFound(format!("{} ({})", location, code))
                }
                _ if status >= 500 || code == "SlowDown" || code == "RequestTimeout" => {
                    TransferError::ObjectStoreUnavailable(format!("{}: {}", location, code))
                }
                _ => TransferError::ObjectNotFound(format!(
                    "{}: store refused the read ({} {})",
                    location, status, code
                )),
            }
        }
        other => TransferError::ObjectStoreUnavailable(format!(
            "{}: {}",
            location,
            DisplayErrorContext(&other)
        )),
    }
}
