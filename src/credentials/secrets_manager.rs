//! Secrets Manager backed credential provider

use async_trait::async_trait;
use aws_sdk_secretsmanager::config::http::HttpResponse;
use aws_sdk_secretsmanager::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_secretsmanager::operation::get_secret_value::GetSecretValueError;
use aws_sdk_secretsmanager::Client;
use tracing::{debug, warn};

use super::{parse_secret_payload, Credential, CredentialProvider};
use crate::error::TransferError;

const TRANSIENT_CODES: &[&str] = &[
    "ThrottlingException",
    "TooManyRequestsException",
    "RequestLimitExceeded",
    "ServiceUnavailable",
];

/// Reads `{host, port, username, password}` JSON secrets
pub struct SecretsManagerProvider {
    client: Client,
}

impl SecretsManagerProvider {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CredentialProvider for SecretsManagerProvider {
    async fn resolve(&self, secret_id: &str) -> Result<Credential, TransferError> {
        debug!("Fetching secret {}", secret_id);

        let output = self
            .client
            .get_secret_value()
            .secret_id(secret_id)
            .send()
            .await
            .map_err(|e| classify_sdk_error(secret_id, e))?;

        let payload = output.secret_string().ok_or_else(|| {
            TransferError::CredentialMalformed(format!(
                "{}: secret has no string payload",
                secret_id
            ))
        })?;

        parse_secret_payload(secret_id, payload)
    }
}

fn classify_sdk_error(
    secret_id: &str,
    err: SdkError<GetSecretValueError, HttpResponse>,
) -> TransferError {
    match err {
        SdkError::ServiceError(service_err) => {
            let inner = service_err.into_err();
            let code = inner.code().unwrap_or("Unknown").to_string();
            match inner {
                GetSecretValueError::ResourceNotFoundException(_) => {
                    TransferError::CredentialNotFound(secret_id.to_string())
                }
                GetSecretValueError::InternalServiceError(_) => {
                    TransferError::CredentialStoreUnavailable(format!("{}: {}", secret_id, code))
                }
                // Deleted/scheduled-for-deletion secrets, KMS decryption failures and
                // access denials all need an operator, not a retry.
                GetSecretValueError::InvalidRequestException(_)
                | GetSecretValueError::InvalidParameterException(_)
                | GetSecretValueError::DecryptionFailure(_) => {
                    TransferError::CredentialNotFound(format!("{}: {}", secret_id, code))
                }
                _ if TRANSIENT_CODES.contains(&code.as_str()) => {
                    TransferError::CredentialStoreUnavailable(format!("{}: {}", secret_id, code))
                }
                _ => {
                    warn!("Unclassified secret store error for {}: {}", secret_id, code);
                    TransferError::CredentialNotFound(format!("{}: {}", secret_id, code))
                }
            }
        }
        SdkError::TimeoutError(_) => TransferError::CredentialStoreUnavailable(format!(
            "{}: request timed out",
            secret_id
        )),
        other => TransferError::CredentialStoreUnavailable(format!(
            "{}: {}",
            secret_id,
            DisplayErrorContext(&other)
        )),
    }
}
