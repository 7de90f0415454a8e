use async_trait::async_trait;
use aws_sdk_secretsmanager::Client;

use crate::errors::CredentialError;

use super::{Credential, CredentialSource};

pub struct SecretsManagerCredentialSource {
    client: Client,
}

impl SecretsManagerCredentialSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CredentialSource for SecretsManagerCredentialSource {
    async fn fetch(&self, secret_name: &str) -> Result<Credential, CredentialError> {
        let response = self
            .client
            .get_secret_value()
            .secret_id(secret_name)
            .send()
            .await
            .map_err(|err| classify(err.into_service_error()))?;

        let payload = response
            .secret_string
            .ok_or_else(|| CredentialError::NotFound(secret_name.to_string()))?;

        serde_json::from_str::<Credential>(&payload)
            .map_err(|err| CredentialError::Transport(format!("malformed secret payload: {err}")))
    }
}

fn classify(err: aws_sdk_secretsmanager::operation::get_secret_value::GetSecretValueError) -> CredentialError {
    use aws_sdk_secretsmanager::operation::get_secret_value::GetSecretValueError as E;
    match err {
        E::ResourceNotFoundException(_) => CredentialError::NotFound("secret not found".to_string()),
        E::InvalidRequestException(_) | E::InvalidParameterException(_) => CredentialError::Unauthorized,
        other => CredentialError::Transport(other.to_string()),
    }
}
