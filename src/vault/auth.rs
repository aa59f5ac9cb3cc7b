//! # Vault Authentication Methods
//!
//! The agent authenticates against Vault with exactly one of the supported
//! auth methods. Every method resolves its secrets at login time rather
//! than at configuration load, so rotated credentials take effect without a
//! restart.

use std::path::Path;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::debug;
use validator::Validate;

use crate::config::secret::{RebaseSecrets, Secret};
use crate::errors::{AgentError, Result};
use crate::vault::sigv4;

const AWS_METADATA_URL: &str = "http://169.254.169.254/latest";
const AZURE_METADATA_URL: &str = "http://169.254.169.254/metadata";
const GCP_METADATA_URL: &str = "http://metadata.google.internal/computeMetadata/v1";

/// The `auth` configuration section. Exactly one method must be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    #[validate(nested)]
    pub approle: Option<AppRoleAuthConfig>,

    #[validate(nested)]
    pub aws: Option<AwsAuthConfig>,

    #[validate(nested)]
    pub azure: Option<AzureAuthConfig>,

    #[validate(nested)]
    pub gcp: Option<GcpAuthConfig>,

    #[validate(nested)]
    pub kubernetes: Option<KubernetesAuthConfig>,

    #[validate(nested)]
    pub ldap: Option<LdapAuthConfig>,

    #[validate(nested)]
    pub userpass: Option<UserPassAuthConfig>,

    pub token: Option<Secret>,
}

impl RebaseSecrets for AuthConfig {
    fn rebase_secrets(&mut self, base_dir: &Path) {
        if let Some(approle) = &mut self.approle {
            approle.role_id.rebase_secrets(base_dir);
            approle.secret_id.rebase_secrets(base_dir);
        }
        if let Some(aws) = &mut self.aws {
            aws.region.rebase_secrets(base_dir);
            aws.ec2_nonce.rebase_secrets(base_dir);
        }
        if let Some(kubernetes) = &mut self.kubernetes {
            kubernetes.jwt_token.rebase_secrets(base_dir);
        }
        if let Some(ldap) = &mut self.ldap {
            ldap.username.rebase_secrets(base_dir);
            ldap.password.rebase_secrets(base_dir);
        }
        if let Some(userpass) = &mut self.userpass {
            userpass.username.rebase_secrets(base_dir);
            userpass.password.rebase_secrets(base_dir);
        }
        self.token.rebase_secrets(base_dir);
    }
}

fn default_approle_path() -> String {
    "approle".to_string()
}

/// AppRole credentials.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AppRoleAuthConfig {
    #[serde(default = "default_approle_path")]
    pub path: String,

    #[serde(rename = "role")]
    pub role_id: Secret,

    #[serde(rename = "secret")]
    pub secret_id: Secret,
}

fn default_aws_auth_path() -> String {
    "aws".to_string()
}

fn default_aws_auth_region() -> Secret {
    Secret::from_env("AWS_DEFAULT_REGION")
}

/// How the EC2 instance identity is signed for the ec2 login flow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ec2SignatureType {
    #[default]
    Pkcs7,
    Identity,
    Rsa2048,
}

/// AWS authentication: the ec2 flow when a nonce is configured, the iam
/// flow (signed `sts:GetCallerIdentity`) otherwise.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AwsAuthConfig {
    #[serde(default = "default_aws_auth_path")]
    pub path: String,

    #[serde(default = "default_aws_auth_region")]
    pub region: Secret,

    #[serde(default, alias = "ec2nonce")]
    pub ec2_nonce: Secret,

    #[serde(default)]
    pub role: String,

    #[serde(default, alias = "ec2signaturetype")]
    pub ec2_signature_type: Ec2SignatureType,

    #[serde(default, alias = "iamserveridheader")]
    pub iam_server_id_header: String,
}

fn default_azure_auth_path() -> String {
    "azure".to_string()
}

fn default_azure_resource() -> String {
    "https://management.azure.com/".to_string()
}

/// Azure authentication via the instance's managed identity.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AzureAuthConfig {
    #[serde(default = "default_azure_auth_path")]
    pub path: String,

    #[validate(length(min = 1, message = "Role cannot be empty"))]
    pub role: String,

    #[serde(default = "default_azure_resource")]
    pub resource: String,
}

fn default_gcp_auth_path() -> String {
    "gcp".to_string()
}

/// GCP authentication via the GCE metadata identity token.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct GcpAuthConfig {
    #[serde(default = "default_gcp_auth_path")]
    pub path: String,

    #[validate(length(min = 1, message = "Role cannot be empty"))]
    pub role: String,
}

fn default_kubernetes_path() -> String {
    "kubernetes".to_string()
}

fn default_kubernetes_jwt() -> Secret {
    Secret::from_file("/var/run/secrets/kubernetes.io/serviceaccount/token")
}

/// Kubernetes service-account authentication.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesAuthConfig {
    #[serde(default = "default_kubernetes_path")]
    pub path: String,

    #[validate(length(min = 1, message = "Role cannot be empty"))]
    pub role: String,

    #[serde(default = "default_kubernetes_jwt", alias = "jwttoken")]
    pub jwt_token: Secret,
}

fn default_ldap_path() -> String {
    "ldap".to_string()
}

/// LDAP credentials.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct LdapAuthConfig {
    #[serde(default = "default_ldap_path")]
    pub path: String,

    pub username: Secret,
    pub password: Secret,
}

fn default_userpass_path() -> String {
    "userpass".to_string()
}

/// Userpass credentials.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UserPassAuthConfig {
    #[serde(default = "default_userpass_path")]
    pub path: String,

    pub username: Secret,
    pub password: Secret,
}

/// A successful login: the client token and the lease it was granted for.
pub struct LoginLease {
    pub client_token: String,
    pub ttl: Duration,
}

/// The selected authentication method.
#[derive(Debug, Clone)]
pub enum AuthMethod {
    AppRole(AppRoleAuthConfig),
    Aws(AwsAuthConfig),
    Azure(AzureAuthConfig),
    Gcp(GcpAuthConfig),
    Kubernetes(KubernetesAuthConfig),
    Ldap(LdapAuthConfig),
    UserPass(UserPassAuthConfig),
    Token(Secret),
}

impl AuthMethod {
    /// Pick the configured method. Zero or more than one configured method
    /// is a configuration error.
    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        let mut methods = Vec::new();

        if let Some(approle) = &config.approle {
            methods.push(AuthMethod::AppRole(approle.clone()));
        }
        if let Some(aws) = &config.aws {
            methods.push(AuthMethod::Aws(aws.clone()));
        }
        if let Some(azure) = &config.azure {
            methods.push(AuthMethod::Azure(azure.clone()));
        }
        if let Some(gcp) = &config.gcp {
            methods.push(AuthMethod::Gcp(gcp.clone()));
        }
        if let Some(kubernetes) = &config.kubernetes {
            methods.push(AuthMethod::Kubernetes(kubernetes.clone()));
        }
        if let Some(ldap) = &config.ldap {
            methods.push(AuthMethod::Ldap(ldap.clone()));
        }
        if let Some(userpass) = &config.userpass {
            methods.push(AuthMethod::UserPass(userpass.clone()));
        }
        if let Some(token) = &config.token {
            if !token.is_zero() {
                methods.push(AuthMethod::Token(token.clone()));
            }
        }

        match methods.len() {
            0 => Err(AgentError::config("no authentication method configured")),
            1 => Ok(methods.remove(0)),
            _ => Err(AgentError::config("more than one authentication method configured")),
        }
    }

    /// Log in against the given vault node and return the granted lease.
    pub async fn login(&self, http: &reqwest::Client, address: &str) -> Result<LoginLease> {
        match self {
            AuthMethod::AppRole(config) => {
                let payload = serde_json::json!({
                    "role_id": config.role_id.resolve(true)?,
                    "secret_id": config.secret_id.resolve(true)?,
                });
                post_login(http, address, &config.path, "login", &payload).await
            }
            AuthMethod::Aws(config) => login_aws(http, address, config).await,
            AuthMethod::Azure(config) => login_azure(http, address, config).await,
            AuthMethod::Gcp(config) => login_gcp(http, address, config).await,
            AuthMethod::Kubernetes(config) => {
                let payload = serde_json::json!({
                    "role": config.role,
                    "jwt": config.jwt_token.resolve(true)?,
                });
                post_login(http, address, &config.path, "login", &payload).await
            }
            AuthMethod::Ldap(config) => {
                let username = config.username.resolve(true)?;
                let payload =
                    serde_json::json!({ "password": config.password.resolve(true)? });
                post_login(http, address, &config.path, &format!("login/{}", username), &payload)
                    .await
            }
            AuthMethod::UserPass(config) => {
                let username = config.username.resolve(true)?;
                let payload =
                    serde_json::json!({ "password": config.password.resolve(true)? });
                post_login(http, address, &config.path, &format!("login/{}", username), &payload)
                    .await
            }
            AuthMethod::Token(token) => lookup_token(http, address, token).await,
        }
    }
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    auth: LoginAuth,
}

#[derive(Debug, Deserialize)]
struct LoginAuth {
    client_token: String,
    #[serde(default)]
    lease_duration: u64,
    #[serde(default)]
    policies: Vec<String>,
}

/// POST to `/v1/auth/{mount}/{operation}` and parse the granted lease.
async fn post_login(
    http: &reqwest::Client,
    address: &str,
    mount: &str,
    operation: &str,
    payload: &serde_json::Value,
) -> Result<LoginLease> {
    let url = format!("{}/v1/auth/{}/{}", address, mount, operation);

    let response: LoginResponse = http
        .post(&url)
        .json(payload)
        .send()
        .await
        .map_err(|err| AgentError::vault_with_source("login request failed", Box::new(err)))?
        .error_for_status()
        .map_err(|err| AgentError::vault_with_source("login was rejected", Box::new(err)))?
        .json()
        .await
        .map_err(|err| {
            AgentError::vault_with_source("could not parse login response", Box::new(err))
        })?;

    let ttl = Duration::from_secs(response.auth.lease_duration);
    debug!(ttl = ?ttl, policies = ?response.auth.policies, "Successfully logged into vault");

    Ok(LoginLease { client_token: response.auth.client_token, ttl })
}

#[derive(Debug, Deserialize)]
struct TokenLookupResponse {
    data: TokenLookupData,
}

#[derive(Debug, Deserialize)]
struct TokenLookupData {
    #[serde(default)]
    ttl: u64,
}

/// Verify a pre-issued token via `lookup-self` and derive its remaining
/// lease. Non-expiring tokens report a ttl of 0; they are treated like a
/// 24h lease so the client re-validates them about twice a day.
async fn lookup_token(
    http: &reqwest::Client,
    address: &str,
    token: &Secret,
) -> Result<LoginLease> {
    let token = token.resolve(true)?;

    let response: TokenLookupResponse = http
        .get(format!("{}/v1/auth/token/lookup-self", address))
        .header("X-Vault-Token", &token)
        .send()
        .await
        .map_err(|err| AgentError::vault_with_source("token lookup failed", Box::new(err)))?
        .error_for_status()
        .map_err(|err| AgentError::vault_with_source("token was rejected", Box::new(err)))?
        .json()
        .await
        .map_err(|err| {
            AgentError::vault_with_source("could not parse token lookup response", Box::new(err))
        })?;

    let ttl = match response.data.ttl {
        0 => Duration::from_secs(24 * 60 * 60),
        ttl => Duration::from_secs(ttl),
    };
    debug!(ttl = ?ttl, "Successfully verified vault token");

    Ok(LoginLease { client_token: token, ttl })
}

async fn login_aws(
    http: &reqwest::Client,
    address: &str,
    config: &AwsAuthConfig,
) -> Result<LoginLease> {
    if !config.ec2_nonce.is_zero() {
        login_aws_ec2(http, address, config).await
    } else {
        login_aws_iam(http, address, config).await
    }
}

/// EC2 login: fetch the signed instance-identity document from the
/// instance metadata service and present it to vault.
async fn login_aws_ec2(
    http: &reqwest::Client,
    address: &str,
    config: &AwsAuthConfig,
) -> Result<LoginLease> {
    let nonce = config.ec2_nonce.resolve(true)?;

    let metadata = |path: &str| {
        let url = format!("{}/dynamic/instance-identity/{}", AWS_METADATA_URL, path);
        let http = http.clone();
        async move {
            http.get(url)
                .send()
                .await
                .map_err(|err| {
                    AgentError::vault_with_source(
                        "could not reach instance metadata service",
                        Box::new(err),
                    )
                })?
                .error_for_status()
                .map_err(|err| {
                    AgentError::vault_with_source(
                        "instance metadata request failed",
                        Box::new(err),
                    )
                })?
                .text()
                .await
                .map_err(|err| {
                    AgentError::vault_with_source(
                        "could not read instance metadata",
                        Box::new(err),
                    )
                })
        }
    };

    let mut payload = serde_json::json!({ "nonce": nonce });
    if !config.role.is_empty() {
        payload["role"] = serde_json::Value::String(config.role.clone());
    }

    match config.ec2_signature_type {
        Ec2SignatureType::Pkcs7 => {
            payload["pkcs7"] =
                serde_json::Value::String(metadata("pkcs7").await?.replace('\n', ""));
        }
        Ec2SignatureType::Rsa2048 => {
            payload["pkcs7"] =
                serde_json::Value::String(metadata("rsa2048").await?.replace('\n', ""));
        }
        Ec2SignatureType::Identity => {
            let document = metadata("document").await?;
            payload["identity"] = serde_json::Value::String(BASE64.encode(document));
            payload["signature"] = serde_json::Value::String(metadata("signature").await?);
        }
    }

    post_login(http, address, &config.path, "login", &payload).await
}

/// IAM login: build a SigV4-signed `sts:GetCallerIdentity` request and hand
/// its parts to vault, which replays it against STS to verify the caller.
async fn login_aws_iam(
    http: &reqwest::Client,
    address: &str,
    config: &AwsAuthConfig,
) -> Result<LoginLease> {
    let access_key = std::env::var("AWS_ACCESS_KEY_ID").map_err(|_| {
        AgentError::vault("iam login requires AWS_ACCESS_KEY_ID in the environment")
    })?;
    let secret_key = std::env::var("AWS_SECRET_ACCESS_KEY").map_err(|_| {
        AgentError::vault("iam login requires AWS_SECRET_ACCESS_KEY in the environment")
    })?;
    let session_token = std::env::var("AWS_SESSION_TOKEN").ok();

    let region = match config.region.resolve(false)? {
        region if region.is_empty() => "us-east-1".to_string(),
        region => region,
    };

    let sts_url = format!("https://sts.{}.amazonaws.com/", region);
    let body = b"Action=GetCallerIdentity&Version=2011-06-15";

    let mut headers = reqwest::header::HeaderMap::new();
    headers.insert(
        reqwest::header::CONTENT_TYPE,
        reqwest::header::HeaderValue::from_static(
            "application/x-www-form-urlencoded; charset=utf-8",
        ),
    );
    if !config.iam_server_id_header.is_empty() {
        headers.insert(
            reqwest::header::HeaderName::from_static("x-vault-aws-iam-server-id"),
            reqwest::header::HeaderValue::from_str(&config.iam_server_id_header)
                .map_err(|err| AgentError::vault(format!("invalid iam server id: {}", err)))?,
        );
    }

    sigv4::sign_request(
        "POST",
        &sts_url,
        &mut headers,
        body,
        &access_key,
        &secret_key,
        session_token.as_deref(),
        &region,
        "sts",
    )?;

    // vault expects each header as a list of values
    let mut header_map = serde_json::Map::new();
    for (name, value) in headers.iter() {
        let value = value
            .to_str()
            .map_err(|err| AgentError::vault(format!("invalid header value: {}", err)))?;
        header_map.insert(
            name.as_str().to_string(),
            serde_json::json!([value]),
        );
    }

    let mut payload = serde_json::json!({
        "iam_http_request_method": "POST",
        "iam_request_url": BASE64.encode(&sts_url),
        "iam_request_body": BASE64.encode(body),
        "iam_request_headers": BASE64.encode(serde_json::Value::Object(header_map).to_string()),
    });
    if !config.role.is_empty() {
        payload["role"] = serde_json::Value::String(config.role.clone());
    }

    post_login(http, address, &config.path, "login", &payload).await
}

#[derive(Debug, Deserialize)]
struct AzureTokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AzureComputeMetadata {
    #[serde(default)]
    subscription_id: String,
    #[serde(default)]
    resource_group_name: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    vm_scale_set_name: String,
}

/// Azure login: a managed-identity JWT plus the VM's identity read from the
/// instance metadata service.
async fn login_azure(
    http: &reqwest::Client,
    address: &str,
    config: &AzureAuthConfig,
) -> Result<LoginLease> {
    let token: AzureTokenResponse = http
        .get(format!(
            "{}/identity/oauth2/token?api-version=2018-02-01&resource={}",
            AZURE_METADATA_URL,
            urlencoding::encode(&config.resource)
        ))
        .header("Metadata", "true")
        .send()
        .await
        .map_err(|err| {
            AgentError::vault_with_source(
                "could not reach azure instance metadata service",
                Box::new(err),
            )
        })?
        .error_for_status()
        .map_err(|err| {
            AgentError::vault_with_source("azure identity token request failed", Box::new(err))
        })?
        .json()
        .await
        .map_err(|err| {
            AgentError::vault_with_source("could not parse azure identity token", Box::new(err))
        })?;

    let compute: AzureComputeMetadata = http
        .get(format!("{}/instance/compute?api-version=2021-02-01", AZURE_METADATA_URL))
        .header("Metadata", "true")
        .send()
        .await
        .map_err(|err| {
            AgentError::vault_with_source(
                "could not reach azure instance metadata service",
                Box::new(err),
            )
        })?
        .error_for_status()
        .map_err(|err| {
            AgentError::vault_with_source("azure compute metadata request failed", Box::new(err))
        })?
        .json()
        .await
        .map_err(|err| {
            AgentError::vault_with_source("could not parse azure compute metadata", Box::new(err))
        })?;

    let mut payload = serde_json::json!({
        "role": config.role,
        "jwt": token.access_token,
        "subscription_id": compute.subscription_id,
        "resource_group_name": compute.resource_group_name,
    });
    if compute.vm_scale_set_name.is_empty() {
        payload["vm_name"] = serde_json::Value::String(compute.name);
    } else {
        payload["vmss_name"] = serde_json::Value::String(compute.vm_scale_set_name);
    }

    post_login(http, address, &config.path, "login", &payload).await
}

/// GCP login: a GCE identity JWT with the vault role as audience.
async fn login_gcp(
    http: &reqwest::Client,
    address: &str,
    config: &GcpAuthConfig,
) -> Result<LoginLease> {
    let jwt = http
        .get(format!(
            "{}/instance/service-accounts/default/identity?audience={}&format=full",
            GCP_METADATA_URL,
            urlencoding::encode(&format!("vault/{}", config.role))
        ))
        .header("Metadata-Flavor", "Google")
        .send()
        .await
        .map_err(|err| {
            AgentError::vault_with_source(
                "could not reach gce metadata service",
                Box::new(err),
            )
        })?
        .error_for_status()
        .map_err(|err| {
            AgentError::vault_with_source("gce identity request failed", Box::new(err))
        })?
        .text()
        .await
        .map_err(|err| {
            AgentError::vault_with_source("could not read gce identity token", Box::new(err))
        })?;

    let payload = serde_json::json!({ "role": config.role, "jwt": jwt });
    post_login(http, address, &config.path, "login", &payload).await
}
