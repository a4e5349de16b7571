use crate::catalog::Cloud;
use crate::config::Config;
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine};
use chrono::{SecondsFormat, Utc};
use rusoto_core::{HttpClient, RusotoError};
use rusoto_credential::StaticProvider;
use rusoto_ec2::{
    AuthorizeSecurityGroupIngressRequest, CreateKeyPairRequest, CreateSecurityGroupRequest,
    DescribeAvailabilityZonesRequest, DescribeInstancesRequest, DescribeSpotPriceHistoryRequest,
    Ec2, Ec2Client, Instance, Placement, RunInstancesRequest,
};
use rusoto_signature::Region;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

/// TCP port ranges CloudMan and its services listen on.
const CLOUDMAN_PORTS: &[(i64, i64)] = &[
    (20, 21),
    (22, 22),
    (80, 80),
    (443, 443),
    (8080, 8080),
    (9600, 9600),
    (30000, 30100),
    (42284, 42284),
];
const READINESS_TIMEOUT: Duration = Duration::from_secs(5);

// -----------------------------------------------------------------------------
// Models
// -----------------------------------------------------------------------------

/// Failure reported by, or while talking to, a cloud provider.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// The provider answered with a structured error.
    Api { code: String, message: String },
    Transport(String),
}

impl ProviderError {
    pub fn code(&self) -> Option<&str> {
        match self {
            ProviderError::Api { code, .. } => Some(code),
            ProviderError::Transport(_) => None,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ProviderError::Api { message, .. } => message,
            ProviderError::Transport(message) => message,
        }
    }

    /// Builds an error from an EC2 error document.
    pub fn from_response_body(status: &str, body: &str) -> Self {
        match (xml_tag(body, "Code"), xml_tag(body, "Message")) {
            (Some(code), Some(message)) => ProviderError::Api {
                code: code.trim().to_string(),
                message: message.trim().to_string(),
            },
            (Some(code), None) => ProviderError::Api {
                code: code.trim().to_string(),
                message: code.trim().to_string(),
            },
            _ => ProviderError::Transport(format!(
                "Unexpected provider response ({}): {}",
                status,
                body.trim()
            )),
        }
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProviderError::Api { code, message } => write!(f, "{}: {}", code, message),
            ProviderError::Transport(message) => write!(f, "{}", message),
        }
    }
}

impl<E: std::error::Error + 'static> From<RusotoError<E>> for ProviderError {
    fn from(err: RusotoError<E>) -> Self {
        match err {
            RusotoError::Unknown(response) => ProviderError::from_response_body(
                &response.status.to_string(),
                &String::from_utf8_lossy(response.body.as_ref()),
            ),
            other => ProviderError::Transport(other.to_string()),
        }
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
}

impl Credentials {
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Credentials {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub cluster_name: String,
    pub image_id: String,
    pub instance_type: String,
    pub password: String,
    pub kernel_id: Option<String>,
    pub ramdisk_id: Option<String>,
    pub placement: Option<String>,
    pub user_data: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LaunchOutcome {
    pub instance_id: String,
    pub instance_ip: Option<String>,
    pub kp_name: String,
    /// Only present when the key pair was created by this launch.
    pub kp_material: Option<String>,
    pub sg_names: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub instance_state: String,
    pub public_ip: String,
    pub placement: String,
    pub error: String,
}

/// Values the bootstrap payload is composed from.
#[derive(Debug, Clone, Copy)]
pub struct BootstrapFields<'a> {
    pub cloud: &'a Cloud,
    pub cluster_name: &'a str,
    pub access_key: &'a str,
    pub secret_key: &'a str,
    pub password: &'a str,
}

#[derive(Serialize)]
struct UserDataDocument<'a> {
    access_key: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    bucket_default: Option<&'a str>,
    cloud_name: &'a str,
    cluster_name: &'a str,
    freenxpass: &'a str,
    password: &'a str,
    secret_key: &'a str,
    #[serde(flatten)]
    cloud_info: CloudInfo<'a>,
}

#[derive(Serialize)]
struct CloudInfo<'a> {
    cloud_type: &'a str,
    ec2_conn_path: &'a str,
    ec2_host: &'a str,
    ec2_port: Option<i32>,
    is_secure: bool,
    region_endpoint: &'a str,
    region_name: &'a str,
    s3_conn_path: &'a str,
    s3_host: &'a str,
    s3_port: Option<i32>,
}

// -----------------------------------------------------------------------------
// Traits
// -----------------------------------------------------------------------------

/// A connection to one cloud made with one set of credentials.
#[async_trait]
pub trait CloudLauncher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchOutcome, ProviderError>;

    async fn status(&self, instance_id: &str) -> Result<InstanceStatus, ProviderError>;

    /// Availability zones the instance type can be placed in.
    async fn placements(&self, instance_type: &str) -> Result<Vec<String>, ProviderError>;
}

pub trait LauncherFactory: Send + Sync {
    fn connect(
        &self,
        credentials: &Credentials,
        cloud: &Cloud,
    ) -> Result<Box<dyn CloudLauncher>, ProviderError>;
}

// -----------------------------------------------------------------------------
// Functions
// -----------------------------------------------------------------------------

/// Composes the user-data handed to a new instance.
///
/// The output depends on `fields` only, so recomposing from the same values
/// yields the same bytes.
pub fn compose_user_data(fields: &BootstrapFields) -> Result<String, serde_yaml::Error> {
    let cloud = fields.cloud;
    let document = UserDataDocument {
        access_key: fields.access_key,
        bucket_default: Some(cloud.bucket_default.as_str()).filter(|b| !b.is_empty()),
        cloud_name: &cloud.name,
        cluster_name: fields.cluster_name,
        freenxpass: fields.password,
        password: fields.password,
        secret_key: fields.secret_key,
        cloud_info: CloudInfo {
            cloud_type: &cloud.cloud_type,
            ec2_conn_path: &cloud.ec2_conn_path,
            ec2_host: &cloud.region_endpoint,
            ec2_port: cloud.ec2_port,
            is_secure: cloud.is_secure,
            region_endpoint: &cloud.region_endpoint,
            region_name: &cloud.region_name,
            s3_conn_path: &cloud.s3_conn_path,
            s3_host: &cloud.s3_host,
            s3_port: cloud.s3_port,
        },
    };

    serde_yaml::to_string(&document)
}

pub fn region_for(cloud: &Cloud) -> Region {
    if cloud.cloud_type == "ec2" {
        if let Ok(region) = cloud.region_name.parse::<Region>() {
            return region;
        }
    }

    let scheme = if cloud.is_secure { "https" } else { "http" };
    let mut endpoint = match cloud.ec2_port {
        Some(port) => format!("{}://{}:{}", scheme, cloud.region_endpoint, port),
        None => format!("{}://{}", scheme, cloud.region_endpoint),
    };
    let path = cloud.ec2_conn_path.trim_end_matches('/');
    if !path.is_empty() {
        if !path.starts_with('/') {
            endpoint.push('/');
        }
        endpoint.push_str(path);
    }

    Region::Custom {
        name: cloud.region_name.clone(),
        endpoint,
    }
}

/// `Ok(true)` when the call succeeded, `Ok(false)` when it failed only
/// because the resource already exists.
fn tolerate_duplicate(result: Result<(), ProviderError>, code: &str) -> Result<bool, ProviderError> {
    match result {
        Ok(()) => Ok(true),
        Err(err) if err.code() == Some(code) => Ok(false),
        Err(err) => Err(err),
    }
}

/// Ingress rules a CloudMan security group needs.
fn ingress_rules(group: &str) -> Vec<AuthorizeSecurityGroupIngressRequest> {
    let mut rules: Vec<_> = CLOUDMAN_PORTS
        .iter()
        .map(|(from_port, to_port)| AuthorizeSecurityGroupIngressRequest {
            group_name: Some(group.to_string()),
            ip_protocol: Some("tcp".to_string()),
            from_port: Some(*from_port),
            to_port: Some(*to_port),
            cidr_ip: Some("0.0.0.0/0".to_string()),
            ..Default::default()
        })
        .collect();

    // cluster members talk to each other on any port
    rules.push(AuthorizeSecurityGroupIngressRequest {
        group_name: Some(group.to_string()),
        source_security_group_name: Some(group.to_string()),
        ..Default::default()
    });

    rules
}

fn xml_tag<'a>(body: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)? + start;
    Some(&body[start..end])
}

// -----------------------------------------------------------------------------
// EC2
// -----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Ec2LauncherFactory {
    pub security_group: String,
    pub key_pair_name: String,
}

impl Ec2LauncherFactory {
    pub fn new(config: &Config) -> Self {
        Self {
            security_group: config.security_group.clone(),
            key_pair_name: config.key_pair_name.clone(),
        }
    }
}

impl LauncherFactory for Ec2LauncherFactory {
    fn connect(
        &self,
        credentials: &Credentials,
        cloud: &Cloud,
    ) -> Result<Box<dyn CloudLauncher>, ProviderError> {
        let launcher = Ec2Launcher::connect(
            credentials,
            cloud,
            &self.security_group,
            &self.key_pair_name,
        )?;
        Ok(Box::new(launcher))
    }
}

pub struct Ec2Launcher {
    client: Ec2Client,
    http: reqwest::Client,
    cloud: Cloud,
    security_group: String,
    key_pair_name: String,
}

impl Ec2Launcher {
    pub fn connect(
        credentials: &Credentials,
        cloud: &Cloud,
        security_group: &str,
        key_pair_name: &str,
    ) -> Result<Self, ProviderError> {
        log::debug!("connecting to {} ({})", cloud.name, cloud.region_name);
        let provider = StaticProvider::new_minimal(
            credentials.access_key.clone(),
            credentials.secret_key.clone(),
        );
        let dispatcher = HttpClient::new().map_err(|err| {
            ProviderError::Transport(format!("failed to construct http client: {}", err))
        })?;
        let http = reqwest::Client::builder()
            .timeout(READINESS_TIMEOUT)
            .build()
            .map_err(|err| {
                ProviderError::Transport(format!("failed to construct http client: {}", err))
            })?;

        Ok(Self {
            client: Ec2Client::new_with(dispatcher, provider, region_for(cloud)),
            http,
            cloud: cloud.clone(),
            security_group: security_group.to_string(),
            key_pair_name: key_pair_name.to_string(),
        })
    }

    async fn ensure_security_group(&self) -> Result<String, ProviderError> {
        let name = self.security_group.clone();
        let req = CreateSecurityGroupRequest {
            group_name: name.clone(),
            description: "Security group for CloudMan".to_string(),
            ..Default::default()
        };

        let created = self
            .client
            .create_security_group(req)
            .await
            .map(|_| ())
            .map_err(ProviderError::from);
        if tolerate_duplicate(created, "InvalidGroup.Duplicate")? {
            log::info!("Created security group '{}'", name);
        } else {
            // an existing group still gets any rules it is missing
            log::debug!("Security group '{}' already exists", name);
        }

        for req in ingress_rules(&name) {
            let authorized = self
                .client
                .authorize_security_group_ingress(req)
                .await
                .map(|_| ())
                .map_err(ProviderError::from);
            tolerate_duplicate(authorized, "InvalidPermission.Duplicate")?;
        }

        Ok(name)
    }

    async fn ensure_key_pair(&self) -> Result<(String, Option<String>), ProviderError> {
        let name = self.key_pair_name.clone();
        let req = CreateKeyPairRequest {
            key_name: name.clone(),
            ..Default::default()
        };

        match self.client.create_key_pair(req).await {
            Ok(key_pair) => {
                log::info!("Created key pair '{}'", name);
                Ok((key_pair.key_name.unwrap_or(name), key_pair.key_material))
            }
            Err(err) => {
                let err = ProviderError::from(err);
                if err.code() == Some("InvalidKeyPair.Duplicate") {
                    log::debug!("Key pair '{}' already exists, no key material", name);
                    Ok((name, None))
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn describe_instance(&self, instance_id: &str) -> Result<Option<Instance>, ProviderError> {
        let req = DescribeInstancesRequest {
            instance_ids: Some(vec![instance_id.to_string()]),
            ..Default::default()
        };
        let result = self.client.describe_instances(req).await?;

        Ok(result
            .reservations
            .unwrap_or_default()
            .into_iter()
            .flat_map(|reservation| reservation.instances.unwrap_or_default())
            .next())
    }

    async fn cloudman_ready(&self, public_ip: &str) -> bool {
        if public_ip.is_empty() {
            return false;
        }

        let url = format!("http://{}/cloud", public_ip);
        match self.http.get(&url).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                status == 200 || status == 401
            }
            Err(err) => {
                log::debug!("CloudMan at {} not reachable yet: {}", url, err);
                false
            }
        }
    }
}

#[async_trait]
impl CloudLauncher for Ec2Launcher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchOutcome, ProviderError> {
        let sg_name = self.ensure_security_group().await?;
        let (kp_name, kp_material) = self.ensure_key_pair().await?;

        let req = RunInstancesRequest {
            image_id: Some(spec.image_id.clone()),
            instance_type: Some(spec.instance_type.clone()),
            kernel_id: spec.kernel_id.clone(),
            ramdisk_id: spec.ramdisk_id.clone(),
            key_name: Some(kp_name.clone()),
            security_groups: Some(vec![sg_name.clone()]),
            user_data: Some(general_purpose::STANDARD.encode(spec.user_data.as_bytes())),
            placement: spec.placement.clone().map(|zone| Placement {
                availability_zone: Some(zone),
                ..Default::default()
            }),
            min_count: 1,
            max_count: 1,
            ..Default::default()
        };

        let reservation = self.client.run_instances(req).await?;
        let instance = reservation
            .instances
            .and_then(|instances| instances.into_iter().next())
            .ok_or_else(|| {
                ProviderError::Transport("Failed to get the instance details.".to_string())
            })?;
        let instance_id = instance
            .instance_id
            .ok_or_else(|| ProviderError::Transport("Instance ID not found".to_string()))?;
        log::info!("Launched an instance with ID {}", instance_id);

        let instance_ip = match instance.public_ip_address {
            Some(ip) if !ip.is_empty() => Some(ip),
            _ => match self.describe_instance(&instance_id).await {
                Ok(described) => described.and_then(|i| i.public_ip_address),
                Err(err) => {
                    log::debug!("No public IP yet for {}: {}", instance_id, err);
                    None
                }
            },
        };

        Ok(LaunchOutcome {
            instance_id,
            instance_ip,
            kp_name,
            kp_material,
            sg_names: vec![sg_name],
        })
    }

    async fn status(&self, instance_id: &str) -> Result<InstanceStatus, ProviderError> {
        let instance = self
            .describe_instance(instance_id)
            .await?
            .ok_or_else(|| ProviderError::Transport(format!("Instance {} not found", instance_id)))?;

        let state = instance.state.and_then(|s| s.name).unwrap_or_default();
        let public_ip = instance.public_ip_address.unwrap_or_default();
        let mut status = InstanceStatus {
            public_ip: public_ip.clone(),
            ..Default::default()
        };

        if state == "running" {
            if self.cloudman_ready(&public_ip).await {
                status.instance_state = state;
                status.placement = instance
                    .placement
                    .and_then(|p| p.availability_zone)
                    .unwrap_or_default();
            } else {
                status.instance_state = "booting".to_string();
            }
        } else {
            status.instance_state = state;
        }

        Ok(status)
    }

    async fn placements(&self, instance_type: &str) -> Result<Vec<String>, ProviderError> {
        let zones = self
            .client
            .describe_availability_zones(DescribeAvailabilityZonesRequest::default())
            .await?;
        let mut zones: Vec<String> = zones
            .availability_zones
            .unwrap_or_default()
            .into_iter()
            .filter(|zone| zone.state.as_deref() == Some("available"))
            .filter_map(|zone| zone.zone_name)
            .collect();
        zones.sort();

        if self.cloud.cloud_type != "ec2" {
            return Ok(zones);
        }

        let req = DescribeSpotPriceHistoryRequest {
            instance_types: Some(vec![instance_type.to_string()]),
            product_descriptions: Some(vec!["Linux/UNIX".to_string()]),
            start_time: Some(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
            ..Default::default()
        };
        let offered: BTreeSet<String> = self
            .client
            .describe_spot_price_history(req)
            .await?
            .spot_price_history
            .unwrap_or_default()
            .into_iter()
            .filter_map(|price| price.availability_zone)
            .collect();

        if offered.is_empty() {
            return Ok(zones);
        }

        Ok(zones.into_iter().filter(|zone| offered.contains(zone)).collect())
    }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::TestUtils;

    const SIGNATURE_ERROR: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>
<Response><Errors><Error><Code>SignatureDoesNotMatch</Code><Message>The request signature we calculated does not match the signature you provided. Check your AWS Secret Access Key and signing method.</Message></Error></Errors><RequestID>1b4c</RequestID></Response>";

    fn fields(cloud: &Cloud) -> BootstrapFields<'_> {
        BootstrapFields {
            cloud,
            cluster_name: "galaxy",
            access_key: "AKIDEXAMPLE",
            secret_key: "secret",
            password: "hunter2",
        }
    }

    #[test]
    fn test_error_from_response_body() {
        let err = ProviderError::from_response_body("403 Forbidden", SIGNATURE_ERROR);

        assert_eq!(err.code(), Some("SignatureDoesNotMatch"));
        assert!(err
            .message()
            .starts_with("The request signature we calculated does not match"));
    }

    #[test]
    fn test_error_from_unstructured_body() {
        let err = ProviderError::from_response_body("502 Bad Gateway", "upstream timed out");

        assert_eq!(err.code(), None);
        assert_eq!(
            err.to_string(),
            "Unexpected provider response (502 Bad Gateway): upstream timed out"
        );
    }

    #[test]
    fn test_credentials_debug_redacts_secret() {
        let credentials = Credentials::new("AKIDEXAMPLE", "very-secret");
        let debug = format!("{:?}", credentials);

        assert!(debug.contains("AKIDEXAMPLE"));
        assert!(!debug.contains("very-secret"));
    }

    #[test]
    fn test_compose_user_data() {
        let cloud = TestUtils::ec2_cloud();
        let user_data = compose_user_data(&fields(&cloud)).expect("user data");

        let parsed: serde_yaml::Value = serde_yaml::from_str(&user_data).expect("valid yaml");
        assert_eq!(parsed["cluster_name"], "galaxy");
        assert_eq!(parsed["freenxpass"], "hunter2");
        assert_eq!(parsed["password"], "hunter2");
        assert_eq!(parsed["cloud_name"], "Amazon EC2");
        assert_eq!(parsed["cloud_type"], "ec2");
        assert_eq!(parsed["bucket_default"], "cloudman");
        assert_eq!(parsed["region_name"], "us-east-1");
        assert!(parsed.get("instance_id").is_none());
        assert!(parsed.get("kp_material").is_none());
    }

    #[test]
    fn test_compose_user_data_is_deterministic() {
        let cloud = TestUtils::openstack_cloud();

        let first = compose_user_data(&fields(&cloud)).unwrap();
        let second = compose_user_data(&fields(&cloud)).unwrap();

        assert_eq!(first, second);
        let parsed: serde_yaml::Value = serde_yaml::from_str(&first).unwrap();
        assert!(parsed.get("bucket_default").is_none());
    }

    #[test]
    fn test_region_for_ec2_and_custom() {
        let ec2 = TestUtils::ec2_cloud();
        assert_eq!(region_for(&ec2), Region::UsEast1);

        let openstack = TestUtils::openstack_cloud();
        assert_eq!(
            region_for(&openstack),
            Region::Custom {
                name: "nova".to_string(),
                endpoint: "http://openstack.example.org:8773/services/Cloud".to_string(),
            }
        );
    }

    #[test]
    fn test_tolerate_duplicate() {
        let duplicate = ProviderError::Api {
            code: "InvalidGroup.Duplicate".to_string(),
            message: "The security group 'CloudMan' already exists".to_string(),
        };
        let denied = ProviderError::Api {
            code: "UnauthorizedOperation".to_string(),
            message: "You are not authorized to perform this operation.".to_string(),
        };

        assert_eq!(tolerate_duplicate(Ok(()), "InvalidGroup.Duplicate"), Ok(true));
        assert_eq!(
            tolerate_duplicate(Err(duplicate.clone()), "InvalidGroup.Duplicate"),
            Ok(false)
        );
        assert_eq!(
            tolerate_duplicate(Err(duplicate.clone()), "InvalidPermission.Duplicate"),
            Err(duplicate)
        );
        assert_eq!(
            tolerate_duplicate(Err(denied.clone()), "InvalidGroup.Duplicate"),
            Err(denied)
        );
    }

    #[test]
    fn test_ingress_rules() {
        let rules = ingress_rules("CloudMan");

        assert_eq!(rules.len(), CLOUDMAN_PORTS.len() + 1);
        assert!(rules
            .iter()
            .all(|rule| rule.group_name.as_deref() == Some("CloudMan")));
        assert!(rules
            .iter()
            .any(|rule| rule.from_port == Some(80) && rule.cidr_ip.as_deref() == Some("0.0.0.0/0")));
        assert!(rules
            .iter()
            .any(|rule| rule.from_port == Some(30000) && rule.to_port == Some(30100)));

        let internal = rules.last().unwrap();
        assert_eq!(internal.source_security_group_name.as_deref(), Some("CloudMan"));
        assert_eq!(internal.ip_protocol, None);
    }

    #[test]
    fn test_region_for_root_conn_path() {
        let mut cloud = TestUtils::openstack_cloud();
        cloud.ec2_conn_path = "/".to_string();
        cloud.ec2_port = None;
        cloud.is_secure = true;

        assert_eq!(
            region_for(&cloud),
            Region::Custom {
                name: "nova".to_string(),
                endpoint: "https://openstack.example.org".to_string(),
            }
        );
    }
}
