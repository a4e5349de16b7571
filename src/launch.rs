use actix_web::http::header;
use actix_web::{web, HttpResponse};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use validator::{Validate, ValidationErrors};

use crate::catalog::{Catalog, CatalogError, Cloud, Image};
use crate::cloud_provider::{
    compose_user_data, BootstrapFields, Credentials, LaunchOutcome, LaunchSpec, LauncherFactory,
    ProviderError,
};
use crate::middleware::SessionId;
use crate::pages;
use crate::session::SessionStore;
use crate::usage::{record_usage, CreateUsage, UsageLog};

/// Stored when the provider reported no security group.
pub const NO_SECURITY_GROUP: &str = "N/A";
const INVALID_CHOICE: &str =
    "Select a valid choice. That choice is not one of the available choices.";

// -----------------------------------------------------------------------------
// Models & DTOs
// -----------------------------------------------------------------------------

/// Raw launch form fields as submitted by the browser.
#[derive(Debug, Default, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LaunchForm {
    #[validate(length(min = 1, message = "This field is required."))]
    pub cloud: String,
    #[validate(length(min = 1, message = "This field is required."))]
    pub access_key: String,
    #[validate(length(min = 1, message = "This field is required."))]
    pub secret_key: String,
    #[validate(length(min = 1, message = "This field is required."))]
    pub cluster_name: String,
    #[validate(length(min = 1, message = "This field is required."))]
    pub instance_type: String,
    pub image_id: String,
    #[validate(length(min = 1, message = "This field is required."))]
    pub placement: String,
    #[validate(length(min = 1, message = "This field is required."))]
    pub password: String,
}

impl LaunchForm {
    /// Form for the first render, with the first catalog cloud selected.
    pub fn initial(clouds: &[Cloud]) -> Self {
        LaunchForm {
            cloud: clouds
                .first()
                .map(|cloud| cloud.id.to_string())
                .unwrap_or_default(),
            ..Default::default()
        }
    }

    pub fn trimmed(self) -> Self {
        LaunchForm {
            cloud: self.cloud.trim().to_string(),
            access_key: self.access_key.trim().to_string(),
            secret_key: self.secret_key.trim().to_string(),
            cluster_name: self.cluster_name.trim().to_string(),
            instance_type: self.instance_type.trim().to_string(),
            image_id: self.image_id.trim().to_string(),
            placement: self.placement.trim().to_string(),
            password: self.password,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct FormErrors {
    pub fields: BTreeMap<String, Vec<String>>,
    pub non_field: Vec<String>,
}

impl FormErrors {
    pub fn add(&mut self, field: &str, message: impl Into<String>) {
        self.fields
            .entry(field.to_string())
            .or_default()
            .push(message.into());
    }

    pub fn add_non_field(&mut self, message: impl Into<String>) {
        self.non_field.push(message.into());
    }

    pub fn field(&self, name: &str) -> &[String] {
        self.fields.get(name).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.non_field.is_empty()
    }
}

impl From<ValidationErrors> for FormErrors {
    fn from(errors: ValidationErrors) -> Self {
        let mut form_errors = FormErrors::default();
        for (field, field_errors) in errors.field_errors() {
            for error in field_errors {
                let message = error
                    .message
                    .as_ref()
                    .map(|message| message.to_string())
                    .unwrap_or_else(|| error.code.to_string());
                form_errors.add(field, message);
            }
        }
        form_errors
    }
}

/// A launch form that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchRequest {
    pub cloud: Cloud,
    pub credentials: Credentials,
    pub cluster_name: String,
    pub instance_type: String,
    /// Catalog id of an explicitly chosen image.
    pub image: Option<i32>,
    pub placement: String,
    pub password: String,
}

impl LaunchRequest {
    pub fn bootstrap_fields(&self) -> BootstrapFields<'_> {
        BootstrapFields {
            cloud: &self.cloud,
            cluster_name: &self.cluster_name,
            access_key: &self.credentials.access_key,
            secret_key: &self.credentials.secret_key,
            password: &self.password,
        }
    }
}

/// The launched instance, as tracked for the rest of the browser session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchRecord {
    pub cloud: Cloud,
    pub credentials: Credentials,
    pub cluster_name: String,
    pub instance_type: String,
    pub placement: String,
    pub password: String,
    pub image_id: String,
    pub instance_id: String,
    pub public_ip: Option<String>,
    pub kp_name: String,
    pub kp_material: Option<String>,
    pub sg_name: String,
}

impl LaunchRecord {
    pub fn new(request: &LaunchRequest, image_id: String, outcome: LaunchOutcome) -> Self {
        let sg_name = outcome
            .sg_names
            .into_iter()
            .next()
            .unwrap_or_else(|| NO_SECURITY_GROUP.to_string());

        LaunchRecord {
            cloud: request.cloud.clone(),
            credentials: request.credentials.clone(),
            cluster_name: request.cluster_name.clone(),
            instance_type: request.instance_type.clone(),
            placement: request.placement.clone(),
            password: request.password.clone(),
            image_id,
            instance_id: outcome.instance_id,
            public_ip: outcome.instance_ip,
            kp_name: outcome.kp_name,
            kp_material: outcome.kp_material,
            sg_name,
        }
    }

    pub fn bootstrap_fields(&self) -> BootstrapFields<'_> {
        BootstrapFields {
            cloud: &self.cloud,
            cluster_name: &self.cluster_name,
            access_key: &self.credentials.access_key,
            secret_key: &self.credentials.secret_key,
            password: &self.password,
        }
    }
}

#[derive(Debug)]
pub enum LaunchError {
    ImageResolution { cloud: String },
    Catalog(CatalogError),
    UserData(serde_yaml::Error),
    Provider { cloud: String, source: ProviderError },
}

impl fmt::Display for LaunchError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LaunchError::ImageResolution { cloud } => {
                write!(f, "Cannot find an image to launch for cloud {}", cloud)
            }
            LaunchError::Catalog(err) => write!(f, "Unable to read the cloud catalog: {}", err),
            LaunchError::UserData(err) => write!(f, "Unable to compose instance user data: {}", err),
            LaunchError::Provider { cloud, source } => write!(
                f,
                "A problem starting your instance. Check the {} cloud's console: {}",
                cloud, source
            ),
        }
    }
}

// -----------------------------------------------------------------------------
// Validation
// -----------------------------------------------------------------------------

/// Checks the submitted form against the catalog.
///
/// The default image is deliberately not resolved here; see [`run_instance`].
pub async fn validate_launch_form(
    form: &LaunchForm,
    catalog: &dyn Catalog,
) -> Result<LaunchRequest, FormErrors> {
    let mut errors = match form.validate() {
        Ok(()) => FormErrors::default(),
        Err(validation) => FormErrors::from(validation),
    };

    let cloud = if form.cloud.is_empty() {
        None
    } else {
        lookup_cloud(&form.cloud, catalog, &mut errors).await
    };

    let mut image = None;
    if let Some(cloud) = &cloud {
        if !form.instance_type.is_empty() {
            match catalog.instance_types(cloud.id).await {
                Ok(types) => {
                    if !types.iter().any(|it| it.tech_name == form.instance_type) {
                        errors.add("instance_type", INVALID_CHOICE);
                    }
                }
                Err(err) => catalog_failure(&mut errors, err),
            }
        }

        if !form.image_id.is_empty() {
            image = lookup_image(&form.image_id, cloud, catalog, &mut errors).await;
        }
    }

    match cloud {
        Some(cloud) if errors.is_empty() => Ok(LaunchRequest {
            cloud,
            credentials: Credentials::new(form.access_key.clone(), form.secret_key.clone()),
            cluster_name: form.cluster_name.clone(),
            instance_type: form.instance_type.clone(),
            image,
            placement: form.placement.clone(),
            password: form.password.clone(),
        }),
        _ => {
            if errors.is_empty() {
                errors.add("cloud", INVALID_CHOICE);
            }
            Err(errors)
        }
    }
}

async fn lookup_cloud(raw: &str, catalog: &dyn Catalog, errors: &mut FormErrors) -> Option<Cloud> {
    let id = match raw.parse::<i32>() {
        Ok(id) => id,
        Err(_) => {
            errors.add("cloud", INVALID_CHOICE);
            return None;
        }
    };

    match catalog.cloud(id).await {
        Ok(Some(cloud)) => Some(cloud),
        Ok(None) => {
            errors.add("cloud", INVALID_CHOICE);
            None
        }
        Err(err) => {
            catalog_failure(errors, err);
            None
        }
    }
}

async fn lookup_image(
    raw: &str,
    cloud: &Cloud,
    catalog: &dyn Catalog,
    errors: &mut FormErrors,
) -> Option<i32> {
    let id = match raw.parse::<i32>() {
        Ok(id) => id,
        Err(_) => {
            errors.add("image_id", INVALID_CHOICE);
            return None;
        }
    };

    match catalog.image(id).await {
        Ok(Some(image)) if image.cloud_id == cloud.id => Some(image.id),
        Ok(_) => {
            errors.add("image_id", INVALID_CHOICE);
            None
        }
        Err(err) => {
            catalog_failure(errors, err);
            None
        }
    }
}

fn catalog_failure(errors: &mut FormErrors, err: CatalogError) {
    log::error!("Catalog lookup failed while validating launch form: {}", err);
    errors.add_non_field(format!("Unable to read the cloud catalog: {}", err));
}

// -----------------------------------------------------------------------------
// Orchestration
// -----------------------------------------------------------------------------

/// Launches the instance described by `request`.
///
/// Image resolution failures return before any provider connection is made.
/// Every attempt that reaches the provider is followed by a best-effort
/// usage record.
pub async fn run_instance(
    request: &LaunchRequest,
    catalog: &dyn Catalog,
    launchers: &dyn LauncherFactory,
    usage_log: &dyn UsageLog,
) -> Result<LaunchRecord, LaunchError> {
    let image = resolve_image(request, catalog).await?;
    let user_data =
        compose_user_data(&request.bootstrap_fields()).map_err(LaunchError::UserData)?;

    let spec = LaunchSpec {
        cluster_name: request.cluster_name.clone(),
        image_id: image.image_id.clone(),
        instance_type: request.instance_type.clone(),
        password: request.password.clone(),
        kernel_id: image.kernel(),
        ramdisk_id: image.ramdisk(),
        placement: Some(request.placement.clone()).filter(|p| !p.is_empty()),
        user_data,
    };

    log::info!(
        "Launching {} ({}) on {} for cluster '{}'",
        spec.image_id,
        spec.instance_type,
        request.cloud.name,
        spec.cluster_name
    );
    let outcome = match launchers.connect(&request.credentials, &request.cloud) {
        Ok(launcher) => launcher.launch(&spec).await,
        Err(err) => Err(err),
    };

    record_usage(
        usage_log,
        CreateUsage {
            cloud_name: request.cloud.name.clone(),
            cloud_type: request.cloud.cloud_type.clone(),
            image_id: image.image_id.clone(),
            instance_type: request.instance_type.clone(),
            user_id: request.credentials.access_key.clone(),
        },
    )
    .await;

    match outcome {
        Ok(outcome) => Ok(LaunchRecord::new(request, image.image_id, outcome)),
        Err(source) => {
            log::error!("Launch on {} failed: {}", request.cloud.name, source);
            Err(LaunchError::Provider {
                cloud: request.cloud.name.clone(),
                source,
            })
        }
    }
}

async fn resolve_image(request: &LaunchRequest, catalog: &dyn Catalog) -> Result<Image, LaunchError> {
    let image = match request.image {
        Some(id) => catalog.image(id).await,
        None => catalog.default_image(request.cloud.id).await,
    }
    .map_err(LaunchError::Catalog)?;

    match image {
        Some(image) => Ok(image),
        None => {
            log::error!("Cannot find an image to launch for cloud {}", request.cloud.name);
            Err(LaunchError::ImageResolution {
                cloud: request.cloud.name.clone(),
            })
        }
    }
}

// -----------------------------------------------------------------------------
// Handlers
// -----------------------------------------------------------------------------

async fn render_form(catalog: &dyn Catalog, form: &LaunchForm, errors: &FormErrors) -> HttpResponse {
    let mut errors = errors.clone();
    let clouds = match catalog.clouds().await {
        Ok(clouds) => clouds,
        Err(err) => {
            log::error!("Failed to list clouds: {}", err);
            errors.add_non_field(format!("Unable to read the cloud catalog: {}", err));
            vec![]
        }
    };

    HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(pages::render_launch_form(&clouds, form, &errors))
}

async fn launch_form_handler(catalog: web::Data<dyn Catalog>) -> HttpResponse {
    let form = match catalog.clouds().await {
        Ok(clouds) => LaunchForm::initial(&clouds),
        Err(_) => LaunchForm::default(),
    };

    render_form(catalog.get_ref(), &form, &FormErrors::default()).await
}

async fn launch_submit_handler(
    session: SessionId,
    form: web::Form<LaunchForm>,
    catalog: web::Data<dyn Catalog>,
    usage_log: web::Data<dyn UsageLog>,
    launchers: web::Data<dyn LauncherFactory>,
    sessions: web::Data<SessionStore>,
) -> HttpResponse {
    let form = form.into_inner().trimmed();
    let request = match validate_launch_form(&form, catalog.get_ref()).await {
        Ok(request) => request,
        Err(errors) => return render_form(catalog.get_ref(), &form, &errors).await,
    };

    match run_instance(
        &request,
        catalog.get_ref(),
        launchers.get_ref(),
        usage_log.get_ref(),
    )
    .await
    {
        Ok(record) => {
            sessions.set_current(&session, record);
            let mut response = HttpResponse::Found();
            response.insert_header((header::LOCATION, "/monitor"));
            if session.is_fresh() {
                response.cookie(session.cookie());
            }
            response.finish()
        }
        Err(err) => {
            sessions.clear(&session);
            let mut errors = FormErrors::default();
            errors.add_non_field(err.to_string());
            render_form(catalog.get_ref(), &form, &errors).await
        }
    }
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::resource("/launch")
            .route(web::get().to(launch_form_handler))
            .route(web::post().to(launch_submit_handler)),
    );
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
