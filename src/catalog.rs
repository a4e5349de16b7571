use actix_web::{web, HttpRequest, HttpResponse, Responder};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use sqlx::Error as SqlxError;
use sqlx::FromRow;
use std::fmt;

use crate::middleware::is_ajax;
use crate::util::ErrorResponse;

// -----------------------------------------------------------------------------
// Models & DTOs
// -----------------------------------------------------------------------------

#[derive(Debug)]
pub enum CatalogError {
    SqlxError(SqlxError),
}

impl From<SqlxError> for CatalogError {
    fn from(err: SqlxError) -> Self {
        CatalogError::SqlxError(err)
    }
}

impl fmt::Display for CatalogError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CatalogError::SqlxError(err) => err.fmt(f),
        }
    }
}

/// A provider endpoint users may launch into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Cloud {
    pub id: i32,
    pub name: String,
    pub cloud_type: String,
    pub bucket_default: String,
    pub region_name: String,
    pub region_endpoint: String,
    pub ec2_port: Option<i32>,
    pub ec2_conn_path: String,
    pub cidr_range: String,
    pub is_secure: bool,
    pub s3_host: String,
    pub s3_port: Option<i32>,
    pub s3_conn_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Image {
    pub id: i32,
    pub cloud_id: i32,
    pub image_id: String,
    pub description: String,
    pub is_default: bool,
    pub kernel_id: Option<String>,
    pub ramdisk_id: Option<String>,
}

impl Image {
    /// Kernel to boot with, `None` meaning the provider default.
    pub fn kernel(&self) -> Option<String> {
        self.kernel_id.clone().filter(|id| !id.is_empty())
    }

    pub fn ramdisk(&self) -> Option<String> {
        self.ramdisk_id.clone().filter(|id| !id.is_empty())
    }

    pub fn label(&self) -> String {
        format!(
            "{} ({}){}",
            self.image_id,
            self.description,
            if self.is_default { "*" } else { "" }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct InstanceType {
    pub id: i32,
    pub cloud_id: i32,
    pub tech_name: String,
    pub pretty_name: String,
    pub description: String,
}

impl InstanceType {
    pub fn label(&self) -> String {
        format!("{} ({})", self.pretty_name, self.description)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DynamicFieldsQuery {
    pub cloud_id: String,
}

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DynamicFields {
    pub instance_types: Vec<(String, String)>,
    pub image_ids: Vec<(i32, String)>,
}

// -----------------------------------------------------------------------------
// Repository
// -----------------------------------------------------------------------------

/// Read-only view of the cloud catalog.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// All clouds, in catalog order.
    async fn clouds(&self) -> Result<Vec<Cloud>, CatalogError>;
    async fn cloud(&self, id: i32) -> Result<Option<Cloud>, CatalogError>;
    async fn images(&self, cloud_id: i32) -> Result<Vec<Image>, CatalogError>;
    async fn image(&self, id: i32) -> Result<Option<Image>, CatalogError>;
    async fn default_image(&self, cloud_id: i32) -> Result<Option<Image>, CatalogError>;
    async fn instance_types(&self, cloud_id: i32) -> Result<Vec<InstanceType>, CatalogError>;
}

#[derive(Clone)]
pub struct CatalogRepository {
    pub pool: PgPool,
}

impl CatalogRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Catalog for CatalogRepository {
    async fn clouds(&self) -> Result<Vec<Cloud>, CatalogError> {
        let clouds = sqlx::query_as::<_, Cloud>("SELECT * FROM clouds ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        Ok(clouds)
    }

    async fn cloud(&self, id: i32) -> Result<Option<Cloud>, CatalogError> {
        let cloud = sqlx::query_as::<_, Cloud>("SELECT * FROM clouds WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(cloud)
    }

    async fn images(&self, cloud_id: i32) -> Result<Vec<Image>, CatalogError> {
        let images =
            sqlx::query_as::<_, Image>("SELECT * FROM images WHERE cloud_id = $1 ORDER BY id")
                .bind(cloud_id)
                .fetch_all(&self.pool)
                .await?;

        Ok(images)
    }

    async fn image(&self, id: i32) -> Result<Option<Image>, CatalogError> {
        let image = sqlx::query_as::<_, Image>("SELECT * FROM images WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(image)
    }

    async fn default_image(&self, cloud_id: i32) -> Result<Option<Image>, CatalogError> {
        let image = sqlx::query_as::<_, Image>(
            "SELECT * FROM images WHERE cloud_id = $1 AND is_default ORDER BY id LIMIT 1",
        )
        .bind(cloud_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(image)
    }

    async fn instance_types(&self, cloud_id: i32) -> Result<Vec<InstanceType>, CatalogError> {
        let instance_types = sqlx::query_as::<_, InstanceType>(
            "SELECT * FROM instance_types WHERE cloud_id = $1 ORDER BY id",
        )
        .bind(cloud_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(instance_types)
    }
}

// -----------------------------------------------------------------------------
// Functions
// -----------------------------------------------------------------------------

/// Instance type and image choices for the launch form's cloud selection.
pub async fn dynamic_fields(
    catalog: &dyn Catalog,
    cloud_id: &str,
) -> Result<DynamicFields, CatalogError> {
    let cloud_id = match cloud_id.trim().parse::<i32>() {
        Ok(id) => id,
        Err(_) => return Ok(DynamicFields::default()),
    };

    let instance_types = catalog
        .instance_types(cloud_id)
        .await?
        .into_iter()
        .map(|it| {
            let label = it.label();
            (it.tech_name, label)
        })
        .collect();

    let image_ids = catalog
        .images(cloud_id)
        .await?
        .into_iter()
        .map(|image| (image.id, image.label()))
        .collect();

    Ok(DynamicFields {
        instance_types,
        image_ids,
    })
}

// -----------------------------------------------------------------------------
// Handlers
// -----------------------------------------------------------------------------

async fn dynamic_fields_handler(
    req: HttpRequest,
    catalog: web::Data<dyn Catalog>,
    query: Option<web::Form<DynamicFieldsQuery>>,
) -> impl Responder {
    if !is_ajax(&req) {
        log::error!("No XHR");
        return HttpResponse::BadRequest().json(ErrorResponse::new("Expected an XHR request".to_string()));
    }

    let query = query.map(web::Form::into_inner).unwrap_or_default();

    match dynamic_fields(catalog.get_ref(), &query.cloud_id).await {
        Ok(fields) => HttpResponse::Ok().json(fields),
        Err(err) => {
            log::error!("Failed to read catalog for cloud {}: {}", query.cloud_id, err);
            HttpResponse::InternalServerError().json(ErrorResponse::new(err.to_string()))
        }
    }
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/dynamic-fields").route(web::post().to(dynamic_fields_handler)));
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
