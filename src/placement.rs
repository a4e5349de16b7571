use actix_web::{web, HttpRequest, HttpResponse, Responder};
use serde::{Deserialize, Serialize};

use crate::catalog::Catalog;
use crate::cloud_provider::{Credentials, LauncherFactory, ProviderError};
use crate::middleware::is_ajax;

pub const CREDENTIALS_MISSING: &str = "Please specify access and secret keys";
pub const CREDENTIALS_REJECTED: &str = "Access and secret keys not accepted";
const SIGNATURE_MISMATCH: &str = "The request signature we calculated does not match";

// -----------------------------------------------------------------------------
// Models & DTOs
// -----------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PlacementQuery {
    pub cloud_id: String,
    pub a_key: String,
    pub s_key: String,
    pub instance_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacementResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub placements: Vec<String>,
}

impl PlacementResponse {
    pub fn found(placements: Vec<String>) -> Self {
        PlacementResponse {
            error: None,
            placements,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        PlacementResponse {
            error: Some(message.into()),
            placements: vec![],
        }
    }
}

// -----------------------------------------------------------------------------
// Functions
// -----------------------------------------------------------------------------

/// Human-readable text for a provider failure during placement lookup.
pub fn describe_provider_error(err: &ProviderError) -> String {
    match err {
        ProviderError::Api { message, .. } if message.starts_with(SIGNATURE_MISMATCH) => {
            CREDENTIALS_REJECTED.to_string()
        }
        _ => err.message().to_string(),
    }
}

/// Looks up the zones an instance type can be placed in. Every outcome,
/// failures included, is returned as a [`PlacementResponse`].
pub async fn find_placements(
    query: &PlacementQuery,
    catalog: &dyn Catalog,
    launchers: &dyn LauncherFactory,
) -> PlacementResponse {
    let cloud_id = query.cloud_id.trim();
    let access_key = query.a_key.trim();
    let secret_key = query.s_key.trim();
    if cloud_id.is_empty() || access_key.is_empty() || secret_key.is_empty() {
        return PlacementResponse::error(CREDENTIALS_MISSING);
    }

    let cloud = match cloud_id.parse::<i32>() {
        Ok(id) => catalog.cloud(id).await,
        Err(_) => Ok(None),
    };
    let cloud = match cloud {
        Ok(Some(cloud)) => cloud,
        Ok(None) => return PlacementResponse::error(format!("Unknown cloud '{}'", cloud_id)),
        Err(err) => {
            log::error!("Problem retrieving availability zones: {}", err);
            return PlacementResponse::error(err.to_string());
        }
    };

    log::debug!(
        "Getting placement for {} on {} cloud",
        query.instance_type,
        cloud.name
    );
    let credentials = Credentials::new(access_key, secret_key);
    let placements = match launchers.connect(&credentials, &cloud) {
        Ok(launcher) => launcher.placements(query.instance_type.trim()).await,
        Err(err) => Err(err),
    };

    match placements {
        Ok(placements) => PlacementResponse::found(placements),
        Err(err) => {
            log::error!("Problem retrieving availability zones: {}", err);
            PlacementResponse::error(describe_provider_error(&err))
        }
    }
}

// -----------------------------------------------------------------------------
// Handlers
// -----------------------------------------------------------------------------

async fn placements_handler(
    req: HttpRequest,
    query: Option<web::Form<PlacementQuery>>,
    catalog: web::Data<dyn Catalog>,
    launchers: web::Data<dyn LauncherFactory>,
) -> impl Responder {
    if !is_ajax(&req) {
        log::error!("No XHR");
        return HttpResponse::Ok().json(PlacementResponse::error(CREDENTIALS_MISSING));
    }

    // a missing or unparsable body reads as all fields blank
    let query = query.map(web::Form::into_inner).unwrap_or_default();
    HttpResponse::Ok().json(find_placements(&query, catalog.get_ref(), launchers.get_ref()).await)
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/placements").route(web::post().to(placements_handler)));
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::TestUtils;
    use actix_web::{test as actix_test, App};
    use serde_json::json;

    fn query(a_key: &str) -> PlacementQuery {
        PlacementQuery {
            cloud_id: "1".to_string(),
            a_key: a_key.to_string(),
            s_key: "secret".to_string(),
            instance_type: "m1.large".to_string(),
        }
    }

    #[tokio::test]
    async fn test_missing_credentials_never_connects() {
        let test_utils = TestUtils::new();

        let response = find_placements(&query(""), &test_utils.catalog, &test_utils.cloud).await;

        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({"error": "Please specify access and secret keys", "placements": []})
        );
        assert_eq!(test_utils.cloud.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_found_placements() {
        let test_utils = TestUtils::new();

        let response =
            find_placements(&query("AKIDEXAMPLE"), &test_utils.catalog, &test_utils.cloud).await;

        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({"placements": ["us-east-1a", "us-east-1b"]})
        );
    }

    #[tokio::test]
    async fn test_signature_mismatch_is_rewritten() {
        let test_utils = TestUtils::new();
        test_utils.cloud.set_placements_result(Err(ProviderError::Api {
            code: "SignatureDoesNotMatch".to_string(),
            message: "The request signature we calculated does not match the signature you provided."
                .to_string(),
        }));

        let response =
            find_placements(&query("AKIDEXAMPLE"), &test_utils.catalog, &test_utils.cloud).await;

        assert_eq!(response.error.as_deref(), Some("Access and secret keys not accepted"));
        assert!(response.placements.is_empty());
    }

    #[tokio::test]
    async fn test_other_provider_errors() {
        let test_utils = TestUtils::new();
        test_utils.cloud.set_placements_result(Err(ProviderError::Api {
            code: "AuthFailure".to_string(),
            message: "AWS was not able to validate the provided access credentials".to_string(),
        }));
        let response =
            find_placements(&query("AKIDEXAMPLE"), &test_utils.catalog, &test_utils.cloud).await;
        assert_eq!(
            response.error.as_deref(),
            Some("AWS was not able to validate the provided access credentials")
        );

        test_utils
            .cloud
            .set_placements_result(Err(ProviderError::Transport("dns error".to_string())));
        let response =
            find_placements(&query("AKIDEXAMPLE"), &test_utils.catalog, &test_utils.cloud).await;
        assert_eq!(response, PlacementResponse::error("dns error"));
    }

    #[tokio::test]
    async fn test_unknown_cloud() {
        let test_utils = TestUtils::new();
        let mut unknown = query("AKIDEXAMPLE");
        unknown.cloud_id = "99".to_string();

        let response = find_placements(&unknown, &test_utils.catalog, &test_utils.cloud).await;

        assert_eq!(response, PlacementResponse::error("Unknown cloud '99'"));
        assert_eq!(test_utils.cloud.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_placements_handler() {
        let test_utils = TestUtils::new();
        let app = actix_test::init_service(
            App::new()
                .configure(|cfg| test_utils.configure_app_data(cfg))
                .configure(configure_routes),
        )
        .await;

        let req = actix_test::TestRequest::post()
            .uri("/placements")
            .insert_header(("X-Requested-With", "XMLHttpRequest"))
            .set_form(&[
                ("cloud_id", "1"),
                ("a_key", "AKIDEXAMPLE"),
                ("s_key", "secret"),
                ("instance_type", "m1.large"),
            ])
            .to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), 200);

        let body: serde_json::Value = actix_test::read_body_json(resp).await;
        assert_eq!(body, json!({"placements": ["us-east-1a", "us-east-1b"]}));
    }

    #[tokio::test]
    async fn test_placements_handler_without_xhr() {
        let test_utils = TestUtils::new();
        let app = actix_test::init_service(
            App::new()
                .configure(|cfg| test_utils.configure_app_data(cfg))
                .configure(configure_routes),
        )
        .await;

        let req = actix_test::TestRequest::post()
            .uri("/placements")
            .set_form(&[
                ("cloud_id", "1"),
                ("a_key", "AKIDEXAMPLE"),
                ("s_key", "secret"),
                ("instance_type", "m1.large"),
            ])
            .to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), 200);

        let body: serde_json::Value = actix_test::read_body_json(resp).await;
        assert_eq!(
            body,
            json!({"error": "Please specify access and secret keys", "placements": []})
        );
        assert_eq!(test_utils.cloud.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_placements_handler_without_body() {
        let test_utils = TestUtils::new();
        let app = actix_test::init_service(
            App::new()
                .configure(|cfg| test_utils.configure_app_data(cfg))
                .configure(configure_routes),
        )
        .await;

        let req = actix_test::TestRequest::post()
            .uri("/placements")
            .insert_header(("X-Requested-With", "XMLHttpRequest"))
            .to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), 200);

        let body: serde_json::Value = actix_test::read_body_json(resp).await;
        assert_eq!(
            body,
            json!({"error": "Please specify access and secret keys", "placements": []})
        );
        assert_eq!(test_utils.cloud.connect_count(), 0);
    }
}
