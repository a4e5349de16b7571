use actix_cors::Cors;
use actix_web::middleware::Logger;
use actix_web::{web::Data, App, HttpServer};
use anyhow::Context;
use sqlx::postgres::PgPool;
use std::sync::Arc;

mod catalog;
mod cloud_provider;
mod config;
mod instance;
mod launch;
mod middleware;
mod pages;
mod placement;
mod session;
mod usage;
mod util;

use catalog::{Catalog, CatalogRepository};
use cloud_provider::{Ec2LauncherFactory, LauncherFactory};
use usage::{UsageLog, UsageRepository};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let config = config::Config::from_env()?;
    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "info,actix_web=debug");
    }
    env_logger::init();

    let pool = PgPool::connect(&config.database_url)
        .await
        .context("Failed to create PostgreSQL pool.")?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run database migrations.")?;

    let catalog: Arc<dyn Catalog> = Arc::new(CatalogRepository::new(pool.clone()));
    let usage_log: Arc<dyn UsageLog> = Arc::new(UsageRepository::new(pool.clone()));
    let launchers: Arc<dyn LauncherFactory> = Arc::new(Ec2LauncherFactory::new(&config));
    let sessions = session::SessionStore::new();

    let bind_address = config.bind_address.clone();
    log::info!("Listening on {}", bind_address);

    HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .wrap(Cors::permissive())
            .app_data(Data::from(catalog.clone()))
            .app_data(Data::from(usage_log.clone()))
            .app_data(Data::from(launchers.clone()))
            .app_data(Data::new(sessions.clone()))
            .app_data(Data::new(config.clone()))
            .configure(pages::configure_routes)
            .configure(launch::configure_routes)
            .configure(catalog::configure_routes)
            .configure(placement::configure_routes)
            .configure(instance::configure_routes)
    })
    .bind(&bind_address)?
    .run()
    .await?;

    Ok(())
}
