use actix_web::{dev::Server, get, middleware, web, App, HttpResponse, HttpServer, Responder};
use std::sync::Arc;
use tracing::info;

use crate::engine::Engine;

#[get("/")]
async fn index() -> impl Responder {
    HttpResponse::Ok().body("OK")
}

#[get("/health")]
async fn health(engine: web::Data<Engine>) -> impl Responder {
    web::Json(engine.health().await)
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(index).service(health);
}

/// Keep-alive server for hosts that put idle services to sleep. Signals are
/// left to the caller, who stops the server through its handle.
pub fn serve(engine: Arc<Engine>, bind: &str) -> std::io::Result<Server> {
    let data = web::Data::from(engine);
    info!("🌐 health endpoint listening on {}", bind);
    Ok(HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .wrap(middleware::Logger::default())
            .configure(configure)
    })
    .bind(bind)?
    .workers(1)
    .disable_signals()
    .run())
}
