use std::net::ToSocketAddrs;

use actix_web::{App, HttpRequest, HttpResponse, HttpServer, Responder, get, middleware, web::Data};

use crate::{
    Error, Result,
    controller::{ProvisionController, State},
};

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/")]
async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

/// Run the controller next to a health and diagnostics endpoint until SIGINT/SIGTERM
pub async fn run(controller: ProvisionController, state: State, addr: impl ToSocketAddrs) -> Result<()> {
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(index)
            .service(health)
    })
    .bind(addr)
    .map_err(Error::IoError)?
    .shutdown_timeout(5);

    // both handle SIGTERM themselves, so poll until both are done
    let (ctrl_result, server_result) = tokio::join!(controller.run_until_signal(), server.run());
    ctrl_result?;
    server_result.map_err(Error::IoError)
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{body::to_bytes, test};

    #[actix_web::test]
    async fn health_reports_healthy() {
        let app = test::init_service(App::new().service(health)).await;
        let req = test::TestRequest::get().uri("/health").to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
        let body = to_bytes(resp.into_body()).await.unwrap();
        assert_eq!(body, "\"healthy\"");
    }

    #[actix_web::test]
    async fn index_serves_diagnostics() {
        let app = test::init_service(
            App::new()
                .app_data(Data::new(State::default()))
                .service(index),
        )
        .await;
        let req = test::TestRequest::get().uri("/").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["syncs_succeeded"], 0);
        assert_eq!(body["object_buckets"], 0);
        assert!(body["last_event"].is_string());
    }
}
