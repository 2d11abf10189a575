//! Route table. Paths are contractual; see the handler docs for bodies.

use actix_web::web;

use super::handlers::{admin, applications, auth, flow, health, oauth2, users};

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/health")
            .route("/liveness", web::get().to(health::liveness))
            .route("/readiness", web::get().to(health::readiness)),
    )
    .service(web::scope("/flow").route("/execute", web::post().to(flow::execute)))
    .service(
        web::scope("/auth")
            .route(
                "/credentials/authenticate",
                web::post().to(auth::credentials_authenticate),
            )
            .route("/otp/sms/send", web::post().to(auth::otp_sms_send))
            .route("/otp/sms/verify", web::post().to(auth::otp_sms_verify))
            .route("/oauth/{provider}/start", web::post().to(auth::federation_start))
            .route("/oauth/{provider}/finish", web::post().to(auth::federation_finish)),
    )
    .service(
        web::scope("/oauth2")
            .route("/token", web::post().to(oauth2::token))
            .route("/authorize", web::get().to(oauth2::authorize))
            .route("/userinfo", web::get().to(oauth2::userinfo))
            .route("/introspect", web::post().to(oauth2::introspect)),
    )
    .service(
        web::scope("/users")
            .route("", web::post().to(users::create))
            .route("/{id}", web::get().to(users::get))
            .route("/{id}", web::put().to(users::update))
            .route("/{id}", web::delete().to(users::delete)),
    )
    .service(
        web::scope("/applications")
            .route("", web::post().to(applications::create))
            .route("", web::get().to(applications::list))
            .route("/{id}", web::get().to(applications::get))
            .route("/{id}", web::put().to(applications::update))
            .route("/{id}", web::delete().to(applications::delete)),
    )
    .service(
        web::scope("/admin/mcp")
            .route("/tools", web::get().to(admin::list_tools))
            .route("/tools/{name}", web::post().to(admin::call_tool)),
    );
}
