#![forbid(unsafe_code)]

use anyhow::Result;
use log::{info, error};
use poem::listener::{Listener, RustlsCertificate, RustlsConfig};
use poem::{listener::TcpListener, Route};
use poem_openapi::OpenApiService;

// Server Utilities
use crate::api::games::GamesApi;
use crate::utils::config::{init_log, init_runtime_context, init_server_dirs, Config, RuntimeCtx, SERVER_ARGS};
use crate::utils::errors::Errors;

// Modules
mod api;
mod utils;

// ***************************************************************************
//                                Constants
// ***************************************************************************
const SERVER_NAME : &str = "MasterServer"; // for poem logging
pub const API_PREFIX : &str = "/api";

// ---------------------------------------------------------------------------
// main:
// ---------------------------------------------------------------------------
#[tokio::main]
async fn main() -> Result<()> {
    // --------------- Initialize Server --------------
    // Announce ourselves.
    println!("Starting master_server!");

    // Create or validate the data directories first; logging depends on them.
    let server_dirs = init_server_dirs(&SERVER_ARGS)?;
    if SERVER_ARGS.create_dirs_only {
        println!("Data directories are in place under {}.", server_dirs.root_dir);
        return Ok(());
    }

    // Initialize the server.
    let runtime_ctx = server_init(server_dirs)?;
    let config = &runtime_ctx.parms.config;

    // --------------- Main Loop Set Up ---------------
    let app = build_app(config);
    let addr = config.bind_addr();
    info!("{} listening on {} (tls={}).", config.title, addr, config.enable_tls);

    // ------------------ Main Loop -------------------
    let result = if config.enable_tls {
        let dirs = &runtime_ctx.server_dirs;
        let key = std::fs::read(dirs.tls_key_file()).map_err(Errors::IOError)?;
        let cert = std::fs::read(dirs.tls_cert_file()).map_err(Errors::IOError)?;
        poem::Server::new(
            TcpListener::bind(addr).rustls(
                RustlsConfig::new().fallback(RustlsCertificate::new().key(key).cert(cert)),
            ),
        )
        .name(SERVER_NAME)
        .run(app)
        .await
    } else {
        poem::Server::new(TcpListener::bind(addr))
            .name(SERVER_NAME)
            .run(app)
            .await
    };

    if let Err(e) = result {
        let msg = Errors::ServerError(e.to_string());
        error!("{}", msg);
        return Err(msg.into());
    }
    Ok(())
}

// ***************************************************************************
//                             Public Functions
// ***************************************************************************
// ---------------------------------------------------------------------------
// build_app:
// ---------------------------------------------------------------------------
/** Assemble the route tree.  The api is always nested under /api; the
 * generated documentation endpoints are only mounted when swagger is enabled.
 */
pub fn build_app(config: &Config) -> Route {
    let api_service =
        OpenApiService::new(GamesApi, config.title.as_str(), env!("CARGO_PKG_VERSION"))
            .server(config.api_url());

    let mut app = Route::new();
    if config.enable_swagger {
        // Allow the generated openapi specs to be retrieved from the server.
        let spec = api_service.spec_endpoint();
        let spec_yaml = api_service.spec_endpoint_yaml();
        let ui = api_service.swagger_ui();
        app = app
            .nest("/", ui)
            .at("/spec", spec)
            .at("/spec_yaml", spec_yaml);
    }

    app.nest(API_PREFIX, api_service)
}

// ***************************************************************************
//                             Private Functions
// ***************************************************************************
// ---------------------------------------------------------------------------
// server_init:
// ---------------------------------------------------------------------------
/** Initialize logging and read the configuration. */
fn server_init(server_dirs: utils::config::ServerDirs) -> Result<RuntimeCtx> {
    // Configure our log.
    init_log(&server_dirs)?;

    // Read the configuration file and log what we're running with.
    let runtime_ctx = init_runtime_context(server_dirs)?;
    info!("{}", Errors::InputParms(format!("{:#?}", runtime_ctx)));

    // Log build info.
    print_version_info();
    Ok(runtime_ctx)
}

// ---------------------------------------------------------------------------
// print_version_info:
// ---------------------------------------------------------------------------
fn print_version_info() {
    info!("\n*** Running MASTER_SERVER={}, BRANCH={}, COMMIT={}, DIRTY={}, SRC_TS={}, RUSTC={}.",
          env!("CARGO_PKG_VERSION"),
          env!("GIT_BRANCH"),
          env!("GIT_COMMIT_SHORT"),
          env!("GIT_DIRTY"),
          env!("SOURCE_TIMESTAMP"),
          env!("RUSTC_VERSION"),
    );
}

// ***************************************************************************
//                                  Tests
// ***************************************************************************
#[cfg(test)]
mod tests {
    use super::*;
    use poem::http::StatusCode;
    use poem::test::TestClient;

    #[tokio::test]
    async fn games_end_to_end() {
        let cli = TestClient::new(build_app(&Config::new()));

        let resp = cli.get("/api/games").send().await;
        resp.assert_status_is_ok();
        resp.assert_text("Hello, Human").await;

        let resp = cli.get("/api/games?name=World").send().await;
        resp.assert_status_is_ok();
        resp.assert_text("Hello, World").await;
    }

    #[tokio::test]
    async fn spec_lists_games() {
        let config = Config::new();
        let cli = TestClient::new(build_app(&config));

        let resp = cli.get("/spec").send().await;
        resp.assert_status_is_ok();
        let body = resp.0.into_body().into_string().await.unwrap();
        let doc: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert!(doc["paths"]["/games"]["get"].is_object());
        let param = &doc["paths"]["/games"]["get"]["parameters"][0];
        assert_eq!(param["name"], "name");
        assert_eq!(param["in"], "query");
        assert_eq!(doc["servers"][0]["url"], config.api_url());
        assert_eq!(doc["info"]["title"], "Master Server");
    }

    #[tokio::test]
    async fn swagger_can_be_disabled() {
        let config = Config { enable_swagger: false, ..Config::new() };
        let cli = TestClient::new(build_app(&config));

        cli.get("/spec").send().await.assert_status(StatusCode::NOT_FOUND);
        cli.get("/spec_yaml").send().await.assert_status(StatusCode::NOT_FOUND);

        let resp = cli.get("/api/games").send().await;
        resp.assert_status_is_ok();
        resp.assert_text("Hello, Human").await;
    }

    #[tokio::test]
    async fn unknown_route_is_not_found() {
        let cli = TestClient::new(build_app(&Config::new()));
        cli.get("/api/players").send().await.assert_status(StatusCode::NOT_FOUND);
    }
}
