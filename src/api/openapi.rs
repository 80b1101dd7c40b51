use crate::api::handlers::{auth, health};
use utoipa::openapi::{InfoBuilder, OpenApiBuilder, Tag};
use utoipa_axum::{router::OpenApiRouter, routes};

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    // Reuse the same router wiring and only return the generated OpenAPI spec.
    let (_router, openapi) = api_router().split_for_parts();
    openapi
}

/// Build the router that also drives the `OpenAPI` document.
///
/// Add new endpoints here via `.routes(routes!(...))` so they are both served
/// and included in the generated `OpenAPI` spec. Routes added outside (like
/// the `/` banner) are intentionally not documented.
pub(crate) fn api_router() -> OpenApiRouter {
    // `routes!` reads #[utoipa::path] to bind HTTP method + path and add the route to OpenAPI.
    let mut router = OpenApiRouter::with_openapi(cargo_openapi())
        .routes(routes!(health::health))
        .routes(routes!(auth::register::register))
        .routes(routes!(auth::login::login))
        .routes(routes!(auth::login::logout))
        .routes(routes!(auth::login::session))
        .routes(routes!(auth::password::forgot_password))
        .routes(routes!(auth::password::reset_password))
        .routes(routes!(auth::password::change_password))
        .routes(routes!(auth::verification::verify_email))
        .routes(routes!(auth::verification::resend_verification));

    let mut auth_tag = Tag::new("auth");
    auth_tag.description =
        Some("Registration, login, password reset, and email verification".to_string());
    let mut health_tag = Tag::new("health");
    health_tag.description = Some("Service and database health".to_string());
    router.get_openapi_mut().tags = Some(vec![auth_tag, health_tag]);

    router
}

fn cargo_openapi() -> utoipa::openapi::OpenApi {
    // Use Cargo.toml metadata instead of the utoipa-axum crate info defaults.
    let description = env!("CARGO_PKG_DESCRIPTION").trim();
    let info = InfoBuilder::new()
        .title(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .description(if description.is_empty() {
            None
        } else {
            Some(description)
        })
        .build();

    OpenApiBuilder::new().info(info).build()
}

#[cfg(test)]
mod tests {
    use super::openapi;

    #[test]
    fn openapi_includes_auth_routes() {
        let spec = openapi();
        let paths = &spec.paths.paths;
        assert!(paths.contains_key("/health"));
        assert!(paths.contains_key("/v1/auth/register"));
        assert!(paths.contains_key("/v1/auth/login"));
        assert!(paths.contains_key("/v1/auth/logout"));
        assert!(paths.contains_key("/v1/auth/session"));
        assert!(paths.contains_key("/v1/auth/forgot-password"));
        assert!(paths.contains_key("/v1/auth/reset-password"));
        assert!(paths.contains_key("/v1/auth/change-password"));
        assert!(paths.contains_key("/v1/auth/verify-email"));
        assert!(paths.contains_key("/v1/auth/resend-verification"));
    }

    #[test]
    fn openapi_info_comes_from_cargo() {
        let spec = openapi();
        assert_eq!(spec.info.title, env!("CARGO_PKG_NAME"));
        assert_eq!(spec.info.version, env!("CARGO_PKG_VERSION"));
    }
}
