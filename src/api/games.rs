#![forbid(unsafe_code)]

use poem::Request;
use poem_openapi::{OpenApi, param::Query, payload::PlainText};

use crate::utils::server_utils::{self, RequestDebug};

// ***************************************************************************
//                                Constants
// ***************************************************************************
// Used when the caller does not supply a name.
pub const DEFAULT_NAME: &str = "Human";
const GREETING_PREFIX: &str = "Hello, ";

// ***************************************************************************
//                          Request/Response Definiions
// ***************************************************************************
pub struct GamesApi;

// A present but empty name stays Some("").
#[derive(Debug, Default)]
pub struct ReqGames
{
    name: Option<String>,
}

// Implement the debug record trait for logging.
impl RequestDebug for ReqGames {
    fn get_request_info(&self) -> String {
        let mut s = String::with_capacity(64);
        s.push_str("  Request query:");
        s.push_str("\n    name: ");
        match &self.name {
            Some(n) => s.push_str(&format!("{:?}", n)),
            None => s.push_str("<absent>"),
        }
        s
    }
}

// ***************************************************************************
//                             OpenAPI Endpoint
// ***************************************************************************
#[OpenApi]
impl GamesApi {
    /// Greet the caller by the optional `name` query parameter.
    #[oai(path = "/games", method = "get")]
    async fn get_games(&self, http_req: &Request, name: Query<Option<String>>) -> PlainText<String> {
        let req = ReqGames { name: name.0 };
        server_utils::debug_request(http_req, &req);
        PlainText(greeting(req.name.as_deref()))
    }
}

// ***************************************************************************
//                             Public Functions
// ***************************************************************************
// ---------------------------------------------------------------------------
// greeting:
// ---------------------------------------------------------------------------
/** Build the greeting for a name.  An absent name becomes "Human"; any
 * supplied value, including the empty string, is used as-is.
 */
pub fn greeting(name: Option<&str>) -> String {
    let mut s = String::from(GREETING_PREFIX);
    s.push_str(name.unwrap_or(DEFAULT_NAME));
    s
}
