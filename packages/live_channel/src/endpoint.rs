//! Target host and the URLs derived from it.

use percent_encoding::utf8_percent_encode;

use crate::message::COMPONENT;

/// Protocol version sent as the `vsn` query parameter.
pub const PROTOCOL_VSN: &str = "2.0.0";

/// Path of the LiveView socket on the target host.
pub const SOCKET_PATH: &str = "/live/websocket";

/// The application under load, e.g. `localhost:4000` over plain HTTP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub secure: bool,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, secure: bool) -> Self {
        Self {
            host: host.into(),
            secure,
        }
    }

    /// Root URL the bootstrap document is fetched from. Also the `url`
    /// reported in the join payload.
    pub fn http_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{scheme}://{}", self.host)
    }

    /// Value of the `Origin` header on the socket handshake.
    pub fn origin(&self) -> String {
        self.http_url()
    }

    pub fn socket_url(&self, csrf_token: &str) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!(
            "{scheme}://{}{SOCKET_PATH}?_csrf_token={}&vsn={PROTOCOL_VSN}",
            self.host,
            utf8_percent_encode(csrf_token, COMPONENT)
        )
    }
}
