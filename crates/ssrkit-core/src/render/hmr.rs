//! Hot reload hooks injected into rendered pages.

use serde::Serialize;

/// Path of the reload websocket.
pub const HMR_PATH: &str = "/__hmr";

/// Path the client runtime is served from.
pub const HMR_CLIENT_PATH: &str = "/@hmr-client";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HmrOptions {
    /// Port the dev server listens on.
    pub port: u16,
}

impl HmrOptions {
    /// Markup inserted before `</head>`.
    #[must_use]
    pub fn head_scripts(&self) -> String {
        format!(
            "<script>window.HMR_WEBSOCKET_URL = `ws://${{location.hostname}}:{port}{HMR_PATH}`;</script>\n\
             <script type=\"module\" src=\"{HMR_CLIENT_PATH}\"></script>\n",
            port = self.port
        )
    }
}

/// Message sent to connected browsers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HmrMessage {
    Connected,
    /// Full page reload after modules were invalidated.
    Reload { urls: Vec<String> },
    Error { message: String },
}

impl HmrMessage {
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"reload","urls":[]}"#.to_string())
    }
}

/// The browser side of hot reload.
pub const HMR_CLIENT_RUNTIME: &str = r"
// ssrkit reload client
const url = window.HMR_WEBSOCKET_URL || `ws://${location.host}/__hmr`;
let isConnected = false;

function connect() {
  const ws = new WebSocket(url);

  ws.onopen = () => {
    isConnected = true;
  };

  ws.onmessage = (event) => {
    const msg = JSON.parse(event.data);
    switch (msg.type) {
      case 'connected':
        console.log('[ssrkit] connected.');
        break;
      case 'reload':
        location.reload();
        break;
      case 'error':
        console.error('[ssrkit] ' + msg.message);
        break;
    }
  };

  ws.onclose = () => {
    if (isConnected) {
      console.log('[ssrkit] server connection lost. Polling for restart...');
      isConnected = false;
      setTimeout(() => location.reload(), 1000);
    }
  };
}

connect();
";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_json() {
        assert_eq!(HmrMessage::Connected.to_json(), r#"{"type":"connected"}"#);
        assert_eq!(
            HmrMessage::Reload {
                urls: vec!["/_app/routes/index.mod".to_string()]
            }
            .to_json(),
            r#"{"type":"reload","urls":["/_app/routes/index.mod"]}"#
        );
    }

    #[test]
    fn test_head_scripts() {
        let scripts = HmrOptions { port: 3000 }.head_scripts();
        assert!(scripts.contains(":3000/__hmr"));
        assert!(scripts.contains(r#"src="/@hmr-client""#));
    }
}
