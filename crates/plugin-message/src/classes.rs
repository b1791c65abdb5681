//! Message classes and their protocol versions.

use std::collections::BTreeMap;

/// Lifecycle traffic between the child and the backend.
pub const MESSAGE_CLASS_BASE: &str = "base";
pub const MESSAGE_CLASS_BASE_VERSION: &str = "1.0";

/// Traffic between host and child only. Never forwarded to the backend.
pub const MESSAGE_CLASS_INTERNAL: &str = "internal";
pub const MESSAGE_CLASS_INTERNAL_VERSION: &str = "1.0";

pub const MESSAGE_CLASS_MEDIA: &str = "media";
pub const MESSAGE_CLASS_MEDIA_VERSION: &str = "1.0";

pub const MESSAGE_CLASS_MEDIA_BROWSER: &str = "media_browser";
pub const MESSAGE_CLASS_MEDIA_BROWSER_VERSION: &str = "1.0";

pub const MESSAGE_CLASS_MEDIA_TIME: &str = "media_time";
pub const MESSAGE_CLASS_MEDIA_TIME_VERSION: &str = "1.0";

/// Boolean key marking a message whose sender waits for a reply.
pub const BLOCKING_REQUEST_KEY: &str = "blocking_request";

/// Boolean key marking the reply that releases a blocked sender.
pub const BLOCKING_RESPONSE_KEY: &str = "blocking_response";

/// Versions of the classes this side of the protocol speaks, keyed by class.
pub fn message_class_versions() -> BTreeMap<String, String> {
    [
        (MESSAGE_CLASS_BASE, MESSAGE_CLASS_BASE_VERSION),
        (MESSAGE_CLASS_INTERNAL, MESSAGE_CLASS_INTERNAL_VERSION),
        (MESSAGE_CLASS_MEDIA, MESSAGE_CLASS_MEDIA_VERSION),
        (MESSAGE_CLASS_MEDIA_BROWSER, MESSAGE_CLASS_MEDIA_BROWSER_VERSION),
        (MESSAGE_CLASS_MEDIA_TIME, MESSAGE_CLASS_MEDIA_TIME_VERSION),
    ]
    .into_iter()
    .map(|(class, version)| (class.to_string(), version.to_string()))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_cover_every_class() {
        let versions = message_class_versions();
        assert_eq!(versions.len(), 5);
        assert_eq!(versions.get("media").map(String::as_str), Some("1.0"));
        assert!(versions.contains_key("internal"));
    }
}
