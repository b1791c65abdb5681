//! Message model shared by the plugin host, the plugin child process and
//! the media backend loaded inside the child.
//!
//! A [`Message`] is a `class` + `name` pair with a set of uniquely keyed,
//! typed [`Value`]s. Messages travel as UTF-8 JSON text:
//!
//! ```text
//! {"class":"media","name":"load_uri","params":{"uri":{"s":"http://example.com"}}}
//! ```
//!
//! Every value carries a short tag naming its variant, so a parsed message
//! is typed exactly like the one that was generated. Unsigned integers are
//! written as hex strings and process-local addresses as opaque
//! [`ForeignAddress`] tokens that the receiver cannot dereference.

mod classes;
mod error;
mod message;
mod value;

pub use classes::{
    message_class_versions, BLOCKING_REQUEST_KEY, BLOCKING_RESPONSE_KEY, MESSAGE_CLASS_BASE,
    MESSAGE_CLASS_BASE_VERSION, MESSAGE_CLASS_INTERNAL, MESSAGE_CLASS_INTERNAL_VERSION,
    MESSAGE_CLASS_MEDIA, MESSAGE_CLASS_MEDIA_BROWSER, MESSAGE_CLASS_MEDIA_BROWSER_VERSION,
    MESSAGE_CLASS_MEDIA_TIME, MESSAGE_CLASS_MEDIA_TIME_VERSION, MESSAGE_CLASS_MEDIA_VERSION,
};
pub use error::{MessageError, MessageResult};
pub use message::Message;
pub use value::{ForeignAddress, Value};
