//! The message type and its text codec.

use crate::classes::{BLOCKING_REQUEST_KEY, BLOCKING_RESPONSE_KEY};
use crate::error::{MessageError, MessageResult};
use crate::value::{ForeignAddress, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One protocol message.
///
/// Parameters are kept in key order so that [`Message::generate`] produces
/// the same text for the same set of values, no matter in which order they
/// were set. Setting an existing key replaces its value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    class: String,
    name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    params: BTreeMap<String, Value>,
}

impl Message {
    pub fn new(class: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            name: name.into(),
            params: BTreeMap::new(),
        }
    }

    /// Reset class and name, dropping every parameter.
    pub fn set_message(&mut self, class: impl Into<String>, name: impl Into<String>) {
        self.class = class.into();
        self.name = name.into();
        self.params.clear();
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this message is `class.name`.
    pub fn is(&self, class: &str, name: &str) -> bool {
        self.class == class && self.name == name
    }

    pub fn params(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn has_value(&self, key: &str) -> bool {
        self.params.contains_key(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.params.insert(key.into(), value);
    }

    pub fn set_value(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.set(key, Value::String(value.into()));
    }

    pub fn set_value_s32(&mut self, key: impl Into<String>, value: i32) {
        self.set(key, Value::S32(value));
    }

    pub fn set_value_u32(&mut self, key: impl Into<String>, value: u32) {
        self.set(key, Value::U32(value));
    }

    pub fn set_value_boolean(&mut self, key: impl Into<String>, value: bool) {
        self.set(key, Value::Boolean(value));
    }

    pub fn set_value_real(&mut self, key: impl Into<String>, value: f64) {
        self.set(key, Value::Real(value));
    }

    pub fn set_value_pointer(&mut self, key: impl Into<String>, value: ForeignAddress) {
        self.set(key, Value::Pointer(value));
    }

    pub fn set_value_binary(&mut self, key: impl Into<String>, value: Vec<u8>) {
        self.set(key, Value::Binary(value));
    }

    /// Store a nested map or array.
    pub fn set_value_structured(&mut self, key: impl Into<String>, value: Value) {
        self.set(key, value);
    }

    pub fn value(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    /// String view of `key`; empty when absent.
    pub fn get_value(&self, key: &str) -> String {
        self.params.get(key).map(Value::to_text).unwrap_or_default()
    }

    /// `key` as a signed integer; zero when absent or not numeric.
    pub fn get_value_s32(&self, key: &str) -> i32 {
        self.params.get(key).map_or(0, Value::to_s32)
    }

    pub fn get_value_u32(&self, key: &str) -> u32 {
        self.params.get(key).map_or(0, Value::to_u32)
    }

    pub fn get_value_boolean(&self, key: &str) -> bool {
        self.params.get(key).is_some_and(Value::to_boolean)
    }

    pub fn get_value_real(&self, key: &str) -> f64 {
        self.params.get(key).map_or(0.0, Value::to_real)
    }

    /// The token stored under `key`, only if it was set as a pointer.
    pub fn get_value_pointer(&self, key: &str) -> Option<ForeignAddress> {
        match self.params.get(key) {
            Some(Value::Pointer(addr)) => Some(*addr),
            _ => None,
        }
    }

    pub fn get_value_binary(&self, key: &str) -> Option<&[u8]> {
        match self.params.get(key) {
            Some(Value::Binary(bytes)) => Some(bytes),
            Some(Value::String(s)) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Nested map or array stored under `key`.
    pub fn get_value_structured(&self, key: &str) -> Option<&Value> {
        match self.params.get(key) {
            Some(value @ (Value::Map(_) | Value::Array(_))) => Some(value),
            _ => None,
        }
    }

    /// Whether the sender waits for a `blocking_response` before continuing.
    pub fn is_blocking_request(&self) -> bool {
        self.get_value_boolean(BLOCKING_REQUEST_KEY)
    }

    pub fn is_blocking_response(&self) -> bool {
        self.get_value_boolean(BLOCKING_RESPONSE_KEY)
    }

    /// Serialize to wire text.
    pub fn generate(&self) -> MessageResult<String> {
        serde_json::to_string(self).map_err(MessageError::Encode)
    }

    /// Parse wire text. Malformed input is an error, never a panic.
    pub fn parse(text: &str) -> MessageResult<Self> {
        serde_json::from_str(text).map_err(MessageError::Parse)
    }

    /// Parse a raw frame payload.
    pub fn parse_bytes(bytes: &[u8]) -> MessageResult<Self> {
        Self::parse(std::str::from_utf8(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Message {
        let mut message = Message::new("media", "size_change");
        message.set_value("name", "/spm_1_0");
        message.set_value_s32("width", 640);
        message.set_value_s32("height", -480);
        message.set_value_u32("format", 0x80e1);
        message.set_value_boolean("swap_bytes", true);
        message.set_value_real("background_r", 0.25);
        message.set_value_binary("raw", vec![0, 1, 2, 255]);
        let mut nested = BTreeMap::new();
        nested.insert("media".to_string(), Value::from("1.0"));
        nested.insert(
            "list".to_string(),
            Value::Array(vec![Value::S32(1), Value::from("two"), Value::Boolean(false)]),
        );
        message.set_value_structured("versions", Value::Map(nested));
        message
    }

    #[test]
    fn parse_inverts_generate() {
        let message = sample();
        let text = message.generate().unwrap();
        let parsed = Message::parse(&text).unwrap();
        assert_eq!(parsed, message);
    }

    #[test]
    fn load_uri_wire_example() {
        let mut message = Message::new("media", "load_uri");
        message.set_value("uri", "http://example.com");
        let text = message.generate().unwrap();
        assert_eq!(
            text,
            r#"{"class":"media","name":"load_uri","params":{"uri":{"s":"http://example.com"}}}"#
        );

        let parsed = Message::parse(&text).unwrap();
        assert_eq!(parsed.class(), "media");
        assert_eq!(parsed.name(), "load_uri");
        assert_eq!(parsed.get_value("uri"), "http://example.com");
    }

    #[test]
    fn generate_ignores_insertion_order() {
        let mut a = Message::new("base", "idle");
        a.set_value_real("time", 0.01);
        a.set_value("z", "last");
        let mut b = Message::new("base", "idle");
        b.set_value("z", "last");
        b.set_value_real("time", 0.01);
        assert_eq!(a.generate().unwrap(), b.generate().unwrap());
    }

    #[test]
    fn setting_a_key_twice_keeps_one_value() {
        let mut message = Message::new("media", "seek");
        message.set_value_real("time", 1.0);
        message.set_value_real("time", 2.0);
        assert_eq!(message.params().count(), 1);
        assert_eq!(message.get_value_real("time"), 2.0);
    }

    #[test]
    fn escaping_is_unambiguous() {
        let mut message = Message::new("media", "text_event");
        let tricky = "quote\" brace} colon: \\slash\n\u{0}nul \u{1F600}";
        message.set_value("text", tricky);
        let parsed = Message::parse(&message.generate().unwrap()).unwrap();
        assert_eq!(parsed.get_value("text"), tricky);
    }

    #[test]
    fn missing_keys_coerce_to_defaults() {
        let message = Message::new("media", "updated");
        assert_eq!(message.get_value("left"), "");
        assert_eq!(message.get_value_s32("left"), 0);
        assert_eq!(message.get_value_u32("left"), 0);
        assert!(!message.get_value_boolean("left"));
        assert_eq!(message.get_value_real("left"), 0.0);
        assert!(message.get_value_pointer("address").is_none());
    }

    #[test]
    fn pointer_is_only_read_back_as_a_token() {
        let backing = [0u8; 4];
        let mut message = Message::new("base", "shm_added");
        message.set_value_pointer("address", ForeignAddress::from_ptr(backing.as_ptr()));
        let parsed = Message::parse(&message.generate().unwrap()).unwrap();
        let addr = parsed.get_value_pointer("address").unwrap();
        assert_eq!(addr.token(), backing.as_ptr() as usize as u64);
        assert!(parsed.get_value("address").starts_with("0x"));
    }

    #[test]
    fn blocking_flags() {
        let mut message = Message::new("media", "pick_file");
        assert!(!message.is_blocking_request());
        message.set_value_boolean(BLOCKING_REQUEST_KEY, true);
        assert!(message.is_blocking_request());
        assert!(!message.is_blocking_response());
    }

    #[test]
    fn malformed_text_is_an_error() {
        for text in [
            "",
            "{",
            "null",
            "[]",
            r#"{"class":"media"}"#,
            r#"{"class":1,"name":"x"}"#,
            r#"{"class":"a","name":"b","params":{"k":{"s":1}}}"#,
            r#"{"class":"a","name":"b","params":{"k":"bare"}}"#,
        ] {
            assert!(
                matches!(Message::parse(text), Err(MessageError::Parse(_))),
                "accepted {:?}",
                text
            );
        }
    }

    #[test]
    fn params_are_optional_on_the_wire() {
        let parsed = Message::parse(r#"{"class":"internal","name":"hello"}"#).unwrap();
        assert!(parsed.is("internal", "hello"));
        assert_eq!(
            Message::new("internal", "hello").generate().unwrap(),
            r#"{"class":"internal","name":"hello"}"#
        );
    }

    #[test]
    fn invalid_utf8_payload_is_rejected() {
        let err = Message::parse_bytes(&[0x7b, 0xff, 0x7d]).unwrap_err();
        assert!(matches!(err, MessageError::InvalidUtf8(_)));
    }
}
