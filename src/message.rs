//! Wire envelopes exchanged with clients.
//!
//! Every frame is a JSON array whose first element is a string tag. Inbound
//! frames parse into [`ClientMessage`]; outbound frames are built from
//! [`RelayMessage`].

use serde_json::{json, Value};
use thiserror::Error;

use crate::{event::Event, filter::Filter};

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// `["EVENT", <event>]`
    Event(Box<Event>),
    /// `["REQ", <sub id>, <filter>...]`
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    /// `["CLOSE", <sub id>]`
    Close(String),
    /// `["AUTH", <signed kind 22242 event>]`
    Auth(Box<Event>),
    /// `["COUNT", <sub id>, <filter>...]`
    Count {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    /// Any other tag; ignored by the relay.
    Unknown(String),
}

/// Why an inbound frame could not be classified.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid: message is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid: message must be a JSON array starting with a string tag")]
    Shape,
    /// The tag was recognised but the rest of the envelope was not usable.
    #[error("invalid: malformed {tag} message: {reason}")]
    Envelope { tag: &'static str, reason: String },
    /// A `REQ`/`COUNT` named a subscription but carried an unusable filter.
    #[error("invalid: {reason}")]
    Filter {
        tag: &'static str,
        subscription_id: String,
        reason: String,
    },
}

impl ClientMessage {
    /// Parse one text frame.
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let val: Value = serde_json::from_str(text)?;
        let arr = val.as_array().ok_or(ParseError::Shape)?;
        let tag = arr
            .first()
            .and_then(Value::as_str)
            .ok_or(ParseError::Shape)?;
        match tag {
            "EVENT" => Ok(Self::Event(Box::new(event_arg("EVENT", arr)?))),
            "AUTH" => Ok(Self::Auth(Box::new(event_arg("AUTH", arr)?))),
            "CLOSE" => {
                if arr.len() != 2 {
                    return Err(envelope("CLOSE", "expected exactly one subscription id"));
                }
                Ok(Self::Close(subscription_arg("CLOSE", arr)?))
            }
            "REQ" => {
                let (subscription_id, filters) = subscription_with_filters("REQ", arr)?;
                Ok(Self::Req {
                    subscription_id,
                    filters,
                })
            }
            "COUNT" => {
                let (subscription_id, filters) = subscription_with_filters("COUNT", arr)?;
                Ok(Self::Count {
                    subscription_id,
                    filters,
                })
            }
            other => Ok(Self::Unknown(other.to_string())),
        }
    }
}

fn envelope(tag: &'static str, reason: impl Into<String>) -> ParseError {
    ParseError::Envelope {
        tag,
        reason: reason.into(),
    }
}

fn event_arg(tag: &'static str, arr: &[Value]) -> Result<Event, ParseError> {
    let raw = match arr {
        [_, ev] => ev,
        _ => return Err(envelope(tag, "expected exactly one event")),
    };
    serde_json::from_value(raw.clone()).map_err(|e| envelope(tag, e.to_string()))
}

fn subscription_arg(tag: &'static str, arr: &[Value]) -> Result<String, ParseError> {
    match arr.get(1).and_then(Value::as_str) {
        Some(id) if !id.is_empty() && id.len() <= 64 => Ok(id.to_string()),
        Some(_) => Err(envelope(tag, "subscription id must be 1-64 characters")),
        None => Err(envelope(tag, "subscription id must be a string")),
    }
}

fn subscription_with_filters(
    tag: &'static str,
    arr: &[Value],
) -> Result<(String, Vec<Filter>), ParseError> {
    let subscription_id = subscription_arg(tag, arr)?;
    let filter_error = |reason: String| ParseError::Filter {
        tag,
        subscription_id: subscription_id.clone(),
        reason,
    };
    if arr.len() < 3 {
        return Err(filter_error("at least one filter is required".into()));
    }
    let filters = arr[2..]
        .iter()
        .map(Filter::from_value)
        .collect::<Result<Vec<_>, _>>()
        .map_err(filter_error)?;
    Ok((subscription_id, filters))
}

/// An outbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    Auth(String),
    Event {
        subscription_id: String,
        event: Box<Event>,
    },
    Eose(String),
    Closed {
        subscription_id: String,
        message: String,
    },
    Ok {
        id: String,
        accepted: bool,
        message: String,
    },
    Notice(String),
    Count {
        subscription_id: String,
        count: u64,
    },
}

impl RelayMessage {
    pub fn ok(id: impl Into<String>, accepted: bool, message: impl Into<String>) -> Self {
        Self::Ok {
            id: id.into(),
            accepted,
            message: message.into(),
        }
    }

    pub fn closed(subscription_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Closed {
            subscription_id: subscription_id.into(),
            message: message.into(),
        }
    }

    /// Serialize to the JSON text sent on the wire.
    pub fn to_json(&self) -> String {
        match self {
            Self::Auth(challenge) => json!(["AUTH", challenge]).to_string(),
            Self::Event {
                subscription_id,
                event,
            } => event_frame(subscription_id, event),
            Self::Eose(sub) => json!(["EOSE", sub]).to_string(),
            Self::Closed {
                subscription_id,
                message,
            } => json!(["CLOSED", subscription_id, message]).to_string(),
            Self::Ok {
                id,
                accepted,
                message,
            } => json!(["OK", id, accepted, message]).to_string(),
            Self::Notice(message) => json!(["NOTICE", message]).to_string(),
            Self::Count {
                subscription_id,
                count,
            } => json!(["COUNT", subscription_id, {"count": count}]).to_string(),
        }
    }
}

/// `["EVENT", <sub id>, <event>]` without cloning the event.
pub fn event_frame(subscription_id: &str, event: &Event) -> String {
    json!(["EVENT", subscription_id, event]).to_string()
}

/// Turn a handler's `(kind, params)` reply into a frame.
///
/// Returns `None` when the kind is unknown or the parameters do not fit the
/// frame, in which case nothing is sent.
pub fn build_response(kind: &str, params: &[Value]) -> Option<RelayMessage> {
    let text = |v: &Value| v.as_str().map(str::to_string);
    match (kind, params) {
        ("OK", [id, accepted, message]) => Some(RelayMessage::Ok {
            id: text(id)?,
            accepted: accepted.as_bool()?,
            message: text(message)?,
        }),
        ("OK", [id, accepted]) => Some(RelayMessage::ok(text(id)?, accepted.as_bool()?, "")),
        ("EVENT", [sub, event]) => Some(RelayMessage::Event {
            subscription_id: text(sub)?,
            event: Box::new(serde_json::from_value(event.clone()).ok()?),
        }),
        ("EOSE", [sub]) => Some(RelayMessage::Eose(text(sub)?)),
        ("CLOSED", [sub, message]) => Some(RelayMessage::closed(text(sub)?, text(message)?)),
        ("NOTICE", [message]) => Some(RelayMessage::Notice(text(message)?)),
        ("COUNT", [sub, count]) => Some(RelayMessage::Count {
            subscription_id: text(sub)?,
            count: count.as_u64()?,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_json() -> Value {
        json!({
            "id": "aa11",
            "pubkey": "p1",
            "kind": 1,
            "created_at": 1,
            "tags": [["t", "news"]],
            "content": "",
            "sig": ""
        })
    }

    #[test]
    fn parses_every_known_tag() {
        let ev = json!(["EVENT", event_json()]).to_string();
        assert!(matches!(ClientMessage::parse(&ev).unwrap(), ClientMessage::Event(e) if e.id == "aa11"));

        let auth = json!(["AUTH", event_json()]).to_string();
        assert!(matches!(ClientMessage::parse(&auth).unwrap(), ClientMessage::Auth(_)));

        let req = json!(["REQ", "s", {"kinds": [1]}, {"authors": ["p1"]}]).to_string();
        match ClientMessage::parse(&req).unwrap() {
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                assert_eq!(subscription_id, "s");
                assert_eq!(filters.len(), 2);
            }
            other => panic!("unexpected {other:?}"),
        }

        let count = json!(["COUNT", "c", {}]).to_string();
        assert!(matches!(
            ClientMessage::parse(&count).unwrap(),
            ClientMessage::Count { subscription_id, .. } if subscription_id == "c"
        ));

        assert_eq!(
            ClientMessage::parse(r#"["CLOSE","s"]"#).unwrap(),
            ClientMessage::Close("s".into())
        );
    }

    #[test]
    fn unknown_tag_is_not_an_error() {
        assert_eq!(
            ClientMessage::parse(r#"["PING"]"#).unwrap(),
            ClientMessage::Unknown("PING".into())
        );
    }

    #[test]
    fn malformed_frames() {
        assert!(matches!(ClientMessage::parse("not json"), Err(ParseError::Json(_))));
        assert!(matches!(ClientMessage::parse("{}"), Err(ParseError::Shape)));
        assert!(matches!(ClientMessage::parse("[]"), Err(ParseError::Shape)));
        assert!(matches!(ClientMessage::parse("[1, 2]"), Err(ParseError::Shape)));
        assert!(matches!(
            ClientMessage::parse(r#"["CLOSE"]"#),
            Err(ParseError::Envelope { tag: "CLOSE", .. })
        ));
        assert!(matches!(
            ClientMessage::parse(r#"["CLOSE", 5]"#),
            Err(ParseError::Envelope { tag: "CLOSE", .. })
        ));
        assert!(matches!(
            ClientMessage::parse(r#"["EVENT", {"id": 1}]"#),
            Err(ParseError::Envelope { tag: "EVENT", .. })
        ));
        assert!(matches!(
            ClientMessage::parse(r#"["REQ", 7, {}]"#),
            Err(ParseError::Envelope { tag: "REQ", .. })
        ));
    }

    #[test]
    fn bad_filter_keeps_subscription_id() {
        match ClientMessage::parse(r#"["REQ", "s", {"kinds": "x"}]"#) {
            Err(ParseError::Filter {
                tag,
                subscription_id,
                ..
            }) => {
                assert_eq!(tag, "REQ");
                assert_eq!(subscription_id, "s");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            ClientMessage::parse(r#"["COUNT", "c"]"#),
            Err(ParseError::Filter { tag: "COUNT", .. })
        ));
    }

    #[test]
    fn outbound_frames() {
        assert_eq!(RelayMessage::Auth("ch".into()).to_json(), r#"["AUTH","ch"]"#);
        assert_eq!(RelayMessage::Eose("s".into()).to_json(), r#"["EOSE","s"]"#);
        assert_eq!(
            RelayMessage::closed("s", "bye").to_json(),
            r#"["CLOSED","s","bye"]"#
        );
        assert_eq!(
            RelayMessage::ok("aa11", false, "nope").to_json(),
            r#"["OK","aa11",false,"nope"]"#
        );
        assert_eq!(
            RelayMessage::Count {
                subscription_id: "c".into(),
                count: 3
            }
            .to_json(),
            r#"["COUNT","c",{"count":3}]"#
        );
        let ev: Event = serde_json::from_value(event_json()).unwrap();
        let frame: Value = serde_json::from_str(&event_frame("s", &ev)).unwrap();
        assert_eq!(frame, json!(["EVENT", "s", event_json()]));
    }

    #[test]
    fn build_response_shapes() {
        assert_eq!(
            build_response("OK", &[json!("aa11"), json!(true), json!("")]),
            Some(RelayMessage::ok("aa11", true, ""))
        );
        assert_eq!(
            build_response("NOTICE", &[json!("hi")]),
            Some(RelayMessage::Notice("hi".into()))
        );
        assert!(matches!(
            build_response("EVENT", &[json!("s"), event_json()]),
            Some(RelayMessage::Event { .. })
        ));
        assert_eq!(build_response("OK", &[json!("aa11")]), None);
        assert_eq!(build_response("OK", &[json!(1), json!(true), json!("")]), None);
        assert_eq!(build_response("BOGUS", &[]), None);
    }
}
