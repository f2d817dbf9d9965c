use serde_derive::{Deserialize, Serialize};

use crate::time;

/// Reply code: request carried out.
pub const OK: u16 = 200;
/// Reply code: list payload in `data_list`.
pub const LIST: u16 = 202;
/// Reply code: the roster changed, refetch contacts and users.
pub const ROSTER_CHANGED: u16 = 205;
/// Reply code: error, human-readable text in `error`.
pub const BAD_REQUEST: u16 = 400;
/// Reply code: authentication or key payload in `bin`.
pub const AUTH_PAYLOAD: u16 = 511;

pub const ERR_BAD_REQUEST: &str = "bad request";
pub const ERR_NAME_TAKEN: &str = "name taken";
pub const ERR_NOT_REGISTERED: &str = "not registered";
pub const ERR_BAD_PASSWORD: &str = "bad password";
pub const ERR_USER_NOT_REGISTERED: &str = "user not registered";
pub const ERR_NO_PUBLIC_KEY: &str = "no public key";

/// Identity block carried by the `presence` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceUser {
    pub account_name: String,
    pub pubkey: String,
}

/// Client requests, tagged by the `action` key. Unknown extra keys on the
/// wire are ignored; a missing required key fails the decode and the frame
/// is answered with `400 "bad request"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Request {
    Presence {
        time: f64,
        user: PresenceUser,
    },
    Message {
        time: f64,
        from: String,
        to: String,
        message_text: String,
    },
    Exit {
        time: f64,
        account_name: String,
    },
    GetContacts {
        time: f64,
        user: String,
    },
    GetUsers {
        time: f64,
        account_name: String,
    },
    Add {
        time: f64,
        user: String,
        account_name: String,
    },
    Remove {
        time: f64,
        user: String,
        account_name: String,
    },
    PubkeyNeed {
        time: f64,
        account_name: String,
    },
}

impl Request {
    pub fn presence(account_name: &str, pubkey: &str) -> Request {
        Request::Presence {
            time: time::timestamp(),
            user: PresenceUser {
                account_name: account_name.to_owned(),
                pubkey: pubkey.to_owned(),
            },
        }
    }

    pub fn message(from: &str, to: &str, message_text: &str) -> Request {
        Request::Message {
            time: time::timestamp(),
            from: from.to_owned(),
            to: to.to_owned(),
            message_text: message_text.to_owned(),
        }
    }

    pub fn exit(account_name: &str) -> Request {
        Request::Exit {
            time: time::timestamp(),
            account_name: account_name.to_owned(),
        }
    }

    pub fn get_contacts(user: &str) -> Request {
        Request::GetContacts {
            time: time::timestamp(),
            user: user.to_owned(),
        }
    }

    pub fn get_users(account_name: &str) -> Request {
        Request::GetUsers {
            time: time::timestamp(),
            account_name: account_name.to_owned(),
        }
    }

    pub fn add(user: &str, account_name: &str) -> Request {
        Request::Add {
            time: time::timestamp(),
            user: user.to_owned(),
            account_name: account_name.to_owned(),
        }
    }

    pub fn remove(user: &str, account_name: &str) -> Request {
        Request::Remove {
            time: time::timestamp(),
            user: user.to_owned(),
            account_name: account_name.to_owned(),
        }
    }

    pub fn pubkey_need(account_name: &str) -> Request {
        Request::PubkeyNeed {
            time: time::timestamp(),
            account_name: account_name.to_owned(),
        }
    }
}

/// Reply envelope. `response` selects the meaning; the optional keys are
/// serialised only for the codes that carry them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub response: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_list: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bin: Option<String>,
}

impl Reply {
    fn bare(response: u16) -> Reply {
        Reply {
            response,
            error: None,
            data_list: None,
            bin: None,
        }
    }

    pub fn ok() -> Reply {
        Reply::bare(OK)
    }

    pub fn list(items: Vec<String>) -> Reply {
        Reply {
            data_list: Some(items),
            ..Reply::bare(LIST)
        }
    }

    pub fn refresh() -> Reply {
        Reply::bare(ROSTER_CHANGED)
    }

    pub fn error(text: impl Into<String>) -> Reply {
        Reply {
            error: Some(text.into()),
            ..Reply::bare(BAD_REQUEST)
        }
    }

    pub fn auth(bin: impl Into<String>) -> Reply {
        Reply {
            bin: Some(bin.into()),
            ..Reply::bare(AUTH_PAYLOAD)
        }
    }
}

/// A single wire frame: either a request/event (`action` key) or a reply
/// (`response` key).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Frame {
    Request(Request),
    Reply(Reply),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_action_tags() {
        let encoded = serde_json::to_value(Request::get_contacts("alice")).unwrap();
        assert_eq!(encoded["action"], "get_contacts");
        assert_eq!(encoded["user"], "alice");

        let encoded = serde_json::to_value(Request::pubkey_need("bob")).unwrap();
        assert_eq!(encoded["action"], "pubkey_need");
        assert_eq!(encoded["account_name"], "bob");
    }

    #[test]
    fn test_reply_skips_absent_keys() {
        let encoded = serde_json::to_value(Reply::ok()).unwrap();
        let object = encoded.as_object().unwrap();

        assert_eq!(object.len(), 1);
        assert_eq!(object["response"], 200);
    }

    #[test]
    fn test_reply_list_payload() {
        let encoded =
            serde_json::to_value(Reply::list(vec!["bob".to_owned(), "carol".to_owned()])).unwrap();

        assert_eq!(encoded["response"], 202);
        assert_eq!(encoded["data_list"][0], "bob");
        assert_eq!(encoded["data_list"][1], "carol");
    }

    #[test]
    fn test_frame_untagged_split() {
        let request: Frame =
            serde_json::from_str(r#"{"action":"exit","time":1.0,"account_name":"alice"}"#).unwrap();
        assert!(matches!(request, Frame::Request(Request::Exit { .. })));

        let reply: Frame = serde_json::from_str(r#"{"response":200}"#).unwrap();
        assert!(matches!(reply, Frame::Reply(Reply { response: 200, .. })));
    }

    #[test]
    fn test_unknown_extra_keys_ignored() {
        let frame: Frame = serde_json::from_str(
            r#"{"action":"exit","time":1.0,"account_name":"alice","debug":true}"#,
        )
        .unwrap();

        assert!(matches!(frame, Frame::Request(Request::Exit { .. })));
    }
}
