use parse_display::{Display, FromStr};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::Error;

/// Every message kind the remote service accepts.
#[derive(Copy, Clone, Debug, Deserialize, Serialize, Display, FromStr, PartialEq, Eq, Hash)]
#[display(style = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Log a user in, exchanging credentials for a user token.
    UserLogin,
    /// Register a device, exchanging a user token for a device token.
    PrinterLogin,
    /// Status report plus command poll.
    Command,
    /// Camera frame upload.
    Camera,
    /// List queued jobs for a device.
    JobList,
    /// Start a queued job on a device.
    JobStart,
}

impl MessageKind {
    /// Path on the remote service this kind is posted to.
    pub fn path(&self) -> &'static str {
        match self {
            MessageKind::UserLogin => "/apiprinter/v1/printer/user_login",
            MessageKind::PrinterLogin => "/apiprinter/v1/printer/printer_login",
            MessageKind::Command => "/apiprinter/v1/printer/command",
            MessageKind::Camera => "/apiprinter/v1/printer/camera",
            MessageKind::JobList => "/apiprinter/v1/printer/get_queue",
            MessageKind::JobStart => "/apiprinter/v1/printer/start_job",
        }
    }
}

/// Acknowledgment of a previously received command.
#[derive(Copy, Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Ack {
    /// Number of the command being acknowledged.
    pub number: i64,
    /// Whether the command succeeded.
    pub result: bool,
}

/// User credentials.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Login {
    /// User name.
    pub user: String,
    /// Password.
    pub password: String,
    /// One-time token, used instead of the password when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disposable_token: Option<String>,
}

/// A request to the remote service, one variant per [MessageKind].
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum Request {
    UserLogin {
        login: Login,
        platform: String,
        host_mac: Option<String>,
        local_ip: Option<String>,
        version: String,
    },
    PrinterLogin {
        user_token: String,
        printer: Value,
        version: String,
        data_time: String,
        camera: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        select_printer_type: Option<String>,
    },
    Command {
        auth_token: String,
        report: Map<String, Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command_ack: Option<Ack>,
    },
    Camera {
        auth_token: String,
        camera_number: u32,
        image: String,
    },
    JobList {
        auth_token: String,
    },
    JobStart {
        auth_token: String,
        job_id: String,
    },
}

/// A packed message, ready to be posted.
#[derive(Clone, Debug, PartialEq)]
pub struct Packed {
    /// Kind of the packed message.
    pub kind: MessageKind,
    /// Path to post the body to.
    pub path: &'static str,
    /// JSON body.
    pub body: Map<String, Value>,
}

impl Request {
    /// Build a request from a kind name and loosely typed fields. Unknown
    /// kinds are an error rather than being silently dropped.
    pub fn from_fields(kind: &str, mut fields: Map<String, Value>) -> Result<Self, Error> {
        let parsed: MessageKind = kind.parse().map_err(|_| Error::UnknownKind(kind.to_owned()))?;
        fields.insert("kind".to_owned(), Value::String(parsed.to_string()));
        serde_json::from_value(Value::Object(fields)).map_err(|source| Error::BadFields { kind: parsed, source })
    }

    /// Kind of this request.
    pub fn kind(&self) -> MessageKind {
        match self {
            Request::UserLogin { .. } => MessageKind::UserLogin,
            Request::PrinterLogin { .. } => MessageKind::PrinterLogin,
            Request::Command { .. } => MessageKind::Command,
            Request::Camera { .. } => MessageKind::Camera,
            Request::JobList { .. } => MessageKind::JobList,
            Request::JobStart { .. } => MessageKind::JobStart,
        }
    }

    /// Pack this request into a path and body. Keys in `extra` are merged
    /// into the top level of the body, overriding packed keys.
    pub fn pack(&self, extra: Map<String, Value>) -> Packed {
        let kind = self.kind();
        let mut body = match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        body.remove("kind");
        body.extend(extra);
        Packed {
            kind,
            path: kind.path(),
            body,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use testresult::TestResult;

    use super::*;

    #[test]
    fn test_pack_command_drops_missing_ack() {
        let request = Request::Command {
            auth_token: "tok".to_owned(),
            report: json!({"state": "ready"}).as_object().cloned().unwrap_or_default(),
            command_ack: None,
        };
        let mut extra = Map::new();
        extra.insert("reset_job".to_owned(), json!(true));

        let packed = request.pack(extra);
        assert_eq!(packed.path, "/apiprinter/v1/printer/command");
        assert_eq!(
            Value::Object(packed.body),
            json!({"auth_token": "tok", "report": {"state": "ready"}, "reset_job": true})
        );
    }

    #[test]
    fn test_pack_command_with_ack() {
        let request = Request::Command {
            auth_token: "tok".to_owned(),
            report: Map::new(),
            command_ack: Some(Ack { number: 4, result: false }),
        };
        let packed = request.pack(Map::new());
        assert_eq!(packed.body["command_ack"], json!({"number": 4, "result": false}));
    }

    #[test]
    fn test_from_fields_unknown_kind() {
        let err = Request::from_fields("register_toaster", Map::new()).unwrap_err();
        assert!(matches!(err, Error::UnknownKind(ref k) if k == "register_toaster"));
    }

    #[test]
    fn test_from_fields_bad_shape() {
        let err = Request::from_fields("job_start", Map::new()).unwrap_err();
        assert!(matches!(err, Error::BadFields { kind: MessageKind::JobStart, .. }));
    }

    #[test]
    fn test_from_fields_camera() -> TestResult {
        let fields = json!({"auth_token": "t", "camera_number": 1, "image": "aGk="});
        let request = Request::from_fields("camera", fields.as_object().cloned().unwrap_or_default())?;
        assert_eq!(request.kind(), MessageKind::Camera);
        assert_eq!(request.pack(Map::new()).path, "/apiprinter/v1/printer/camera");
        Ok(())
    }
}
