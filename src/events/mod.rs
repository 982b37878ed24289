use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

const EVENT_PREFIX: &str = "dingding_smart";

/// Decoded PUSH payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "type", default, deserialize_with = "string_or_number")]
    pub kind: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub alert: String,
    #[serde(default)]
    pub name: String,
}

impl Notification {
    pub fn notification_type(&self) -> NotificationType {
        NotificationType::from_code(&self.kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationType {
    PirMotion,
    DoorbellRing,
    FingerprintUnlock,
    PasswordUnlock,
    LowPower,
    UartTransfer,
    RemoteLock,
    LowTemperatureAlarm,
    HighTemperatureAlarm,
    SoundAlarm,
    DeviceOffline,
    DeviceOnline,
    GenericTransfer,
    Unknown(String),
}

impl NotificationType {
    pub fn from_code(code: &str) -> Self {
        match code.trim() {
            "0" => Self::PirMotion,
            "1" => Self::DoorbellRing,
            "2" => Self::FingerprintUnlock,
            "3" => Self::PasswordUnlock,
            "4" => Self::LowPower,
            "5" => Self::UartTransfer,
            "6" => Self::RemoteLock,
            "8" => Self::LowTemperatureAlarm,
            "9" => Self::HighTemperatureAlarm,
            "10" => Self::SoundAlarm,
            "20" => Self::DeviceOffline,
            "21" => Self::DeviceOnline,
            "100" => Self::GenericTransfer,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn category(&self) -> EventCategory {
        match self {
            Self::FingerprintUnlock | Self::PasswordUnlock | Self::RemoteLock => EventCategory::Unlock,
            Self::DoorbellRing => EventCategory::Call,
            Self::DeviceOffline => EventCategory::Offline,
            Self::DeviceOnline => EventCategory::Online,
            Self::PirMotion
            | Self::LowPower
            | Self::LowTemperatureAlarm
            | Self::HighTemperatureAlarm
            | Self::SoundAlarm => EventCategory::Alarm,
            Self::UartTransfer | Self::GenericTransfer | Self::Unknown(_) => EventCategory::None,
        }
    }

    pub fn unlock_method(&self) -> Option<&'static str> {
        match self {
            Self::FingerprintUnlock => Some("fingerprint"),
            Self::PasswordUnlock => Some("password"),
            Self::RemoteLock => Some("lock"),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventCategory {
    Unlock,
    Call,
    Offline,
    Online,
    Alarm,
    None,
}

impl EventCategory {
    pub fn event_name(self) -> Option<String> {
        let suffix = match self {
            Self::Unlock => "door_unlock",
            Self::Call => "door_call",
            Self::Offline => "door_offline",
            Self::Online => "door_online",
            Self::Alarm => "alarm",
            Self::None => return None,
        };
        Some(format!("{EVENT_PREFIX}_{suffix}"))
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Unlock => "unlock",
            Self::Call => "call",
            Self::Offline => "offline",
            Self::Online => "online",
            Self::Alarm => "alarm",
            Self::None => "none",
        };
        f.write_str(label)
    }
}

/// Host-side consumer of door events. Only ever invoked from the host task.
pub trait EventSink: Send + Sync {
    fn emit(&self, category: EventCategory, fields: BTreeMap<String, String>);
}

/// Logs each event and optionally prints it as a JSON line on stdout.
pub struct LogSink {
    json_lines: bool,
}

impl LogSink {
    pub fn new(json_lines: bool) -> Self {
        Self { json_lines }
    }
}

impl EventSink for LogSink {
    fn emit(&self, category: EventCategory, fields: BTreeMap<String, String>) {
        let event = category.event_name().unwrap_or_default();
        tracing::info!(event = %event, category = %category, fields = ?fields, "door event");
        if self.json_lines {
            let line = serde_json::json!({ "event": event, "category": category, "data": fields });
            println!("{line}");
        }
    }
}

/// Filters notifications by device UID and maps them onto door events.
#[derive(Clone)]
pub struct EventBridge {
    uid_filter: Option<String>,
    sink: Arc<dyn EventSink>,
}

impl EventBridge {
    pub fn new(uid_filter: Option<String>, sink: Arc<dyn EventSink>) -> Self {
        let uid_filter = uid_filter.filter(|uid| !uid.trim().is_empty());
        Self { uid_filter, sink }
    }

    pub fn accepts(&self, notification: &Notification) -> bool {
        match &self.uid_filter {
            Some(uid) => notification.uid == *uid,
            None => true,
        }
    }

    /// Returns the emitted category, or `None` when the notification was
    /// filtered out or has no door-event mapping.
    pub fn dispatch(&self, notification: &Notification) -> Option<EventCategory> {
        if !self.accepts(notification) {
            tracing::debug!(uid = %notification.uid, "notification for other device ignored");
            return None;
        }

        let kind = notification.notification_type();
        let category = kind.category();
        if category == EventCategory::None {
            tracing::debug!(kind = ?kind, uid = %notification.uid, "notification has no door event");
            return None;
        }

        tracing::info!(
            kind = %notification.kind,
            uid = %notification.uid,
            message = %notification.message,
            "handling push notification"
        );
        self.sink.emit(category, event_fields(notification, &kind));
        Some(category)
    }
}

fn event_fields(notification: &Notification, kind: &NotificationType) -> BTreeMap<String, String> {
    let mut fields = BTreeMap::new();
    fields.insert("uid".to_string(), notification.uid.clone());
    fields.insert("message".to_string(), notification.message.clone());
    fields.insert("alert".to_string(), notification.alert.clone());
    fields.insert("name".to_string(), notification.name.clone());
    if let Some(method) = kind.unlock_method() {
        fields.insert("method".to_string(), method.to_string());
    }
    if kind.category() == EventCategory::Alarm {
        fields.insert("type".to_string(), notification.kind.clone());
    }
    fields
}

/// Some firmware sends the type code as a JSON number.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::Null => Ok(String::new()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number for type, got {other}"
        ))),
    }
}
