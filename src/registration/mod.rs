use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};

pub const PLATFORM: &str = "Android";
pub const BRAND: &str = "Xiaomi";
pub const BUNDLE_ID: &str = "com.lancens.wxdoorbell";
const RANDOM_ID_LEN: usize = 12;

/// Device identity announced in the REGISTER frame. Built once per process
/// and sent verbatim on every reconnect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationIdentity {
    pub imei: String,
    pub imsi: String,
    #[serde(rename = "type")]
    pub platform: String,
    pub brand: String,
    pub bundle_id: String,
}

impl RegistrationIdentity {
    /// Uses the configured IMEI when present (and non-blank), otherwise a
    /// random identifier. The IMSI is always random.
    pub fn new(imei: Option<&str>) -> Self {
        let imei = imei
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| random_identifier(RANDOM_ID_LEN));
        Self {
            imei,
            imsi: random_identifier(RANDOM_ID_LEN),
            platform: PLATFORM.to_string(),
            brand: BRAND.to_string(),
            bundle_id: BUNDLE_ID.to_string(),
        }
    }

    /// Compact JSON, UTF-8.
    pub fn to_payload(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

pub fn random_identifier(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_imei_is_used_verbatim() {
        let identity = RegistrationIdentity::new(Some("861234567890123"));
        assert_eq!(identity.imei, "861234567890123");
        assert_eq!(identity.imsi.len(), RANDOM_ID_LEN);
    }

    #[test]
    fn blank_imei_falls_back_to_random_identifier() {
        let identity = RegistrationIdentity::new(Some("   "));
        assert_eq!(identity.imei.len(), RANDOM_ID_LEN);
        assert!(identity.imei.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn payload_is_compact_json_with_wire_field_names() {
        let identity = RegistrationIdentity {
            imei: "aaaaaaaaaaaa".to_string(),
            imsi: "bbbbbbbbbbbb".to_string(),
            platform: PLATFORM.to_string(),
            brand: BRAND.to_string(),
            bundle_id: BUNDLE_ID.to_string(),
        };
        let payload = String::from_utf8(identity.to_payload().unwrap()).unwrap();
        assert_eq!(
            payload,
            r#"{"imei":"aaaaaaaaaaaa","imsi":"bbbbbbbbbbbb","type":"Android","brand":"Xiaomi","bundle_id":"com.lancens.wxdoorbell"}"#
        );
    }

    #[test]
    fn random_identifiers_differ() {
        assert_ne!(random_identifier(12), random_identifier(12));
    }
}
