use serde::{Deserialize, Deserializer};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// The file manager reports modification times as unix seconds, possibly
/// fractional, and omits the field for entries it could not stat.
pub fn deserialize_optional_timestamp_secs<'de, D>(
    deserializer: D,
) -> Result<Option<SystemTime>, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = Option::<f64>::deserialize(deserializer)?;
    Ok(secs
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .map(|since_epoch| UNIX_EPOCH + since_epoch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct TestStruct {
        #[serde(default, deserialize_with = "deserialize_optional_timestamp_secs")]
        modified: Option<SystemTime>,
    }

    #[test]
    fn test_deserialize_timestamp_secs() {
        let json = r#"{"modified": 1640995200}"#;
        let result: TestStruct = serde_json::from_str(json).unwrap();

        assert_eq!(
            result.modified,
            Some(UNIX_EPOCH + Duration::from_secs(1640995200))
        );
    }

    #[test]
    fn test_fractional_and_negative_timestamps() {
        let fractional: TestStruct = serde_json::from_str(r#"{"modified": 1640995200.5}"#).unwrap();
        assert_eq!(
            fractional.modified,
            Some(UNIX_EPOCH + Duration::from_millis(1_640_995_200_500))
        );

        let negative: TestStruct = serde_json::from_str(r#"{"modified": -1}"#).unwrap();
        assert_eq!(negative.modified, None);
    }

    #[test]
    fn test_missing_and_null_timestamps() {
        let missing: TestStruct = serde_json::from_str("{}").unwrap();
        assert_eq!(missing.modified, None);

        let null: TestStruct = serde_json::from_str(r#"{"modified": null}"#).unwrap();
        assert_eq!(null.modified, None);
    }
}
