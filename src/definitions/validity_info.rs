use chrono::{DateTime, SecondsFormat, Utc};
use ciborium::Value;
use serde::{Deserialize, Serialize};

/// The validity window of a credential. Each timestamp is carried as a
/// tag 0 RFC 3339 string with second precision in UTC.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "Value", into = "Value")]
pub struct ValidityInfo {
    pub signed: DateTime<Utc>,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub expected_update: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("expected a map")]
    NotAMap,
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("timestamp must be a tag 0 date-time string")]
    NotADateTime,
    #[error("could not parse date-time string: {0}")]
    Parse(String),
}

impl ValidityInfo {
    pub fn contains(&self, moment: &DateTime<Utc>) -> bool {
        &self.valid_from <= moment && moment <= &self.valid_until
    }
}

fn datetime_to_value(dt: DateTime<Utc>) -> Value {
    Value::Tag(
        0,
        Box::new(Value::Text(
            dt.to_rfc3339_opts(SecondsFormat::Secs, true),
        )),
    )
}

fn value_to_datetime(v: Value) -> Result<DateTime<Utc>, Error> {
    let Value::Tag(0, inner) = v else {
        return Err(Error::NotADateTime);
    };
    let Value::Text(s) = *inner else {
        return Err(Error::NotADateTime);
    };
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Parse(e.to_string()))
}

impl From<ValidityInfo> for Value {
    fn from(v: ValidityInfo) -> Value {
        let mut map = vec![
            (Value::Text("signed".into()), datetime_to_value(v.signed)),
            (
                Value::Text("validFrom".into()),
                datetime_to_value(v.valid_from),
            ),
            (
                Value::Text("validUntil".into()),
                datetime_to_value(v.valid_until),
            ),
        ];
        if let Some(expected_update) = v.expected_update {
            map.push((
                Value::Text("expectedUpdate".into()),
                datetime_to_value(expected_update),
            ));
        }
        Value::Map(map)
    }
}

impl TryFrom<Value> for ValidityInfo {
    type Error = Error;

    fn try_from(v: Value) -> Result<Self, Error> {
        let Value::Map(map) = v else {
            return Err(Error::NotAMap);
        };
        let mut signed = None;
        let mut valid_from = None;
        let mut valid_until = None;
        let mut expected_update = None;
        for (k, v) in map {
            let Value::Text(key) = k else { continue };
            match key.as_str() {
                "signed" => signed = Some(value_to_datetime(v)?),
                "validFrom" => valid_from = Some(value_to_datetime(v)?),
                "validUntil" => valid_until = Some(value_to_datetime(v)?),
                "expectedUpdate" => expected_update = Some(value_to_datetime(v)?),
                _ => {}
            }
        }
        Ok(ValidityInfo {
            signed: signed.ok_or(Error::MissingField("signed"))?,
            valid_from: valid_from.ok_or(Error::MissingField("validFrom"))?,
            valid_until: valid_until.ok_or(Error::MissingField("validUntil"))?,
            expected_update,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cbor;
    use chrono::{Duration, SubsecRound};

    #[test]
    fn roundtrip() {
        let signed = Utc::now().trunc_subsecs(0);
        let info = ValidityInfo {
            signed,
            valid_from: signed,
            valid_until: signed + Duration::days(365),
            expected_update: None,
        };
        let bytes = cbor::to_vec(&info).unwrap();
        let back: ValidityInfo = cbor::from_slice(&bytes).unwrap();
        assert_eq!(info, back);
    }

    #[test]
    fn window_check() {
        let now = Utc::now();
        let info = ValidityInfo {
            signed: now - Duration::days(1),
            valid_from: now - Duration::days(1),
            valid_until: now + Duration::days(1),
            expected_update: None,
        };
        assert!(info.contains(&now));
        assert!(!info.contains(&(now + Duration::days(2))));
    }
}
