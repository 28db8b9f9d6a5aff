//! Wire format of the token feed.
//!
//! Every frame is `{"room": <name>, "content": <payload>, "created_at": <iso8601>}`.
//! `new_pairs` carries one object per instrument; `update_pulse_v2` carries a list of
//! positional rows, decoded once here into [`PulseRow`].

use crate::event::TokenEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smol_str::SmolStr;
use tokio::time::Instant;

/// Feed rooms the consumer joins.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Room {
    NewPairs,
    PulseUpdates,
}

impl Room {
    pub const ALL: [Room; 2] = [Room::NewPairs, Room::PulseUpdates];

    pub fn as_str(&self) -> &'static str {
        match self {
            Room::NewPairs => "new_pairs",
            Room::PulseUpdates => "update_pulse_v2",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "new_pairs" => Some(Room::NewPairs),
            "update_pulse_v2" => Some(Room::PulseUpdates),
            _ => None,
        }
    }
}

impl std::fmt::Display for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JoinRequest<'a> {
    pub action: &'a str,
    pub room: &'a str,
}

impl JoinRequest<'static> {
    pub fn new(room: Room) -> Self {
        Self {
            action: "join",
            room: room.as_str(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FeedFrame {
    pub room: Option<String>,
    #[serde(default)]
    pub content: Value,
    pub created_at: Option<String>,
}

impl FeedFrame {
    pub fn room(&self) -> Option<Room> {
        self.room.as_deref().and_then(Room::from_name)
    }
}

/// Content of a `new_pairs` frame. Unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct NewPairContent {
    pub token_address: Option<SmolStr>,
    pub pair_address: Option<SmolStr>,
    pub token_name: Option<SmolStr>,
    pub token_ticker: Option<SmolStr>,
    pub deployer_address: Option<SmolStr>,
    pub twitter: Option<String>,
    pub token_uri: Option<String>,
    pub protocol: Option<SmolStr>,
}

fn non_empty<T: AsRef<str>>(value: Option<T>) -> Option<T> {
    value.filter(|value| !value.as_ref().trim().is_empty())
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|timestamp| timestamp.with_timezone(&Utc))
}

impl NewPairContent {
    /// Build a [`TokenEvent`], or `None` if the token or pair address is missing.
    pub fn into_event(self, created_at: Option<&str>, received_at: Instant) -> Option<TokenEvent> {
        Some(TokenEvent {
            token_address: non_empty(self.token_address)?,
            pair_address: non_empty(self.pair_address)?,
            token_name: non_empty(self.token_name).unwrap_or_else(|| SmolStr::new("Unknown")),
            token_ticker: non_empty(self.token_ticker).unwrap_or_else(|| SmolStr::new("???")),
            deployer_address: non_empty(self.deployer_address),
            social_url: non_empty(self.twitter),
            metadata_uri: non_empty(self.token_uri),
            protocol: non_empty(self.protocol).unwrap_or_else(|| SmolStr::new("unknown")),
            created_at: created_at.and_then(parse_timestamp),
            received_at,
        })
    }
}

/// Positional offsets consumed from an `update_pulse_v2` row. All other fields are ignored.
mod offset {
    pub const TOKEN_ADDRESS: usize = 0;
    pub const PAIR_ADDRESS: usize = 1;
    pub const OBSERVED_AT: usize = 30;
    pub const MIGRATED: usize = 33;
    pub const TOTAL: usize = 41;
}

/// Decoded migration snapshot row.
#[derive(Debug, Clone, PartialEq)]
pub struct PulseRow {
    pub token_address: SmolStr,
    pub pair_address: SmolStr,
    pub observed_at: DateTime<Utc>,
    pub migrated: u64,
    pub total: u64,
}

fn count(value: &Value) -> u64 {
    value
        .as_u64()
        .or_else(|| value.as_f64().filter(|count| *count >= 0.0).map(|count| count as u64))
        .unwrap_or(0)
}

impl PulseRow {
    /// Decode one row, skipping rows that are too short or lack a valid timestamp.
    pub fn decode(row: &Value) -> Option<Self> {
        let fields = row.as_array().filter(|fields| fields.len() > offset::TOTAL)?;

        let address = |index: usize| {
            fields[index]
                .as_str()
                .filter(|address| !address.is_empty())
                .map(SmolStr::new)
        };

        Some(Self {
            token_address: address(offset::TOKEN_ADDRESS)?,
            pair_address: address(offset::PAIR_ADDRESS)?,
            observed_at: fields[offset::OBSERVED_AT].as_str().and_then(parse_timestamp)?,
            migrated: count(&fields[offset::MIGRATED]),
            total: count(&fields[offset::TOTAL]),
        })
    }

    pub fn decode_all(content: &Value) -> Vec<Self> {
        content
            .as_array()
            .map(|rows| rows.iter().filter_map(Self::decode).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    /// Build a snapshot row with the consumed offsets populated.
    pub(crate) fn pulse_row(token: &str, pair: &str, observed_at: &str, migrated: u64, total: u64) -> Value {
        let mut row = vec![Value::Null; offset::TOTAL + 1];
        row[offset::TOKEN_ADDRESS] = json!(token);
        row[offset::PAIR_ADDRESS] = json!(pair);
        row[offset::OBSERVED_AT] = json!(observed_at);
        row[offset::MIGRATED] = json!(migrated);
        row[offset::TOTAL] = json!(total);
        Value::Array(row)
    }

    #[test]
    fn test_join_request() {
        let actual = serde_json::to_string(&JoinRequest::new(Room::PulseUpdates)).unwrap();
        assert_eq!(actual, r#"{"action":"join","room":"update_pulse_v2"}"#);
    }

    #[test]
    fn test_pulse_row_decode() {
        struct TestCase {
            input: Value,
            expected: Option<PulseRow>,
        }

        let observed_at = "2025-11-29T12:00:00.500Z";

        let tests = vec![
            TestCase {
                // TC0: valid row
                input: pulse_row("token", "pair", observed_at, 3, 12),
                expected: Some(PulseRow {
                    token_address: SmolStr::new("token"),
                    pair_address: SmolStr::new("pair"),
                    observed_at: parse_timestamp(observed_at).unwrap(),
                    migrated: 3,
                    total: 12,
                }),
            },
            TestCase {
                // TC1: row too short
                input: json!(["token", "pair"]),
                expected: None,
            },
            TestCase {
                // TC2: invalid timestamp
                input: pulse_row("token", "pair", "yesterday", 3, 12),
                expected: None,
            },
            TestCase {
                // TC3: not a list
                input: json!({"token": "x"}),
                expected: None,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = PulseRow::decode(&test.input);
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_new_pair_content_into_event() {
        let content: NewPairContent = serde_json::from_value(json!({
            "token_address": "mint",
            "pair_address": "pair",
            "token_name": "Pulse",
            "token_ticker": "PLS",
            "deployer_address": "dev",
            "twitter": "",
            "token_uri": "https://ipfs.io/meta.json",
            "protocol": "Pump V1",
            "supply": 1000000000
        }))
        .unwrap();

        let event = content
            .into_event(Some("2025-11-29T12:00:00Z"), Instant::now())
            .unwrap();

        assert_eq!(event.token_address, "mint");
        assert_eq!(event.token_ticker, "PLS");
        assert_eq!(event.social_url, None);
        assert_eq!(event.metadata_uri.as_deref(), Some("https://ipfs.io/meta.json"));
        assert_eq!(event.protocol, "Pump V1");
        assert!(event.created_at.is_some());

        let missing_pair = NewPairContent {
            token_address: Some(SmolStr::new("mint")),
            ..Default::default()
        };
        assert_eq!(missing_pair.into_event(None, Instant::now()), None);
    }
}
