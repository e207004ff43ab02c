//! Album record model and its field-set encoding

use crate::common::{Error, Result};
use crate::store::FieldSet;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

pub const ID_FIELD: &str = "id";
pub const TITLE_FIELD: &str = "title";
pub const ARTIST_FIELD: &str = "artist";
pub const PRICE_FIELD: &str = "price";
pub const LIKES_FIELD: &str = "likes";

/// Album identifier, a non-negative decimal integer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlbumId(pub u64);

impl FromStr for AlbumId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        // Only plain digits: no sign, whitespace or exponent.
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::InvalidId(s.to_string()));
        }
        s.parse::<u64>()
            .map(AlbumId)
            .map_err(|_| Error::InvalidId(s.to_string()))
    }
}

impl fmt::Display for AlbumId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParsePriceError {
    #[error("price {0:?} is not a decimal amount")]
    Malformed(String),

    #[error("price {0:?} has more than two decimal places")]
    TooPrecise(String),

    #[error("price {0:?} is out of range")]
    OutOfRange(String),
}

/// Non-negative price with two decimal places, held in cents
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Price {
    cents: u64,
}

impl Price {
    pub fn from_cents(cents: u64) -> Self {
        Self { cents }
    }

    pub fn cents(&self) -> u64 {
        self.cents
    }
}

impl FromStr for Price {
    type Err = ParsePriceError;

    fn from_str(s: &str) -> std::result::Result<Self, ParsePriceError> {
        let malformed = || ParsePriceError::Malformed(s.to_string());
        let (whole, frac) = match s.split_once('.') {
            Some((whole, frac)) => (whole, frac),
            None => (s, ""),
        };
        if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
            return Err(malformed());
        }
        if !frac.bytes().all(|b| b.is_ascii_digit()) || (s.contains('.') && frac.is_empty()) {
            return Err(malformed());
        }
        if frac.len() > 2 {
            return Err(ParsePriceError::TooPrecise(s.to_string()));
        }

        let whole: u64 = whole
            .parse()
            .map_err(|_| ParsePriceError::OutOfRange(s.to_string()))?;
        let frac: u64 = match frac.len() {
            0 => 0,
            1 => frac.parse::<u64>().map_err(|_| malformed())? * 10,
            _ => frac.parse().map_err(|_| malformed())?,
        };
        whole
            .checked_mul(100)
            .and_then(|c| c.checked_add(frac))
            .map(Price::from_cents)
            .ok_or_else(|| ParsePriceError::OutOfRange(s.to_string()))
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.cents / 100, self.cents % 100)
    }
}

impl Serialize for Price {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Price {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Whole(u64),
            Float(f64),
        }

        let text = match Raw::deserialize(deserializer)? {
            Raw::Text(s) => s,
            Raw::Whole(n) => n.to_string(),
            // Catalog files write prices as TOML/JSON floats (4.95).
            Raw::Float(f) if f.is_finite() && f >= 0.0 => format!("{:.2}", f),
            Raw::Float(f) => return Err(serde::de::Error::custom(format!("invalid price {f}"))),
        };
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// One catalog entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Album {
    pub id: AlbumId,
    pub title: String,
    pub artist: String,
    pub price: Price,
    #[serde(default)]
    pub likes: u64,
}

impl Album {
    /// Encode as the record's field set
    pub fn to_fields(&self) -> FieldSet {
        vec![
            (ID_FIELD.to_string(), self.id.to_string()),
            (TITLE_FIELD.to_string(), self.title.clone()),
            (ARTIST_FIELD.to_string(), self.artist.clone()),
            (PRICE_FIELD.to_string(), self.price.to_string()),
            (LIKES_FIELD.to_string(), self.likes.to_string()),
        ]
    }

    /// Decode a record's field set. Unknown fields are ignored.
    pub fn from_fields(fields: FieldSet) -> Result<Album> {
        let mut id = None;
        let mut title = None;
        let mut artist = None;
        let mut price = None;
        let mut likes = None;

        for (field, value) in fields {
            match field.as_str() {
                ID_FIELD => id = Some(value),
                TITLE_FIELD => title = Some(value),
                ARTIST_FIELD => artist = Some(value),
                PRICE_FIELD => price = Some(value),
                LIKES_FIELD => likes = Some(value),
                _ => {}
            }
        }

        let missing = |name: &str| Error::Protocol(format!("album record has no {name:?} field"));
        let id = id.ok_or_else(|| missing(ID_FIELD))?;
        let price = price.ok_or_else(|| missing(PRICE_FIELD))?;
        let likes = likes.ok_or_else(|| missing(LIKES_FIELD))?;

        Ok(Album {
            id: id
                .parse()
                .map_err(|_| Error::Protocol(format!("album record has id {id:?}")))?,
            title: title.ok_or_else(|| missing(TITLE_FIELD))?,
            artist: artist.ok_or_else(|| missing(ARTIST_FIELD))?,
            price: price
                .parse()
                .map_err(|e: ParsePriceError| Error::Protocol(e.to_string()))?,
            likes: likes
                .parse()
                .map_err(|_| Error::Protocol(format!("album record has likes {likes:?}")))?,
        })
    }
}

impl fmt::Display for Album {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} by {}: £{} [{} likes]",
            self.title, self.artist, self.price, self.likes
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rumours() -> Album {
        Album {
            id: AlbumId(3),
            title: "Rumours".into(),
            artist: "Fleetwood Mac".into(),
            price: "7.95".parse().unwrap(),
            likes: 12,
        }
    }

    #[test]
    fn test_parse_album_id() {
        assert_eq!("2".parse::<AlbumId>().unwrap(), AlbumId(2));
        assert_eq!("0042".parse::<AlbumId>().unwrap(), AlbumId(42));
        for bad in ["", "-1", "+1", " 2", "2a", "1e3", "99999999999999999999"] {
            assert!(
                matches!(bad.parse::<AlbumId>(), Err(Error::InvalidId(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_parse_price() {
        assert_eq!("4.95".parse::<Price>().unwrap().cents(), 495);
        assert_eq!("5".parse::<Price>().unwrap().cents(), 500);
        assert_eq!("5.9".parse::<Price>().unwrap().cents(), 590);
        assert_eq!("0.05".parse::<Price>().unwrap().to_string(), "0.05");
        assert_eq!(Price::from_cents(590).to_string(), "5.90");

        assert!(matches!("-1".parse::<Price>(), Err(ParsePriceError::Malformed(_))));
        assert!(matches!("4.".parse::<Price>(), Err(ParsePriceError::Malformed(_))));
        assert!(matches!(".5".parse::<Price>(), Err(ParsePriceError::Malformed(_))));
        assert!(matches!("4.955".parse::<Price>(), Err(ParsePriceError::TooPrecise(_))));
    }

    #[test]
    fn test_price_deserialize_from_number_or_text() {
        #[derive(Deserialize)]
        struct Row {
            price: Price,
        }
        let row: Row = serde_json::from_str(r#"{"price": 4.95}"#).unwrap();
        assert_eq!(row.price.cents(), 495);
        let row: Row = serde_json::from_str(r#"{"price": "5.95"}"#).unwrap();
        assert_eq!(row.price.cents(), 595);
        let row: Row = serde_json::from_str(r#"{"price": 7}"#).unwrap();
        assert_eq!(row.price.cents(), 700);
        assert!(serde_json::from_str::<Row>(r#"{"price": -1.0}"#).is_err());
    }

    #[test]
    fn test_fields_roundtrip_and_display() {
        let album = rumours();
        let decoded = Album::from_fields(album.to_fields()).unwrap();
        assert_eq!(decoded, album);
        assert_eq!(album.to_string(), "Rumours by Fleetwood Mac: £7.95 [12 likes]");
    }

    #[test]
    fn test_from_fields_rejects_bad_records() {
        let mut fields = rumours().to_fields();
        fields.retain(|(f, _)| f != LIKES_FIELD);
        assert!(matches!(Album::from_fields(fields), Err(Error::Protocol(_))));

        let mut fields = rumours().to_fields();
        for (f, v) in fields.iter_mut() {
            if f == PRICE_FIELD {
                *v = "cheap".into();
            }
        }
        assert!(matches!(Album::from_fields(fields), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_album_json_shape() {
        let json = serde_json::to_value(rumours()).unwrap();
        assert_eq!(json["id"], 3);
        assert_eq!(json["price"], "7.95");
        assert_eq!(json["likes"], 12);
    }
}
