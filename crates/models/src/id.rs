/// Id is the 64-bit identity of a control-plane entity. It renders as 16
/// lowercase hex characters, and parses that form with or without the
/// colon-grouped spelling (`0017:2aff:0b31:9c01`) some tooling emits.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Id(u64);

#[derive(Debug, thiserror::Error)]
pub enum ParseIdError {
    #[error("an id is 16 hex characters, got {0}")]
    WrongLength(usize),
    #[error("invalid hex")]
    InvalidHex(#[from] std::num::ParseIntError),
}

impl Id {
    pub const ZERO: Id = Id(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::str::FromStr for Id {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let compact: String = s.chars().filter(|c| *c != ':').collect();
        if compact.len() != 16 {
            return Err(ParseIdError::WrongLength(compact.len()));
        }
        Ok(Id(u64::from_str_radix(&compact, 16)?))
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl std::fmt::Debug for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        <Self as std::fmt::Display>::fmt(self, f)
    }
}

impl serde::Serialize for Id {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Id {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;
        let raw = std::borrow::Cow::<'de, str>::deserialize(deserializer)?;
        raw.parse()
            .map_err(|err| D::Error::custom(format!("invalid id: {err}")))
    }
}

/// IdGenerator creates Ids that are unique within this process, and are
/// vanishingly unlikely to collide across processes when each process uses
/// a distinct shard.
#[derive(Debug, Clone)]
pub struct IdGenerator {
    shard: u16,
    seq: u32,
}

impl IdGenerator {
    pub fn new(shard: u16) -> Self {
        Self { shard, seq: 0 }
    }

    pub fn next(&mut self) -> Id {
        // Layout: 6 bytes of millisecond timestamp, then the low 10 bits of
        // the shard XOR'd with a wrapping sequence in the final 2 bytes.
        let millis = chrono::Utc::now().timestamp_millis() as u64;
        self.seq = self.seq.wrapping_add(1);

        let tail = (self.shard as u32).wrapping_shl(6) ^ self.seq;
        Id((millis << 16) | (tail as u64 & 0xffff))
    }
}

// Ids are stored as their 16-character hex rendering.
#[cfg(feature = "sqlx-support")]
mod sqlx_support {
    use super::Id;

    impl sqlx::Type<sqlx::Postgres> for Id {
        fn type_info() -> sqlx::postgres::PgTypeInfo {
            <String as sqlx::Type<sqlx::Postgres>>::type_info()
        }
        fn compatible(ty: &sqlx::postgres::PgTypeInfo) -> bool {
            <String as sqlx::Type<sqlx::Postgres>>::compatible(ty)
        }
    }

    impl sqlx::Encode<'_, sqlx::Postgres> for Id {
        fn encode_by_ref(
            &self,
            buf: &mut sqlx::postgres::PgArgumentBuffer,
        ) -> sqlx::encode::IsNull {
            <String as sqlx::Encode<'_, sqlx::Postgres>>::encode_by_ref(&self.to_string(), buf)
        }
    }

    impl<'r> sqlx::Decode<'r, sqlx::Postgres> for Id {
        fn decode(
            value: sqlx::postgres::PgValueRef<'r>,
        ) -> Result<Self, sqlx::error::BoxDynError> {
            let s = <&str as sqlx::Decode<'r, sqlx::Postgres>>::decode(value)?;
            Ok(s.parse()?)
        }
    }
}

#[cfg(test)]
mod test {
    use super::{Id, IdGenerator, ParseIdError};

    #[test]
    fn test_id_round_trip() {
        let id = Id::new(0x0c22);
        let hex = id.to_string();
        assert_eq!(hex, "0000000000000c22");
        assert_eq!(hex.parse::<Id>().unwrap(), id);
    }

    #[test]
    fn test_parse_accepts_colon_groups() {
        let id: Id = "0017:2aff:0b31:9c01".parse().unwrap();
        assert_eq!(id, Id::new(0x00172aff0b319c01));
        assert_eq!(id.to_string(), "00172aff0b319c01");
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(matches!(
            "0c22".parse::<Id>(),
            Err(ParseIdError::WrongLength(4))
        ));
        assert!(matches!(
            "zzzzzzzzzzzzzzzz".parse::<Id>(),
            Err(ParseIdError::InvalidHex(_))
        ));
    }

    #[test]
    fn test_generator_produces_distinct_ids() {
        let mut gen = IdGenerator::new(7);
        let a = gen.next();
        let b = gen.next();
        assert_ne!(a, b);
        assert!(!a.is_zero());
        assert!(Id::ZERO.is_zero());
    }
}
