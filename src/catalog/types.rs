use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ColumnType {
    TinyInt { unsigned: bool },
    SmallInt { unsigned: bool },
    MediumInt { unsigned: bool },
    Int { unsigned: bool },
    BigInt { unsigned: bool },
    Bit { width: u8 },
    Float,
    Double,
    Varchar { max_len: u32 },
    Text,
    Blob,
    Json,
    Date,
    Datetime,
    Timestamp,
    Year,
}

/// Coarse grouping used by the cast matrix.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TypeClass {
    Integer,
    Bit,
    Real,
    String,
    Binary,
    Json,
    Temporal,
    Year,
}

impl ColumnType {
    pub const fn int() -> Self {
        ColumnType::Int { unsigned: false }
    }

    pub const fn bigint() -> Self {
        ColumnType::BigInt { unsigned: false }
    }

    pub const fn tinyint() -> Self {
        ColumnType::TinyInt { unsigned: false }
    }

    pub const fn varchar(max_len: u32) -> Self {
        ColumnType::Varchar { max_len }
    }

    pub fn class(&self) -> TypeClass {
        match self {
            ColumnType::TinyInt { .. }
            | ColumnType::SmallInt { .. }
            | ColumnType::MediumInt { .. }
            | ColumnType::Int { .. }
            | ColumnType::BigInt { .. } => TypeClass::Integer,
            ColumnType::Bit { .. } => TypeClass::Bit,
            ColumnType::Float | ColumnType::Double => TypeClass::Real,
            ColumnType::Varchar { .. } | ColumnType::Text => TypeClass::String,
            ColumnType::Blob => TypeClass::Binary,
            ColumnType::Json => TypeClass::Json,
            ColumnType::Date | ColumnType::Datetime | ColumnType::Timestamp => {
                TypeClass::Temporal
            }
            ColumnType::Year => TypeClass::Year,
        }
    }

    pub fn is_integer(&self) -> bool {
        self.class() == TypeClass::Integer
    }

    pub fn is_unsigned(&self) -> bool {
        match self {
            ColumnType::TinyInt { unsigned }
            | ColumnType::SmallInt { unsigned }
            | ColumnType::MediumInt { unsigned }
            | ColumnType::Int { unsigned }
            | ColumnType::BigInt { unsigned } => *unsigned,
            ColumnType::Bit { .. } => true,
            _ => false,
        }
    }

    /// Storage width in bytes for integer types.
    pub fn int_width(&self) -> Option<u8> {
        match self {
            ColumnType::TinyInt { .. } => Some(1),
            ColumnType::SmallInt { .. } => Some(2),
            ColumnType::MediumInt { .. } => Some(3),
            ColumnType::Int { .. } => Some(4),
            ColumnType::BigInt { .. } => Some(8),
            _ => None,
        }
    }

    /// Inclusive value range for integer and bit types.
    pub fn int_bounds(&self) -> Option<(i128, i128)> {
        if let ColumnType::Bit { width } = self {
            let width = (*width).clamp(1, 64) as u32;
            return Some((0, (1i128 << width) - 1));
        }
        let bits = u32::from(self.int_width()?) * 8;
        if self.is_unsigned() {
            Some((0, (1i128 << bits) - 1))
        } else {
            Some((-(1i128 << (bits - 1)), (1i128 << (bits - 1)) - 1))
        }
    }

    /// Name used in "Incorrect <type> value" messages.
    pub fn value_kind(&self) -> &'static str {
        match self.class() {
            TypeClass::Integer | TypeClass::Bit | TypeClass::Year => "integer",
            TypeClass::Real => "double",
            TypeClass::String | TypeClass::Binary => "string",
            TypeClass::Json => "json",
            TypeClass::Temporal => match self {
                ColumnType::Date => "date",
                ColumnType::Timestamp => "timestamp",
                _ => "datetime",
            },
        }
    }

    /// The column type a bare literal of this datum kind naturally has.
    pub fn natural_for(value: &Datum) -> ColumnType {
        match value {
            Datum::Null | Datum::Int(_) => ColumnType::bigint(),
            Datum::UInt(_) => ColumnType::BigInt { unsigned: true },
            Datum::Float(_) => ColumnType::Double,
            Datum::Text(_) => ColumnType::Text,
            Datum::Bytes(_) => ColumnType::Blob,
            Datum::Json(_) => ColumnType::Json,
            Datum::Time(_) => ColumnType::Datetime,
        }
    }

    pub fn zero_value(&self) -> Datum {
        match self.class() {
            TypeClass::Integer | TypeClass::Year => {
                if self.is_unsigned() {
                    Datum::UInt(0)
                } else {
                    Datum::Int(0)
                }
            }
            TypeClass::Bit => Datum::UInt(0),
            TypeClass::Real => Datum::Float(0.0),
            TypeClass::String => Datum::Text(CompactString::default()),
            TypeClass::Binary => Datum::Bytes(Vec::new()),
            TypeClass::Json => Datum::Json("null".into()),
            TypeClass::Temporal => Datum::Time(0),
        }
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let unsigned_suffix = if self.is_unsigned() && self.is_integer() {
            " unsigned"
        } else {
            ""
        };
        match self {
            ColumnType::TinyInt { .. } => write!(f, "tinyint{unsigned_suffix}"),
            ColumnType::SmallInt { .. } => write!(f, "smallint{unsigned_suffix}"),
            ColumnType::MediumInt { .. } => write!(f, "mediumint{unsigned_suffix}"),
            ColumnType::Int { .. } => write!(f, "int{unsigned_suffix}"),
            ColumnType::BigInt { .. } => write!(f, "bigint{unsigned_suffix}"),
            ColumnType::Bit { width } => write!(f, "bit({width})"),
            ColumnType::Float => write!(f, "float"),
            ColumnType::Double => write!(f, "double"),
            ColumnType::Varchar { max_len } => write!(f, "varchar({max_len})"),
            ColumnType::Text => write!(f, "text"),
            ColumnType::Blob => write!(f, "blob"),
            ColumnType::Json => write!(f, "json"),
            ColumnType::Date => write!(f, "date"),
            ColumnType::Datetime => write!(f, "datetime"),
            ColumnType::Timestamp => write!(f, "timestamp"),
            ColumnType::Year => write!(f, "year"),
        }
    }
}

/// A single stored cell. Temporal values are microseconds since the Unix epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Datum {
    Null,
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(CompactString),
    Bytes(Vec<u8>),
    Json(CompactString),
    Time(i64),
}

impl Datum {
    pub fn text(value: impl Into<CompactString>) -> Self {
        Datum::Text(value.into())
    }

    pub fn json(value: impl Into<CompactString>) -> Self {
        Datum::Json(value.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    pub fn as_i128(&self) -> Option<i128> {
        match self {
            Datum::Int(v) => Some(i128::from(*v)),
            Datum::UInt(v) => Some(i128::from(*v)),
            _ => None,
        }
    }

    fn kind_rank(&self) -> u8 {
        match self {
            Datum::Null => 0,
            Datum::Int(_) => 1,
            Datum::UInt(_) => 2,
            Datum::Float(_) => 3,
            Datum::Time(_) => 4,
            Datum::Text(_) => 5,
            Datum::Json(_) => 6,
            Datum::Bytes(_) => 7,
        }
    }
}

impl std::fmt::Display for Datum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Datum::Null => write!(f, "NULL"),
            Datum::Int(v) => write!(f, "{v}"),
            Datum::UInt(v) => write!(f, "{v}"),
            Datum::Float(v) => write!(f, "{v}"),
            Datum::Text(v) | Datum::Json(v) => write!(f, "{v}"),
            Datum::Bytes(v) => write!(f, "{}", String::from_utf8_lossy(v)),
            Datum::Time(v) => write!(f, "{}", crate::cast::temporal::format_datetime(*v)),
        }
    }
}

impl PartialEq for Datum {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Datum {}

impl PartialOrd for Datum {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Datum {
    fn cmp(&self, other: &Self) -> Ordering {
        let rank_cmp = self.kind_rank().cmp(&other.kind_rank());
        if rank_cmp != Ordering::Equal {
            return rank_cmp;
        }

        match (self, other) {
            (Datum::Null, Datum::Null) => Ordering::Equal,
            (Datum::Int(a), Datum::Int(b)) => a.cmp(b),
            (Datum::UInt(a), Datum::UInt(b)) => a.cmp(b),
            (Datum::Float(a), Datum::Float(b)) => a.total_cmp(b),
            (Datum::Time(a), Datum::Time(b)) => a.cmp(b),
            (Datum::Text(a), Datum::Text(b)) => a.cmp(b),
            (Datum::Json(a), Datum::Json(b)) => a.cmp(b),
            (Datum::Bytes(a), Datum::Bytes(b)) => a.cmp(b),
            _ => Ordering::Equal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ColumnType, Datum, TypeClass};
    use proptest::prelude::*;

    fn arb_datum() -> impl Strategy<Value = Datum> {
        prop_oneof![
            any::<i64>().prop_map(Datum::Int),
            any::<u64>().prop_map(Datum::UInt),
            any::<i64>().prop_map(Datum::Time),
            any::<f64>()
                .prop_filter("finite float only", |v| v.is_finite())
                .prop_map(Datum::Float),
            "\\PC{0,32}".prop_map(Datum::text),
            "\\PC{0,32}".prop_map(Datum::json),
            prop::collection::vec(any::<u8>(), 0..64).prop_map(Datum::Bytes),
            Just(Datum::Null),
        ]
    }

    proptest! {
        #[test]
        fn ordering_survives_row_encoding(a in arb_datum(), b in arb_datum()) {
            let a2: Datum = rmp_serde::from_slice(&rmp_serde::to_vec(&a).expect("encode")).expect("decode");
            let b2: Datum = rmp_serde::from_slice(&rmp_serde::to_vec(&b).expect("encode")).expect("decode");
            prop_assert_eq!(a.cmp(&b), a2.cmp(&b2));
        }
    }

    #[test]
    fn integer_bounds_follow_width_and_sign() {
        assert_eq!(ColumnType::tinyint().int_bounds(), Some((-128, 127)));
        assert_eq!(
            ColumnType::TinyInt { unsigned: true }.int_bounds(),
            Some((0, 255))
        );
        assert_eq!(
            ColumnType::MediumInt { unsigned: false }.int_bounds(),
            Some((-8_388_608, 8_388_607))
        );
        assert_eq!(
            ColumnType::bigint().int_bounds(),
            Some((i128::from(i64::MIN), i128::from(i64::MAX)))
        );
        assert_eq!(ColumnType::Bit { width: 3 }.int_bounds(), Some((0, 7)));
        assert_eq!(ColumnType::Text.int_bounds(), None);
    }

    #[test]
    fn type_names_render_like_sql() {
        assert_eq!(ColumnType::Int { unsigned: true }.to_string(), "int unsigned");
        assert_eq!(ColumnType::varchar(20).to_string(), "varchar(20)");
        assert_eq!(ColumnType::Json.class(), TypeClass::Json);
        assert_eq!(ColumnType::Datetime.value_kind(), "datetime");
    }
}
